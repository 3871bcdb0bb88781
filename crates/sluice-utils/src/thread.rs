use core_affinity::CoreId;
use tracing::warn;

/// What a stage thread does for a living decides how the scheduler should
/// treat it. A packet stage that gets preempted mid-burst loses datagrams
/// the sender will never repeat, so those ask for realtime scheduling;
/// disk streamers are throughput-bound and recover lost time on their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    /// Pulls datagrams off the wire; a scheduling hiccup here is data loss.
    PacketReader,
    /// Paces datagrams onto the wire; less fragile than the reader but
    /// still latency-bound.
    PacketWriter,
    /// Streams blocks between queues and spindles; backpressure absorbs
    /// scheduling jitter.
    DiskStreamer,
}

impl StageKind {
    /// `SCHED_FIFO` priority this kind of stage asks for, if any. The
    /// reader outranks the writer: refilling a socket buffer is urgent,
    /// draining one can wait a tick.
    fn rt_priority(self) -> Option<i32> {
        match self {
            Self::PacketReader => Some(75),
            Self::PacketWriter => Some(60),
            Self::DiskStreamer => None,
        }
    }
}

/// Configure scheduling for the calling stage thread: pin it when a core
/// was configured, and request the realtime policy its kind calls for.
///
/// The realtime part needs CAP_SYS_NICE; when that is missing the thread
/// simply stays under the default scheduler and the transfer runs with
/// less margin.
pub fn boot_stage(kind: StageKind, core: Option<usize>) {
    if let Some(core) = core {
        if !core_affinity::set_for_current(CoreId { id: core }) {
            warn!(core, ?kind, "couldn't pin stage thread");
        }
    }
    if let Some(prio) = kind.rt_priority() {
        set_realtime(kind, prio);
    }
}

#[cfg(target_os = "linux")]
fn set_realtime(kind: StageKind, prio: i32) {
    let param = libc::sched_param { sched_priority: prio };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        warn!(?kind, prio, "no SCHED_FIFO for this stage, staying best-effort");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_realtime(kind: StageKind, _prio: i32) {
    warn!(?kind, "realtime scheduling only available on linux");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_stages_outrank_disk_stages() {
        assert_eq!(StageKind::PacketReader.rt_priority(), Some(75));
        assert_eq!(StageKind::PacketWriter.rt_priority(), Some(60));
        assert_eq!(StageKind::DiskStreamer.rt_priority(), None);
        assert!(
            StageKind::PacketReader.rt_priority() > StageKind::PacketWriter.rt_priority()
        );
    }
}
