use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use sluice_communication::{BlockPool, BroadcastHub};
use sluice_format::{FormatError, FrameGeometry, NetParms, TrackFormat};
use sluice_net::SenderStats;
use sluice_vbs::{ScanDir, ScanPointer, VbsTable};
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::info;

use crate::{
    chain::{Chain, StepHandle},
    errorspool::ErrorSpool,
    steps::{DiskReaderArgs, FifoReaderArgs, FillArgs},
};

/// Which pipeline owns the hardware right now. Exactly one transfer may run
/// at a time; every command handler checks this gate before touching
/// anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum TransferMode {
    #[strum(serialize = "no_transfer")]
    NoTransfer,
    #[strum(serialize = "in2net")]
    In2Net,
    #[strum(serialize = "in2disk")]
    In2Disk,
    #[strum(serialize = "disk2net")]
    Disk2Net,
    #[strum(serialize = "net2disk")]
    Net2Disk,
    #[strum(serialize = "net2out")]
    Net2Out,
    #[strum(serialize = "fill2net")]
    Fill2Net,
    #[strum(serialize = "spill2net")]
    Spill2Net,
    #[strum(serialize = "bankswitch")]
    BankSwitch,
}

impl TransferMode {
    /// While a bank switch is in flight the disk layout is in motion;
    /// conservative handlers refuse anything touching it.
    pub fn disks_unavailable(self) -> bool {
        self == Self::BankSwitch
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModeError {
    #[error("transfer {current} in progress")]
    Busy { current: TransferMode },
}

/// Selected track format plus the knobs needed to derive frame geometry.
#[derive(Clone, Debug, Default)]
pub struct DataFormat {
    pub format: Option<TrackFormat>,
    pub ntrack: u32,
    pub vdif_framesize: Option<usize>,
}

impl DataFormat {
    pub fn geometry(&self) -> Result<Option<FrameGeometry>, FormatError> {
        self.format
            .map(|f| f.geometry(self.ntrack, self.vdif_framesize))
            .transpose()
    }
}

/// Stage handles a command handler may need to reach while its transfer
/// runs; one variant per transfer kind, matching the chain that was built.
pub enum TransferControls {
    Fill2Net { fill: StepHandle<FillArgs> },
    Disk2Net { disk: StepHandle<DiskReaderArgs> },
    Net2Disk,
    Record { source: StepHandle<FifoReaderArgs>, scan: ScanPointer },
}

/// The running pipeline and the handles to steer it.
pub struct ActiveTransfer {
    pub mode: TransferMode,
    pub chain: Chain,
    pub controls: TransferControls,
}

/// Process-wide state: the transfer-mode gate, the shared parameter
/// objects, the broadcast hub, per-sender statistics and the error spool.
///
/// Netparms and data format are only written while no transfer runs (the
/// gate enforces it), and read freely by running stages.
pub struct Runtime {
    transfermode: Mutex<TransferMode>,
    active: Mutex<Option<ActiveTransfer>>,
    pub netparms: Mutex<NetParms>,
    pub dataformat: Mutex<DataFormat>,
    pub hub: Arc<BroadcastHub>,
    pub errors: Arc<ErrorSpool>,
    pub senders: Arc<SenderStats>,
    pub vbs: Arc<VbsTable>,
    pub scandir: Mutex<ScanDir>,
    pub itcp_id: Mutex<String>,
    /// `bank_switch=on`: switch to the other bank when one fills up.
    pub bank_auto: AtomicBool,
    pools: Mutex<Vec<(String, BlockPool)>>,
    /// Cap on blocks per transfer pool, from configuration.
    pub pool_cap: usize,
}

impl Runtime {
    pub fn new(pool_cap: usize) -> Self {
        Self {
            transfermode: Mutex::new(TransferMode::NoTransfer),
            active: Mutex::new(None),
            netparms: Mutex::new(NetParms::default()),
            dataformat: Mutex::new(DataFormat { ntrack: 32, ..DataFormat::default() }),
            hub: Arc::new(BroadcastHub::new()),
            errors: Arc::new(ErrorSpool::new()),
            senders: Arc::new(SenderStats::new()),
            vbs: Arc::new(VbsTable::new()),
            scandir: Mutex::new(ScanDir::new(1)),
            itcp_id: Mutex::new(String::new()),
            bank_auto: AtomicBool::new(false),
            pools: Mutex::new(Vec::new()),
            pool_cap,
        }
    }

    pub fn transfermode(&self) -> TransferMode {
        *self.transfermode.lock().unwrap()
    }

    /// Atomically move the gate from `from` to `to`; anything else is busy.
    pub fn try_transition(
        &self,
        from: TransferMode,
        to: TransferMode,
    ) -> Result<(), ModeError> {
        let mut mode = self.transfermode.lock().unwrap();
        if *mode != from {
            return Err(ModeError::Busy { current: *mode });
        }
        info!(from = %*mode, %to, "transfer mode");
        *mode = to;
        Ok(())
    }

    /// Claim the gate for a new transfer.
    pub fn claim(&self, to: TransferMode) -> Result<(), ModeError> {
        self.try_transition(TransferMode::NoTransfer, to)
    }

    /// Back to idle, dropping per-transfer bookkeeping.
    pub fn release(&self) {
        *self.transfermode.lock().unwrap() = TransferMode::NoTransfer;
        self.pools.lock().unwrap().clear();
    }

    pub fn install_active(&self, transfer: ActiveTransfer) {
        *self.active.lock().unwrap() = Some(transfer);
    }

    pub fn take_active(&self) -> Option<ActiveTransfer> {
        self.active.lock().unwrap().take()
    }

    /// Look at the running transfer without taking it down.
    pub fn with_active<R>(
        &self,
        f: impl FnOnce(Option<&mut ActiveTransfer>) -> R,
    ) -> R {
        f(self.active.lock().unwrap().as_mut())
    }

    /// Transfer pools register themselves so `memstat?` can report them.
    pub fn register_pool(&self, label: &str, pool: &BlockPool) {
        self.pools.lock().unwrap().push((label.to_string(), pool.clone()));
    }

    /// `(label, blocksize, allocated, outstanding)` per registered pool.
    pub fn pool_stats(&self) -> Vec<(String, usize, usize, usize)> {
        self.pools
            .lock()
            .unwrap()
            .iter()
            .map(|(label, p)| (label.clone(), p.blocksize(), p.allocated(), p.outstanding()))
            .collect()
    }

    pub fn current_geometry(&self) -> Result<Option<FrameGeometry>, FormatError> {
        self.dataformat.lock().unwrap().geometry()
    }

    pub fn bank_auto(&self) -> bool {
        self.bank_auto.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gate_admits_one_transfer() {
        let rte = Runtime::new(1024);
        assert_eq!(rte.transfermode(), TransferMode::NoTransfer);

        rte.claim(TransferMode::Fill2Net).unwrap();
        assert_eq!(
            rte.claim(TransferMode::Disk2Net),
            Err(ModeError::Busy { current: TransferMode::Fill2Net })
        );

        // same-mode sub-commands pass through the from == current check
        rte.try_transition(TransferMode::Fill2Net, TransferMode::Fill2Net).unwrap();

        rte.release();
        rte.claim(TransferMode::Disk2Net).unwrap();
    }

    #[test]
    fn mode_names_follow_the_command_set() {
        assert_eq!(TransferMode::NoTransfer.to_string(), "no_transfer");
        assert_eq!(TransferMode::Fill2Net.to_string(), "fill2net");
        assert_eq!("net2disk".parse::<TransferMode>().unwrap(), TransferMode::Net2Disk);
        assert!(TransferMode::BankSwitch.disks_unavailable());
    }
}
