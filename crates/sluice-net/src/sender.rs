use std::{net::SocketAddr, sync::Mutex};

use indexmap::IndexMap;
use tracing::trace;

/// How many recent sequence numbers each sender keeps for NACK building.
const PSN_WINDOW: usize = 32;
/// Never name more than this many missing packets in one NACK.
const NACK_CAP: usize = 16;

/// Sequence numbers a NACK asks the sender to repeat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nack {
    pub missing: Vec<u64>,
}

/// First word of a NACK datagram; no data packet carries this sequence
/// number.
pub const NACK_MARKER: u64 = u64::MAX;

impl Nack {
    /// Wire form: marker word, count, then the missing sequence numbers,
    /// all little endian.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.missing.len() * 8);
        out.extend_from_slice(&NACK_MARKER.to_le_bytes());
        out.extend_from_slice(&(self.missing.len() as u64).to_le_bytes());
        for seq in &self.missing {
            out.extend_from_slice(&seq.to_le_bytes());
        }
        out
    }
}

/// Circular window over the most recently seen packet sequence numbers.
#[derive(Clone, Debug)]
struct PsnWindow {
    seen: Vec<u64>,
    next: usize,
}

impl PsnWindow {
    fn new() -> Self {
        Self { seen: Vec::with_capacity(PSN_WINDOW), next: 0 }
    }

    fn push(&mut self, seq: u64) {
        if self.seen.len() < PSN_WINDOW {
            self.seen.push(seq);
        } else {
            self.seen[self.next] = seq;
            self.next = (self.next + 1) % PSN_WINDOW;
        }
    }

    /// Sequence numbers missing between the lowest and highest entry of the
    /// window.
    fn gaps(&self) -> Vec<u64> {
        let (Some(&lo), Some(&hi)) = (self.seen.iter().min(), self.seen.iter().max())
        else {
            return Vec::new();
        };
        let mut missing = Vec::new();
        for seq in lo..=hi {
            if missing.len() == NACK_CAP {
                break;
            }
            if !self.seen.contains(&seq) {
                missing.push(seq);
            }
        }
        missing
    }
}

/// Packet accounting for one UDP sender, keyed by (address, port).
///
/// A packet arriving above the expected sequence number counts the gap as
/// lost; a late packet below it is reordering and repays one of those
/// losses, so a stream that merely shuffles packets converges back to zero
/// loss.
#[derive(Clone, Debug)]
pub struct PerSender {
    pub sender: SocketAddr,
    pub expect_seq: u64,
    pub max_seq: u64,
    pub min_seq: u64,
    pub loss_count: u64,
    pub pkt_count: u64,
    pub ooo_count: u64,
    pub ooo_sum: u64,
    ack: usize,
    pub last_ack: u64,
    pub old_ack: u64,
    psn: PsnWindow,
    ackperiod: usize,
}

impl PerSender {
    pub fn new(sender: SocketAddr, first_seq: u64, ackperiod: usize) -> Self {
        let mut psn = PsnWindow::new();
        psn.push(first_seq);
        Self {
            sender,
            expect_seq: first_seq + 1,
            max_seq: first_seq,
            min_seq: first_seq,
            loss_count: 0,
            pkt_count: 1,
            ooo_count: 0,
            ooo_sum: 0,
            ack: ackperiod.max(1),
            last_ack: 0,
            old_ack: 0,
            psn,
            ackperiod: ackperiod.max(1),
        }
    }

    /// Account one packet; every `ackperiod` packets the PSN window is
    /// turned into a NACK for the caller to send back.
    pub fn handle_seqnr(&mut self, seq: u64) -> Option<Nack> {
        self.pkt_count += 1;
        self.max_seq = self.max_seq.max(seq);
        self.min_seq = self.min_seq.min(seq);
        self.psn.push(seq);

        if seq == self.expect_seq {
            self.expect_seq += 1;
        } else if seq > self.expect_seq {
            let gap = seq - self.expect_seq;
            self.loss_count += gap;
            self.ooo_count += 1;
            self.ooo_sum += gap;
            self.expect_seq = seq + 1;
        } else {
            // late packet: reordering, and it fills one counted hole
            self.ooo_count += 1;
            self.ooo_sum += self.expect_seq - seq;
            self.loss_count = self.loss_count.saturating_sub(1);
        }

        self.ack -= 1;
        if self.ack > 0 {
            return None;
        }
        self.ack = self.ackperiod;
        self.old_ack = self.last_ack;
        self.last_ack = self.max_seq;
        let missing = self.psn.gaps();
        if missing.is_empty() {
            None
        } else {
            trace!(sender = %self.sender, n = missing.len(), "nack window");
            Some(Nack { missing })
        }
    }
}

/// Statistics for every UDP sender observed on one data socket, shared
/// between the reader stage and the `evlbi?` query.
#[derive(Default)]
pub struct SenderStats {
    inner: Mutex<IndexMap<SocketAddr, PerSender>>,
}

/// Aggregate numbers over all senders, in the shape the `evlbi?` reply
/// template wants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvlbiStats {
    pub pkt_count: u64,
    pub loss_count: u64,
    pub ooo_count: u64,
    pub ooo_sum: u64,
    pub min_seq: u64,
    pub max_seq: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account `seq` from `from`, creating the per-sender entry on first
    /// contact. Returns the NACK to send back, if one is due.
    pub fn record(&self, from: SocketAddr, seq: u64, ackperiod: usize) -> Option<Nack> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(&from) {
            Some(entry) => entry.handle_seqnr(seq),
            None => {
                inner.insert(from, PerSender::new(from, seq, ackperiod));
                None
            }
        }
    }

    pub fn sender_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn per_sender(&self) -> Vec<PerSender> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn snapshot(&self) -> EvlbiStats {
        let inner = self.inner.lock().unwrap();
        let mut agg = EvlbiStats::default();
        let mut first = true;
        for s in inner.values() {
            agg.pkt_count += s.pkt_count;
            agg.loss_count += s.loss_count;
            agg.ooo_count += s.ooo_count;
            agg.ooo_sum += s.ooo_sum;
            agg.max_seq = agg.max_seq.max(s.max_seq);
            agg.min_seq = if first { s.min_seq } else { agg.min_seq.min(s.min_seq) };
            first = false;
        }
        agg
    }

    /// Fresh accounting for a new transfer.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Expand an `evlbi?` reply template: `%t` packets, `%l` lost, `%L` loss
/// fraction, `%o` reordered, `%O` reorder fraction, `%R` sequence extent.
/// Unknown directives pass through untouched.
pub fn format_evlbi(stats: &EvlbiStats, fmt: &str) -> String {
    let pct = |part: u64| {
        if stats.pkt_count == 0 {
            String::from("0.00%")
        } else {
            format!("{:.2}%", part as f64 * 100.0 / stats.pkt_count as f64)
        }
    };
    let mut out = String::with_capacity(fmt.len() + 16);
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push_str(&stats.pkt_count.to_string()),
            Some('l') => out.push_str(&stats.loss_count.to_string()),
            Some('L') => out.push_str(&pct(stats.loss_count)),
            Some('o') => out.push_str(&stats.ooo_count.to_string()),
            Some('O') => out.push_str(&pct(stats.ooo_count)),
            Some('R') => out.push_str(
                &(stats.max_seq.saturating_sub(stats.min_seq) + u64::from(stats.pkt_count > 0))
                    .to_string(),
            ),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn reordering_without_loss() {
        let stats = SenderStats::new();
        for seq in [1u64, 2, 4, 3, 5, 7, 6, 8] {
            stats.record(addr(2630), seq, 1000);
        }
        let agg = stats.snapshot();
        assert_eq!(agg.pkt_count, 8);
        assert_eq!(agg.loss_count, 0);
        assert_eq!(agg.ooo_count, 4);
        assert_eq!(agg.max_seq, 8);
        assert_eq!(agg.min_seq, 1);
    }

    #[test]
    fn real_gaps_stay_counted() {
        let stats = SenderStats::new();
        for seq in [1u64, 2, 5, 6, 7] {
            stats.record(addr(2630), seq, 1000);
        }
        let agg = stats.snapshot();
        assert_eq!(agg.loss_count, 2);
        assert_eq!(agg.ooo_count, 1);
    }

    #[test]
    fn senders_are_kept_apart() {
        let stats = SenderStats::new();
        stats.record(addr(1000), 1, 10);
        stats.record(addr(1000), 2, 10);
        stats.record(addr(2000), 100, 10);
        assert_eq!(stats.sender_count(), 2);
        let per = stats.per_sender();
        assert_eq!(per[0].pkt_count, 2);
        assert_eq!(per[1].min_seq, 100);
    }

    #[test]
    fn nack_names_the_hole() {
        let mut s = PerSender::new(addr(2630), 1, 4);
        assert_eq!(s.handle_seqnr(2), None);
        assert_eq!(s.handle_seqnr(4), None);
        assert_eq!(s.handle_seqnr(5), None);
        let nack = s.handle_seqnr(6).expect("ack period hit");
        assert_eq!(nack.missing, vec![3]);
        assert_eq!(s.last_ack, 6);
    }

    #[test]
    fn evlbi_template_expands() {
        let stats = EvlbiStats {
            pkt_count: 200,
            loss_count: 4,
            ooo_count: 10,
            ooo_sum: 12,
            min_seq: 1,
            max_seq: 204,
        };
        let s = format_evlbi(&stats, "total : %t : loss : %l (%L) : out-of-order : %o (%O) : extent : %R");
        assert_eq!(s, "total : 200 : loss : 4 (2.00%) : out-of-order : 10 (5.00%) : extent : 204");
    }
}
