//! Worker-stage bodies the command layer composes into chains.

mod disk;
mod fill;
mod net;
mod queue;

use std::{io, time::Duration};

pub use disk::{DiskReaderArgs, DiskWriterArgs, disk_reader, disk_writer};
pub use fill::{FillArgs, fill_producer};
pub use net::{NetReaderArgs, NetWriterArgs, net_reader, net_writer};
pub use queue::{
    FifoReaderArgs, HubForkerArgs, HubReaderArgs, HubWriterArgs, PatternSource,
    SampleSource, fifo_reader, hub_forker, hub_reader, hub_writer,
};

/// How long a stage sleeps in a pool wait before re-checking its cancel
/// flag.
pub(crate) const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Did this I/O error come from the wakeup signal or a receive timeout
/// rather than a real failure? Those mean "look at your cancel flag and go
/// again".
pub(crate) fn is_wakeup(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
