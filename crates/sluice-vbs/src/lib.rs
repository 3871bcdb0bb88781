mod error;
mod mark6;
mod mount;
mod recording;
mod scan;
mod table;
mod writer;

pub use error::VbsError;
pub use mark6::MK6_SYNC_WORD;
pub use mount::{MountInfo, MountSet};
pub use recording::Recording;
pub use scan::{MAX_SCAN_NAME, Scan, ScanDir, ScanError, ScanPointer, strip_asterisk};
pub use table::{VbsTable, Whence};
pub use writer::ChunkWriter;
