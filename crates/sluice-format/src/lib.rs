mod constraints;
mod formats;
mod headersearch;
mod netparms;

pub use constraints::{Compression, ConstraintSet, SolveError, solve};
pub use formats::{FormatError, FrameGeometry, TrackFormat};
pub use headersearch::HeaderSearch;
pub use netparms::{NetParms, Protocol, SEQUENCE_HEADER};
