mod assert;
mod thread;
mod wakeup;

pub use thread::{StageKind, boot_stage};
pub use wakeup::{ThreadKick, WAKEUP_SIGNAL, install_wakeup_handler};
