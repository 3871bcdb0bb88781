use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VbsError {
    #[error("no recording named {0} on any mountpoint")]
    NotFound(String),
    #[error("recording {rec}: duplicate chunk sequence number {seq}")]
    DuplicateChunk { rec: String, seq: u32 },
    #[error("{path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("bad descriptor {0}")]
    BadDescriptor(i32),
    #[error("cannot re-initialise mountpoints while recordings are open")]
    Busy,
    #[error("no usable mountpoints under {0}")]
    NoMounts(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl VbsError {
    /// The errno this maps to for callers thinking in open/read/lseek
    /// terms.
    pub fn os_errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::DuplicateChunk { .. } | Self::Corrupt { .. } => libc::EIO,
            Self::BadDescriptor(_) => libc::EBADF,
            Self::Busy => libc::EBUSY,
            Self::NoMounts(_) => libc::ENOENT,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
