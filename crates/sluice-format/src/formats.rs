use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("mark4 needs a track count out of 8/16/32/64, got {0}")]
    BadTrackCount(u32),
    #[error("vdif needs an explicit frame size")]
    MissingVdifFrameSize,
    #[error("frame size {0} too small to hold a frame header")]
    FrameTooSmall(usize),
}

/// The tape/disk frame formats this recorder understands. Headers are
/// detected, never interpreted.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum TrackFormat {
    Mark4,
    Mark5B,
    Vdif,
}

/// Frame length plus where/what the sync word is, everything the header
/// tracker and the sizing solver need to know about a format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub format: TrackFormat,
    pub framesize: usize,
    /// Byte pattern opening each frame; empty for formats without a sync
    /// word (VDIF), where tracking is stride-prediction only.
    pub sync: Vec<u8>,
}

/// Mark5B frames lead with this word on disk (little endian).
const MARK5B_SYNC: [u8; 4] = [0xED, 0xDE, 0xAD, 0xAB];
const MARK5B_FRAMESIZE: usize = 10_000;

impl TrackFormat {
    /// Geometry for this format. `ntrack` matters for Mark4, where both the
    /// frame length and the all-ones sync run scale with the track count;
    /// `vdif_framesize` is required for VDIF.
    pub fn geometry(
        self,
        ntrack: u32,
        vdif_framesize: Option<usize>,
    ) -> Result<FrameGeometry, FormatError> {
        match self {
            Self::Mark4 => {
                if !matches!(ntrack, 8 | 16 | 32 | 64) {
                    return Err(FormatError::BadTrackCount(ntrack));
                }
                Ok(FrameGeometry {
                    format: self,
                    framesize: 2500 * ntrack as usize,
                    sync: vec![0xFF; 4 * ntrack as usize],
                })
            }
            Self::Mark5B => Ok(FrameGeometry {
                format: self,
                framesize: MARK5B_FRAMESIZE,
                sync: MARK5B_SYNC.to_vec(),
            }),
            Self::Vdif => {
                let framesize =
                    vdif_framesize.ok_or(FormatError::MissingVdifFrameSize)?;
                if framesize < 32 {
                    return Err(FormatError::FrameTooSmall(framesize));
                }
                Ok(FrameGeometry { format: self, framesize, sync: Vec::new() })
            }
        }
    }
}
