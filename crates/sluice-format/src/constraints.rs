use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    formats::FrameGeometry,
    netparms::{IP_HEADER, NetParms, Protocol},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SolveError {
    #[error("mtu {mtu} cannot carry {overhead} bytes of headers")]
    MtuTooSmall { mtu: usize, overhead: usize },
    #[error("write size {write_size} does not cover offset {payload_offset} + payload")]
    PayloadExceedsWrite { write_size: usize, payload_offset: usize },
    #[error("read size {read_size} smaller than write size {write_size}")]
    ReadBelowWrite { read_size: usize, write_size: usize },
    #[error("read size {read_size} not a multiple of frame size {framesize}")]
    ReadNotFrameMultiple { read_size: usize, framesize: usize },
    #[error("payload {payload_size} does not divide frame size {framesize}")]
    PayloadSplitsFrame { payload_size: usize, framesize: usize },
    #[error("block size {blocksize} not a multiple of write size {write_size}")]
    BlockNotWriteMultiple { blocksize: usize, write_size: usize },
    #[error("block size {blocksize} not a multiple of frame size {framesize}")]
    BlockNotFrameMultiple { blocksize: usize, framesize: usize },
    #[error("compression must keep at least one byte in {raw} raw bytes")]
    BadCompression { raw: usize },
}

/// Channel-dropping compression expressed as a byte ratio: `raw` input
/// bytes leave the compressor as at most `wire` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compression {
    pub raw: usize,
    pub wire: usize,
}

impl Compression {
    pub fn compressed_size(&self, raw_bytes: usize) -> usize {
        (raw_bytes * self.wire).div_ceil(self.raw)
    }
}

/// One consistent set of sizing parameters for an end-to-end transfer:
/// how much to read per disk access, how much to put in one network write,
/// and the transfer blocksize tying the two together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstraintSet {
    pub blocksize: usize,
    pub read_size: usize,
    pub write_size: usize,
    pub framesize: Option<usize>,
    /// Bytes of application header (the udps sequence number) at the front
    /// of every write unit.
    pub payload_offset: usize,
    /// Raw sample bytes carried per write unit, pre-compression.
    pub payload_size: usize,
    pub application: Protocol,
    pub compression: Option<Compression>,
}

impl std::fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "block:{} read:{} write:{} payload:{}+{}",
            self.blocksize, self.read_size, self.write_size, self.payload_offset,
            self.payload_size
        )?;
        if let Some(fs) = self.framesize {
            write!(f, " frame:{fs}")?;
        }
        Ok(())
    }
}

const fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

const fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

fn round_up_multiple(value: usize, unit: usize) -> usize {
    value.div_ceil(unit).max(1) * unit
}

const fn align_down(value: usize, to: usize) -> usize {
    value - value % to
}

/// Disk reads below this get wasteful; unframed read sizes are rounded up
/// to at least one of these.
const MIN_READ: usize = 64 * 1024;

/// Largest divisor of `of` that is at most `cap`.
fn largest_divisor_at_most(of: usize, cap: usize) -> Option<usize> {
    if cap == 0 {
        return None;
    }
    let mut k = of.div_ceil(cap);
    while k <= of {
        if of % k == 0 {
            return Some(of / k);
        }
        k += 1;
    }
    None
}

/// Pick a `(blocksize, read_size, write_size)` tuple compatible with the
/// network parameters, the frame format (when known) and the compression
/// ratio (when active).
///
/// The write unit is sized so a whole packet, transport headers included,
/// stays under the MTU; payloads are 8-byte aligned; framed reads are whole
/// frames; the blocksize is the smallest multiple of both the write unit
/// and the frame length at or above the configured hint.
pub fn solve(
    np: &NetParms,
    format: Option<&FrameGeometry>,
    compression: Option<Compression>,
) -> Result<ConstraintSet, SolveError> {
    let proto = np.protocol;
    let overhead = IP_HEADER + proto.header_len() + proto.app_header_len();
    let budget = np
        .mtu
        .checked_sub(overhead)
        .filter(|b| *b >= 8)
        .ok_or(SolveError::MtuTooSmall { mtu: np.mtu, overhead })?;

    let payload_offset = proto.app_header_len();
    let wire_payload = align_down(budget, 8);
    let write_size = payload_offset + wire_payload;

    let payload_size = match compression {
        None => wire_payload,
        Some(c) => {
            if c.wire == 0 || c.raw < c.wire {
                return Err(SolveError::BadCompression { raw: c.raw });
            }
            let raw_max = wire_payload * c.raw / c.wire;
            match format {
                // compressed chunks must not straddle a frame boundary
                Some(g) => largest_divisor_at_most(g.framesize, raw_max)
                    .ok_or(SolveError::BadCompression { raw: c.raw })?,
                None => align_down(raw_max, 8),
            }
        }
    };

    let read_size = match format {
        Some(g) => round_up_multiple(write_size, g.framesize),
        None => round_up_multiple(MIN_READ.max(write_size), write_size),
    };

    let grain = match format {
        Some(g) => lcm(write_size, g.framesize),
        None => write_size,
    };
    let blocksize = round_up_multiple(np.blocksize.max(1), grain);

    let cs = ConstraintSet {
        blocksize,
        read_size,
        write_size,
        framesize: format.map(|g| g.framesize),
        payload_offset,
        payload_size,
        application: proto,
        compression,
    };
    debug!(%cs, proto = %proto, mtu = np.mtu, "constraints solved");
    cs.validate()?;
    Ok(cs)
}

impl ConstraintSet {
    /// Re-assert every sizing invariant, naming the first violated one.
    pub fn validate(&self) -> Result<(), SolveError> {
        let wire_payload = match self.compression {
            None => self.payload_size,
            Some(c) => c.compressed_size(self.payload_size),
        };
        if self.payload_offset + wire_payload > self.write_size {
            return Err(SolveError::PayloadExceedsWrite {
                write_size: self.write_size,
                payload_offset: self.payload_offset,
            });
        }
        if self.read_size < self.write_size {
            return Err(SolveError::ReadBelowWrite {
                read_size: self.read_size,
                write_size: self.write_size,
            });
        }
        if let Some(framesize) = self.framesize {
            if self.read_size % framesize != 0 {
                return Err(SolveError::ReadNotFrameMultiple {
                    read_size: self.read_size,
                    framesize,
                });
            }
            if self.blocksize % framesize != 0 {
                return Err(SolveError::BlockNotFrameMultiple {
                    blocksize: self.blocksize,
                    framesize,
                });
            }
            if self.compression.is_some() && framesize % self.payload_size != 0 {
                return Err(SolveError::PayloadSplitsFrame {
                    payload_size: self.payload_size,
                    framesize,
                });
            }
        }
        if self.blocksize == 0 || self.blocksize % self.write_size != 0 {
            return Err(SolveError::BlockNotWriteMultiple {
                blocksize: self.blocksize,
                write_size: self.write_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::formats::TrackFormat;

    fn udps_4470() -> NetParms {
        NetParms {
            protocol: Protocol::Udps,
            mtu: 4470,
            blocksize: 168_272,
            ..NetParms::default()
        }
    }

    #[test]
    fn mark5b_over_udps_mtu_4470() {
        let geom = TrackFormat::Mark5B.geometry(0, None).unwrap();
        let cs = solve(&udps_4470(), Some(&geom), None).unwrap();

        assert_eq!(cs.write_size, 4440);
        assert_eq!(cs.payload_offset, 8);
        assert_eq!(cs.payload_size, 4432);
        assert_eq!(cs.read_size, 10_000);
        // smallest multiple of lcm(4440, 10000) at or above the hint
        assert_eq!(cs.blocksize, 1_110_000);
        assert_eq!(cs.blocksize % cs.write_size, 0);
        assert_eq!(cs.blocksize % 10_000, 0);
        cs.validate().unwrap();
    }

    #[test]
    fn raw_tcp_mtu_1500() {
        let np = NetParms { mtu: 1500, ..NetParms::default() };
        let cs = solve(&np, None, None).unwrap();

        assert_eq!(cs.write_size, 1456);
        assert_eq!(cs.payload_offset, 0);
        assert_eq!(cs.read_size % cs.write_size, 0);
        assert!(cs.read_size >= 64 * 1024);
        assert_eq!(cs.blocksize % cs.write_size, 0);
        assert!(cs.blocksize >= np.blocksize);
    }

    #[test]
    fn compressed_mark5b_payload_divides_frame() {
        let geom = TrackFormat::Mark5B.geometry(0, None).unwrap();
        let comp = Compression { raw: 2, wire: 1 };
        let cs = solve(&udps_4470(), Some(&geom), Some(comp)).unwrap();

        assert_eq!(10_000 % cs.payload_size, 0);
        assert!(comp.compressed_size(cs.payload_size) + cs.payload_offset <= cs.write_size);
        cs.validate().unwrap();
    }

    #[test]
    fn tiny_mtu_is_rejected() {
        let np = NetParms { mtu: 40, ..NetParms::default() };
        assert!(matches!(
            solve(&np, None, None),
            Err(SolveError::MtuTooSmall { .. })
        ));
    }

    #[test]
    fn solved_sets_always_validate() {
        let geom5b = TrackFormat::Mark5B.geometry(0, None).unwrap();
        let geom4 = TrackFormat::Mark4.geometry(16, None).unwrap();
        for proto in [Protocol::Tcp, Protocol::Udp, Protocol::Udps, Protocol::Itcp] {
            for mtu in [576, 1500, 4470, 8192, 9000] {
                for geom in [None, Some(&geom5b), Some(&geom4)] {
                    for comp in [None, Some(Compression { raw: 4, wire: 3 })] {
                        let np = NetParms { protocol: proto, mtu, ..NetParms::default() };
                        if let Ok(cs) = solve(&np, geom, comp) {
                            cs.validate().unwrap_or_else(|e| {
                                panic!("{proto} mtu {mtu}: solve produced invalid set: {e}")
                            });
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn validate_names_the_violation() {
        let geom = TrackFormat::Mark5B.geometry(0, None).unwrap();
        let mut cs = solve(&udps_4470(), Some(&geom), None).unwrap();
        cs.read_size = 9_999;
        assert!(matches!(
            cs.validate(),
            Err(SolveError::ReadNotFrameMultiple { .. })
        ));
    }
}
