use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Wire protocols the data stages speak. `udps` is UDP with an 8-byte
/// sequence number in front of every datagram payload; `itcp` is TCP with a
/// one-shot identification preamble; `udt` is carried by an external
/// transport library and only represented here.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Udps,
    Udt,
    Itcp,
}

/// Assumed IPv4 header size; the solver stays below the MTU including it.
pub(crate) const IP_HEADER: usize = 20;

/// Every udps datagram payload leads with this many sequence-number bytes.
pub const SEQUENCE_HEADER: usize = 8;

impl Protocol {
    /// Transport header bytes per packet on the wire.
    pub fn header_len(self) -> usize {
        match self {
            Self::Udp | Self::Udps => 8,
            Self::Tcp | Self::Itcp => 20,
            // UDT rides on UDP and adds its own 16-byte packet header
            Self::Udt => 8 + 16,
        }
    }

    /// Application-level bytes inside the payload of each packet.
    pub fn app_header_len(self) -> usize {
        match self {
            Self::Udps => SEQUENCE_HEADER,
            _ => 0,
        }
    }

    pub fn is_stream(self) -> bool {
        matches!(self, Self::Tcp | Self::Itcp | Self::Udt)
    }
}

/// Network parameters owned by the runtime, written only between transfers
/// and read freely by running stages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetParms {
    pub protocol: Protocol,
    pub mtu: usize,
    pub port: u16,
    /// Hint for the transfer blocksize; the solver rounds it up to the
    /// nearest feasible value.
    pub blocksize: usize,
    /// Kernel socket buffer request (SO_SNDBUF / SO_RCVBUF).
    pub sockbuf: usize,
    /// Packets between NACK emissions of the udps reader.
    pub ackperiod: usize,
}

impl Default for NetParms {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            mtu: 1500,
            port: 2630,
            blocksize: 128 * 1024,
            sockbuf: 4 * 1024 * 1024,
            ackperiod: 10,
        }
    }
}

impl NetParms {
    pub const MIN_MTU: usize = 64;
    pub const MAX_MTU: usize = 9000;

    pub fn mtu_valid(mtu: usize) -> bool {
        (Self::MIN_MTU..=Self::MAX_MTU).contains(&mtu)
    }
}
