mod itcp;
mod sender;
mod sock;
mod udps;

pub use itcp::{read_preamble, write_preamble};
pub use sender::{EvlbiStats, NACK_MARKER, Nack, PerSender, SenderStats, format_evlbi};
pub use sock::{
    DataSink, DataSource, EstablishedSource, connect_sink, open_source, set_socket_bufs,
};
pub use udps::{decode_seqnr, encode_seqnr};
