//! Command dispatch: VSI-S keyword to handler function.

mod netparms;
mod queries;
mod transfers;

use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use sluice::Runtime;

use crate::vsis::{Reply, Request, code};

pub type Handler = fn(&Request, &Arc<Runtime>) -> Reply;

/// The command set, in the order `help`-style listings would show it.
pub static COMMANDS: Lazy<IndexMap<&'static str, Handler>> = Lazy::new(|| {
    let mut map: IndexMap<&'static str, Handler> = IndexMap::new();
    map.insert("net_protocol", netparms::net_protocol);
    map.insert("mtu", netparms::mtu);
    map.insert("net_port", netparms::net_port);
    map.insert("itcp_id", netparms::itcp_id);
    map.insert("mode", queries::mode);
    map.insert("constraints", queries::constraints);
    map.insert("error", queries::error);
    map.insert("evlbi", queries::evlbi);
    map.insert("memstat", queries::memstat);
    map.insert("dir_info", queries::dir_info);
    map.insert("scandir", queries::scandir);
    map.insert("bank_switch", queries::bank_switch);
    map.insert("tstat", queries::tstat);
    map.insert("transfermode", queries::transfermode);
    map.insert("fill2net", transfers::fill2net);
    map.insert("disk2net", transfers::disk2net);
    map.insert("net2disk", transfers::net2disk);
    map.insert("record", transfers::record);
    map
});

pub fn handle(req: &Request, rte: &Arc<Runtime>) -> Reply {
    match COMMANDS.get(req.name.as_str()) {
        Some(handler) => handler(req, rte),
        None => Reply::error(req, code::SYNTAX, "unknown keyword"),
    }
}

/// Numeric argument in the command set's conventions: decimal, or hex with
/// an `0x` prefix.
pub(crate) fn parse_u64(s: &str) -> Option<u64> {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .map_or_else(|| s.parse().ok(), |hex| u64::from_str_radix(hex, 16).ok())
}

/// The standard busy reply for a gate held by another transfer.
pub(crate) fn busy(req: &Request, current: sluice::TransferMode) -> Reply {
    Reply::error(req, code::BUSY, format!("transfer {current} in progress"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numbers_parse_like_strtoul() {
        assert_eq!(parse_u64("9000"), Some(9000));
        assert_eq!(parse_u64("0x11223344"), Some(0x1122_3344));
        assert_eq!(parse_u64("nope"), None);
    }

    #[test]
    fn unknown_keyword_is_a_syntax_error() {
        let rte = Arc::new(Runtime::new(64 * 1024 * 1024));
        let req = Request { name: "warp_drive".into(), query: true, args: vec![] };
        let reply = handle(&req, &rte);
        assert_eq!(reply.code, code::SYNTAX);
    }
}
