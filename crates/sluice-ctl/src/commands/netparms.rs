use std::sync::Arc;

use sluice::{Runtime, TransferMode};
use sluice_format::{NetParms, Protocol};

use crate::{
    commands::{busy, parse_u64},
    vsis::{Reply, Request, code},
};

/// Guard for parameter writes: only between transfers.
fn idle_or_busy(req: &Request, rte: &Arc<Runtime>) -> Option<Reply> {
    let mode = rte.transfermode();
    (mode != TransferMode::NoTransfer).then(|| busy(req, mode))
}

pub fn net_protocol(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if req.query {
        let np = rte.netparms.lock().unwrap();
        return Reply::ok_with(req, vec![
            np.protocol.to_string(),
            np.sockbuf.to_string(),
            np.blocksize.to_string(),
        ]);
    }
    if let Some(r) = idle_or_busy(req, rte) {
        return r;
    }
    let Some(proto) = req.arg(0) else {
        return Reply::error(req, code::SYNTAX, "missing protocol argument");
    };
    let Ok(proto) = proto.parse::<Protocol>() else {
        return Reply::error(req, code::SYNTAX, format!("unknown protocol {proto}"));
    };
    let mut np = rte.netparms.lock().unwrap();
    np.protocol = proto;
    if let Some(sockbuf) = req.arg(1).and_then(parse_u64) {
        np.sockbuf = sockbuf as usize;
    }
    if let Some(blocksize) = req.arg(2).and_then(parse_u64) {
        np.blocksize = blocksize as usize;
    }
    Reply::ok(req)
}

pub fn mtu(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if req.query {
        let mtu = rte.netparms.lock().unwrap().mtu;
        return Reply::ok_with(req, vec![mtu.to_string()]);
    }
    if let Some(r) = idle_or_busy(req, rte) {
        return r;
    }
    match req.arg(0).and_then(parse_u64) {
        Some(m) if NetParms::mtu_valid(m as usize) => {
            rte.netparms.lock().unwrap().mtu = m as usize;
            Reply::ok(req)
        }
        Some(_) => Reply::error(req, code::SYNTAX, "invalid value for the MTU given"),
        None => Reply::error(req, code::SYNTAX, "missing argument to command"),
    }
}

pub fn net_port(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if req.query {
        let port = rte.netparms.lock().unwrap().port;
        return Reply::ok_with(req, vec![port.to_string()]);
    }
    if let Some(r) = idle_or_busy(req, rte) {
        return r;
    }
    match req.arg(0).and_then(|a| a.parse::<u16>().ok()) {
        Some(port) => {
            rte.netparms.lock().unwrap().port = port;
            Reply::ok(req)
        }
        None => Reply::error(req, code::SYNTAX, "missing argument to command"),
    }
}

pub fn itcp_id(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if req.query {
        let id = rte.itcp_id.lock().unwrap().clone();
        return Reply::ok_with(req, vec![id]);
    }
    if let Some(r) = idle_or_busy(req, rte) {
        return r;
    }
    *rte.itcp_id.lock().unwrap() = req.arg(0).unwrap_or_default().to_string();
    Reply::ok(req)
}
