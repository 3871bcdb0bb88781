use std::sync::{Arc, atomic::Ordering};

use sluice::{Runtime, TransferMode};
use sluice_format::{TrackFormat, solve};
use sluice_net::format_evlbi;

use crate::{
    commands::{busy, parse_u64},
    vsis::{Reply, Request, code},
};

pub fn mode(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if req.query {
        let df = rte.dataformat.lock().unwrap();
        let fmt = df.format.map_or_else(|| String::from("none"), |f| f.to_string());
        return Reply::ok_with(req, vec![fmt, df.ntrack.to_string()]);
    }
    let current = rte.transfermode();
    if current != TransferMode::NoTransfer {
        return busy(req, current);
    }
    let Some(fmt) = req.arg(0) else {
        return Reply::error(req, code::SYNTAX, "missing mode argument");
    };

    let mut df = rte.dataformat.lock().unwrap();
    if fmt == "none" {
        df.format = None;
        return Reply::ok(req);
    }
    let Ok(parsed) = fmt.parse::<TrackFormat>() else {
        return Reply::error(req, code::SYNTAX, format!("unknown data mode {fmt}"));
    };
    match parsed {
        TrackFormat::Mark4 => {
            let ntrack = req.arg(1).and_then(parse_u64).unwrap_or(32) as u32;
            if let Err(e) = parsed.geometry(ntrack, None) {
                return Reply::error(req, code::SYNTAX, e.to_string());
            }
            df.ntrack = ntrack;
        }
        TrackFormat::Vdif => {
            let Some(framesize) = req.arg(1).and_then(parse_u64) else {
                return Reply::error(req, code::SYNTAX, "vdif needs a frame size");
            };
            if let Err(e) = parsed.geometry(0, Some(framesize as usize)) {
                return Reply::error(req, code::SYNTAX, e.to_string());
            }
            df.vdif_framesize = Some(framesize as usize);
        }
        TrackFormat::Mark5B => {}
    }
    df.format = Some(parsed);
    Reply::ok(req)
}

/// Current sizing solution; only available as query.
pub fn constraints(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if !req.query {
        return Reply::query_only(req);
    }
    let np = rte.netparms.lock().unwrap().clone();
    let df = rte.dataformat.lock().unwrap().clone();
    let geom = match df.geometry() {
        Ok(g) => g,
        Err(e) => return Reply::error(req, code::SYNTAX, e.to_string()),
    };
    match solve(&np, geom.as_ref(), None) {
        Ok(cs) => Reply::ok_with(req, vec![
            format!("{}tr", df.ntrack),
            df.format.map_or_else(|| String::from("none"), |f| f.to_string()),
            cs.to_string(),
        ]),
        Err(e) => Reply::error(req, code::SYNTAX, e.to_string()),
    }
}

/// Pop the oldest spooled error. Always answers; an empty spool answers
/// with empty fields.
pub fn error(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if !req.query {
        return Reply::query_only(req);
    }
    match rte.errors.pop() {
        None => Reply::ok_with(req, vec![String::new(), String::new(), String::new()]),
        Some(e) => {
            let stamp = |t: chrono::DateTime<chrono::Utc>| {
                t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
            };
            let mut values =
                vec![e.code.to_string(), e.message.clone(), stamp(e.first)];
            if e.occurrences > 1 {
                values.push(stamp(e.last));
                values.push(e.occurrences.to_string());
            }
            Reply::ok_with(req, values)
        }
    }
}

const EVLBI_DEFAULT_FMT: &str =
    "total : %t : loss : %l (%L) : out-of-order : %o (%O) : extent : %R";

/// Packet statistics of the UDP readers. A command form carries a custom
/// template made of the colon-separated arguments.
pub fn evlbi(req: &Request, rte: &Arc<Runtime>) -> Reply {
    let fmt = if req.query || req.args.is_empty() {
        EVLBI_DEFAULT_FMT.to_string()
    } else {
        req.args.join(" : ")
    };
    let stats = rte.senders.snapshot();
    Reply::ok_with(req, vec![format_evlbi(&stats, &fmt)])
}

pub fn memstat(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if !req.query {
        return Reply::query_only(req);
    }
    let pools = rte.pool_stats();
    if pools.is_empty() {
        return Reply::ok_with(req, vec![String::from("no blockpools")]);
    }
    let values = pools
        .into_iter()
        .map(|(label, blocksize, allocated, outstanding)| {
            format!("{label} {allocated} x {blocksize}B ({outstanding} out)")
        })
        .collect();
    Reply::ok_with(req, values)
}

pub fn dir_info(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if !req.query {
        return Reply::query_only(req);
    }
    let info = rte.vbs.mounts().info();
    Reply::ok_with(req, vec![
        String::from("?"),
        (info.total_bytes - info.free_bytes).to_string(),
        info.total_bytes.to_string(),
    ])
}

pub fn scandir(req: &Request, rte: &Arc<Runtime>) -> Reply {
    let mode = rte.transfermode();
    if mode.disks_unavailable() {
        return busy(req, mode);
    }
    let dir = rte.scandir.lock().unwrap();
    let mut values = vec![dir.len().to_string()];
    let index = req.arg(0).and_then(parse_u64).unwrap_or(0) as u32;
    match dir.scan(index) {
        Some(scan) => {
            values.push(scan.name().to_string());
            values.push(scan.start().to_string());
            values.push(scan.length().to_string());
        }
        None => values.push(format!("<scan # {index}> out of range")),
    }
    Reply::ok_with(req, values)
}

/// Automatic switch-on-full of the disk banks.
pub fn bank_switch(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if req.query {
        let state = if rte.bank_auto() { "on" } else { "off" };
        return Reply::ok_with(req, vec![state.to_string()]);
    }
    let mode = rte.transfermode();
    if mode.disks_unavailable() {
        return busy(req, mode);
    }
    match req.arg(0) {
        Some("on") => {
            rte.bank_auto.store(true, Ordering::Relaxed);
            Reply::ok(req)
        }
        Some("off") => {
            rte.bank_auto.store(false, Ordering::Relaxed);
            Reply::ok(req)
        }
        _ => Reply::error(req, code::SYNTAX, "mode parameter should be 'on' or 'off'"),
    }
}

/// Transfer status: the mode plus the per-step byte counters of the
/// running chain.
pub fn tstat(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if !req.query {
        return Reply::query_only(req);
    }
    let mut values = vec![rte.transfermode().to_string()];
    rte.with_active(|active| {
        if let Some(active) = active {
            for (name, bytes) in active.chain.stats().snapshot() {
                values.push(format!("{name} {bytes}"));
            }
        }
    });
    Reply::ok_with(req, values)
}

pub fn transfermode(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if !req.query {
        return Reply::query_only(req);
    }
    Reply::ok_with(req, vec![rte.transfermode().to_string()])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vsis::parse_line;

    fn rte() -> Arc<Runtime> {
        Arc::new(Runtime::new(64 * 1024 * 1024))
    }

    fn one(line: &str) -> Request {
        parse_line(line).remove(0).unwrap()
    }

    #[test]
    fn mode_sets_mark5b() {
        let rte = rte();
        assert_eq!(mode(&one("mode=mark5b"), &rte).code, code::OK);
        let reply = mode(&one("mode?"), &rte);
        assert_eq!(reply.values[0], "mark5b");
    }

    #[test]
    fn constraints_reports_the_solution() {
        let rte = rte();
        mode(&one("mode=mark5b"), &rte);
        {
            let mut np = rte.netparms.lock().unwrap();
            np.protocol = sluice_format::Protocol::Udps;
            np.mtu = 4470;
            np.blocksize = 168_272;
        }
        let reply = constraints(&one("constraints?"), &rte);
        assert_eq!(reply.code, code::OK);
        assert!(reply.values[2].contains("write:4440"));
        assert!(reply.values[2].contains("read:10000"));
    }

    #[test]
    fn error_queue_pops_oldest_first() {
        let rte = rte();
        rte.errors.push(4, "first");
        rte.errors.push(6, "second");
        let reply = error(&one("error?"), &rte);
        assert_eq!(reply.values[0], "4");
        assert_eq!(reply.values[1], "first");
        let reply = error(&one("error?"), &rte);
        assert_eq!(reply.values[1], "second");
        let reply = error(&one("error?"), &rte);
        assert_eq!(reply.values[0], "");
    }

    #[test]
    fn tstat_is_query_only() {
        let rte = rte();
        assert_eq!(tstat(&one("tstat=1"), &rte).code, code::WRONG_DIRECTION);
        let reply = tstat(&one("tstat?"), &rte);
        assert_eq!(reply.values, vec!["no_transfer"]);
    }
}
