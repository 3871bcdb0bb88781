//! The transfer commands: each `connect`/`open` builds a chain out of the
//! worker stages, installs it behind the transfer-mode gate, and the
//! matching `disconnect`/`close` tears it down again.

use std::sync::Arc;

use sluice::{
    ActiveTransfer, Chain, ChainError, Runtime, TransferControls, TransferMode,
    steps::{
        DiskReaderArgs, DiskWriterArgs, FifoReaderArgs, FillArgs, HubForkerArgs,
        NetReaderArgs, NetWriterArgs, PatternSource, disk_reader, disk_writer,
        fifo_reader, fill_producer, hub_forker, net_reader, net_writer,
    },
};
use sluice_communication::BlockPool;
use sluice_format::{ConstraintSet, FrameGeometry, HeaderSearch, NetParms, solve};
use sluice_net::{connect_sink, open_source};
use sluice_vbs::ChunkWriter;
use tracing::info;

use crate::{
    commands::{busy, parse_u64},
    vsis::{Reply, Request, code},
};

/// Depth of the inter-stage queues, in blocks.
const QUEUE_DEPTH: usize = 8;
/// Blocks a transfer pool allocates per growth step.
const POOL_CHUNK: usize = 4;

/// Everything a transfer build needs from the runtime's parameter objects.
struct TransferPlan {
    np: NetParms,
    geom: Option<FrameGeometry>,
    ntrack: u32,
    sizes: ConstraintSet,
    pool: BlockPool,
}

fn plan(req: &Request, rte: &Arc<Runtime>, label: &str) -> Result<TransferPlan, Reply> {
    let np = rte.netparms.lock().unwrap().clone();
    let df = rte.dataformat.lock().unwrap().clone();
    let geom = df
        .geometry()
        .map_err(|e| Reply::error(req, code::SYNTAX, e.to_string()))?;
    let sizes = solve(&np, geom.as_ref(), None)
        .map_err(|e| Reply::error(req, code::SYNTAX, e.to_string()))?;

    let max_blocks = (rte.pool_cap / sizes.blocksize).max(POOL_CHUNK);
    let pool = BlockPool::with_cap(sizes.blocksize, POOL_CHUNK, max_blocks)
        .map_err(|e| Reply::error(req, code::INTERNAL, e.to_string()))?;
    rte.register_pool(label, &pool);

    Ok(TransferPlan { np, geom, ntrack: df.ntrack, sizes, pool })
}

/// Tear down the installed transfer of `mode`; the common tail of
/// `disconnect` and `close`.
fn teardown(
    req: &Request,
    rte: &Arc<Runtime>,
    mode: TransferMode,
    hard_cancel: bool,
) -> Reply {
    let current = rte.transfermode();
    if current != mode {
        return busy(req, current);
    }
    let Some(mut active) = rte.take_active() else {
        rte.release();
        return Reply::error(req, code::INTERNAL, "gate held but no transfer installed");
    };
    let result = if hard_cancel { active.chain.cancel() } else { active.chain.stop() };
    rte.release();
    info!(%mode, "transfer finished");
    match result {
        Ok(()) => Reply::ok(req),
        Err(ChainError::Step { name, err }) => {
            Reply::error(req, err.code(), format!("{name}: {err}"))
        }
        Err(e) => Reply::error(req, code::INTERNAL, e.to_string()),
    }
}

fn transfer_query(req: &Request, rte: &Arc<Runtime>, mode: TransferMode) -> Reply {
    if rte.transfermode() != mode {
        return Reply::ok_with(req, vec![String::from("inactive")]);
    }
    let mut values = vec![String::from("active")];
    rte.with_active(|active| {
        if let Some(active) = active {
            let total: u64 =
                active.chain.stats().snapshot().last().map_or(0, |(_, n)| *n);
            values.push(total.to_string());
        }
    });
    Reply::ok_with(req, values)
}

pub fn fill2net(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if req.query {
        return transfer_query(req, rte, TransferMode::Fill2Net);
    }
    match req.arg(0) {
        Some("connect") => fill2net_connect(req, rte),
        Some("on") => fill2net_on(req, rte),
        Some("disconnect") => teardown(req, rte, TransferMode::Fill2Net, false),
        _ => Reply::error(req, code::SYNTAX, "expected connect, on or disconnect"),
    }
}

fn fill2net_connect(req: &Request, rte: &Arc<Runtime>) -> Reply {
    let Some(host) = req.arg(1) else {
        return Reply::error(req, code::SYNTAX, "connect needs a host");
    };
    if let Err(e) = rte.claim(TransferMode::Fill2Net) {
        let sluice::ModeError::Busy { current } = e;
        return busy(req, current);
    }

    let built = (|| {
        let plan = plan(req, rte, "fill2net")?;
        let itcp_id = rte.itcp_id.lock().unwrap().clone();
        let sink = connect_sink(&plan.np, host, &itcp_id)
            .map_err(|e| Reply::error(req, code::IO, e.to_string()))?;

        let builder = Chain::builder();
        let (builder, fill) = builder.produce(
            "fill",
            QUEUE_DEPTH,
            FillArgs::new(plan.pool.clone()),
            fill_producer,
        );
        let (mut chain, _writer) = builder.consume(
            "netwriter",
            NetWriterArgs {
                sink: Some(sink),
                sizes: plan.sizes.clone(),
                headersearch: plan
                    .geom
                    .clone()
                    .map(|g| HeaderSearch::from_geometry(g, plan.ntrack)),
                start_seqnr: 0,
                core: None,
            },
            net_writer,
        );
        chain.set_error_spool(Arc::clone(&rte.errors));
        chain
            .run()
            .map_err(|e| Reply::error(req, code::INTERNAL, e.to_string()))?;
        Ok(ActiveTransfer {
            mode: TransferMode::Fill2Net,
            chain,
            controls: TransferControls::Fill2Net { fill },
        })
    })();

    match built {
        Ok(active) => {
            rte.install_active(active);
            Reply::ok(req)
        }
        Err(reply) => {
            rte.release();
            reply
        }
    }
}

fn fill2net_on(req: &Request, rte: &Arc<Runtime>) -> Reply {
    let current = rte.transfermode();
    if current != TransferMode::Fill2Net {
        return busy(req, current);
    }
    let nblocks = req.arg(1).and_then(parse_u64);
    let word = req.arg(2).and_then(parse_u64);
    let inc = req.arg(3).and_then(parse_u64);
    rte.with_active(|active| {
        if let Some(ActiveTransfer {
            controls: TransferControls::Fill2Net { fill }, ..
        }) = active
        {
            fill.with_args(|a| {
                a.nblocks = nblocks;
                if let Some(word) = word {
                    a.fill_word = word;
                }
                if let Some(inc) = inc {
                    a.inc = inc;
                }
                a.run = true;
            });
        }
    });
    Reply::ok(req)
}

pub fn disk2net(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if req.query {
        return transfer_query(req, rte, TransferMode::Disk2Net);
    }
    match req.arg(0) {
        Some("connect") => disk2net_connect(req, rte),
        Some("on") => disk2net_on(req, rte),
        Some("disconnect") => teardown(req, rte, TransferMode::Disk2Net, false),
        _ => Reply::error(req, code::SYNTAX, "expected connect, on or disconnect"),
    }
}

fn disk2net_connect(req: &Request, rte: &Arc<Runtime>) -> Reply {
    let (Some(rec), Some(host)) = (req.arg(1), req.arg(2)) else {
        return Reply::error(req, code::SYNTAX, "connect needs a recording and a host");
    };
    if let Err(sluice::ModeError::Busy { current }) = rte.claim(TransferMode::Disk2Net)
    {
        return busy(req, current);
    }

    let built = (|| {
        let fd = rte
            .vbs
            .open(rec)
            .map_err(|e| Reply::error(req, code::IO, e.to_string()))?;
        let plan = plan(req, rte, "disk2net")?;
        let itcp_id = rte.itcp_id.lock().unwrap().clone();
        let sink = connect_sink(&plan.np, host, &itcp_id)
            .map_err(|e| Reply::error(req, code::IO, e.to_string()))?;

        let builder = Chain::builder();
        let (builder, disk) = builder.produce(
            "diskreader",
            QUEUE_DEPTH,
            DiskReaderArgs {
                table: Arc::clone(&rte.vbs),
                fd,
                start: 0,
                end: None,
                read_size: plan.sizes.read_size,
                pool: plan.pool.clone(),
                run: false,
            },
            disk_reader,
        );
        let (mut chain, _writer) = builder.consume(
            "netwriter",
            NetWriterArgs {
                sink: Some(sink),
                sizes: plan.sizes.clone(),
                headersearch: plan
                    .geom
                    .clone()
                    .map(|g| HeaderSearch::from_geometry(g, plan.ntrack)),
                start_seqnr: 0,
                core: None,
            },
            net_writer,
        );
        chain.set_error_spool(Arc::clone(&rte.errors));
        let table = Arc::clone(&rte.vbs);
        chain.set_finalizer(move || {
            let _ = table.close(fd);
        });
        chain
            .run()
            .map_err(|e| Reply::error(req, code::INTERNAL, e.to_string()))?;
        Ok(ActiveTransfer {
            mode: TransferMode::Disk2Net,
            chain,
            controls: TransferControls::Disk2Net { disk },
        })
    })();

    match built {
        Ok(active) => {
            rte.install_active(active);
            Reply::ok(req)
        }
        Err(reply) => {
            rte.release();
            reply
        }
    }
}

fn disk2net_on(req: &Request, rte: &Arc<Runtime>) -> Reply {
    let current = rte.transfermode();
    if current != TransferMode::Disk2Net {
        return busy(req, current);
    }
    let start = req.arg(1).and_then(parse_u64).unwrap_or(0);
    let end = req.arg(2).and_then(parse_u64);
    rte.with_active(|active| {
        if let Some(ActiveTransfer {
            controls: TransferControls::Disk2Net { disk }, ..
        }) = active
        {
            disk.with_args(|a| {
                a.start = start;
                a.end = end;
                a.run = true;
            });
        }
    });
    Reply::ok(req)
}

pub fn net2disk(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if req.query {
        return transfer_query(req, rte, TransferMode::Net2Disk);
    }
    match req.arg(0) {
        Some("open") => net2disk_open(req, rte),
        // the reader never runs dry on its own, so close is the cancel path
        Some("close") => teardown(req, rte, TransferMode::Net2Disk, true),
        _ => Reply::error(req, code::SYNTAX, "expected open or close"),
    }
}

fn net2disk_open(req: &Request, rte: &Arc<Runtime>) -> Reply {
    let Some(rec) = req.arg(1) else {
        return Reply::error(req, code::SYNTAX, "open needs a recording name");
    };
    if let Err(sluice::ModeError::Busy { current }) = rte.claim(TransferMode::Net2Disk)
    {
        return busy(req, current);
    }

    let built = (|| {
        let mounts = rte.vbs.mounts();
        if mounts.is_empty() {
            return Err(Reply::error(req, code::IO, "no mountpoints initialised"));
        }
        let plan = plan(req, rte, "net2disk")?;
        rte.senders.clear();
        let source = open_source(&plan.np, None)
            .map_err(|e| Reply::error(req, code::IO, e.to_string()))?;

        let builder = Chain::builder();
        let (builder, _reader) = builder.produce(
            "netreader",
            QUEUE_DEPTH,
            NetReaderArgs {
                source: Some(source),
                sizes: plan.sizes.clone(),
                pool: plan.pool.clone(),
                stats: Arc::clone(&rte.senders),
                ackperiod: plan.np.ackperiod,
                core: None,
            },
            net_reader,
        );
        let (mut chain, _writer) = builder.consume(
            "diskwriter",
            DiskWriterArgs { writer: Some(ChunkWriter::new(&mounts, rec)) },
            disk_writer,
        );
        chain.set_error_spool(Arc::clone(&rte.errors));
        chain
            .run()
            .map_err(|e| Reply::error(req, code::INTERNAL, e.to_string()))?;
        Ok(ActiveTransfer {
            mode: TransferMode::Net2Disk,
            chain,
            controls: TransferControls::Net2Disk,
        })
    })();

    match built {
        Ok(active) => {
            rte.install_active(active);
            Reply::ok(req)
        }
        Err(reply) => {
            rte.release();
            reply
        }
    }
}

pub fn record(req: &Request, rte: &Arc<Runtime>) -> Reply {
    if req.query {
        let dir = rte.scandir.lock().unwrap();
        let state = if rte.transfermode() == TransferMode::In2Disk { "on" } else { "off" };
        return Reply::ok_with(req, vec![state.to_string(), dir.len().to_string()]);
    }
    match req.arg(0) {
        Some("on") => record_on(req, rte),
        Some("off") => record_off(req, rte),
        _ => Reply::error(req, code::SYNTAX, "expected on or off"),
    }
}

fn record_on(req: &Request, rte: &Arc<Runtime>) -> Reply {
    let Some(scan_name) = req.arg(1) else {
        return Reply::error(req, code::SYNTAX, "record=on needs a scan name");
    };
    if let Err(sluice::ModeError::Busy { current }) = rte.claim(TransferMode::In2Disk) {
        return busy(req, current);
    }

    let built = (|| {
        let mounts = rte.vbs.mounts();
        if mounts.is_empty() {
            return Err(Reply::error(req, code::IO, "no mountpoints initialised"));
        }
        let plan = plan(req, rte, "record")?;
        let scan = rte
            .scandir
            .lock()
            .unwrap()
            .start_scan(scan_name, 0)
            .map_err(|e| Reply::error(req, code::SYNTAX, e.to_string()))?;

        let builder = Chain::builder();
        let (builder, source) = builder.produce(
            "fiforeader",
            QUEUE_DEPTH,
            FifoReaderArgs {
                source: Some(Box::new(PatternSource::default())),
                pool: plan.pool.clone(),
                run: true,
                nbytes: None,
            },
            fifo_reader,
        );
        // tee the stream into the interchain queues so a second pipeline
        // can snoop the recording as it happens
        let (builder, _fork) = builder.step(
            "fork",
            QUEUE_DEPTH,
            HubForkerArgs { hub: Arc::clone(&rte.hub) },
            hub_forker,
        );
        let (mut chain, _writer) = builder.consume(
            "diskwriter",
            DiskWriterArgs { writer: Some(ChunkWriter::new(&mounts, scan_name)) },
            disk_writer,
        );
        chain.set_error_spool(Arc::clone(&rte.errors));
        chain
            .run()
            .map_err(|e| Reply::error(req, code::INTERNAL, e.to_string()))?;
        Ok(ActiveTransfer {
            mode: TransferMode::In2Disk,
            chain,
            controls: TransferControls::Record { source, scan },
        })
    })();

    match built {
        Ok(active) => {
            rte.install_active(active);
            Reply::ok(req)
        }
        Err(reply) => {
            rte.release();
            reply
        }
    }
}

fn record_off(req: &Request, rte: &Arc<Runtime>) -> Reply {
    let current = rte.transfermode();
    if current != TransferMode::In2Disk {
        return busy(req, current);
    }
    let Some(mut active) = rte.take_active() else {
        rte.release();
        return Reply::error(req, code::INTERNAL, "gate held but no transfer installed");
    };
    let result = active.chain.stop();
    let mut values = Vec::new();
    let mut scan_err = None;
    if let TransferControls::Record { source, scan } = &active.controls {
        let bytes = source.total();
        // an unclosed scan entry means the directory is lying about the
        // recording; the reply must not pretend otherwise
        scan_err = rte.scandir.lock().unwrap().finish_scan(scan, bytes).err();
        values.push(bytes.to_string());
    }
    rte.release();
    match (result, scan_err) {
        (Ok(()), None) => Reply::ok_with(req, values),
        (Ok(()), Some(e)) => {
            Reply::error(req, code::INTERNAL, format!("scan not closed: {e}"))
        }
        (Err(ChainError::Step { name, err }), _) => {
            Reply::error(req, err.code(), format!("{name}: {err}"))
        }
        (Err(e), _) => Reply::error(req, code::INTERNAL, e.to_string()),
    }
}
