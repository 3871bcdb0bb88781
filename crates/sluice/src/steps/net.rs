use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::Arc,
    time::Duration,
};

use sluice_communication::{Block, BlockPool, Bqueue};
use sluice_format::{ConstraintSet, HeaderSearch, Protocol, SEQUENCE_HEADER};
use sluice_net::{DataSink, DataSource, EstablishedSource, SenderStats, decode_seqnr, encode_seqnr};
use sluice_utils::{StageKind, boot_stage, soft_assert};
use tracing::{debug, trace, warn};

use crate::{
    chain::{StageCtx, StepError},
    steps::{CANCEL_POLL, is_wakeup},
};

/// Arguments of the sending network stage. The sink is built by the
/// `connect` sub-command and taken out of the args when the stream starts.
pub struct NetWriterArgs {
    pub sink: Option<DataSink>,
    pub sizes: ConstraintSet,
    /// With a tracker installed, a udps write that would block may be shed,
    /// but never one whose chunk holds frame-header bytes.
    pub headersearch: Option<HeaderSearch>,
    pub start_seqnr: u64,
    /// Core to pin the writer thread to, when the embedder laid cores out.
    pub core: Option<usize>,
}

enum SendOutcome {
    Sent,
    Shed,
    Cancelled,
}

/// Consumer chopping blocks into write-size units and pushing them out the
/// data connection; udps units get the running sequence number stamped in
/// front.
pub fn net_writer(
    inq: &Bqueue<Block>,
    ctx: &StageCtx<NetWriterArgs>,
) -> Result<(), StepError> {
    let Some((mut sink, sizes, mut search, mut seqnr, core)) = ctx.wait_args(|a| {
        a.sink
            .take()
            .map(|s| (s, a.sizes.clone(), a.headersearch.take(), a.start_seqnr, a.core))
    }) else {
        return Ok(());
    };
    boot_stage(StageKind::PacketWriter, core);
    soft_assert!(sizes.validate().is_ok(), "netwriter started with inconsistent sizes");

    let payload = sizes.payload_size.max(1);
    let udps = sizes.application == Protocol::Udps;
    let mut dgram = vec![0u8; SEQUENCE_HEADER + payload];

    // shedding needs to see the kernel refuse, so only then go nonblocking
    if let (DataSink::Udp(sock), true) = (&sink, search.is_some()) {
        sock.set_nonblocking(true)?;
    }

    let mut shed_bytes = 0u64;
    while let Some(b) = inq.pop() {
        for chunk in b.as_slice().chunks(payload) {
            if ctx.cancelled() {
                return Ok(());
            }
            // the tracker is stateful: ask it for every chunk, in order
            let holds_header = search.as_mut().map(|h| h.contains_header(chunk));
            match &mut sink {
                DataSink::Tcp(stream) => {
                    if !write_all_wakeup(stream, chunk, ctx)? {
                        return Ok(());
                    }
                    ctx.count(chunk.len() as u64);
                }
                DataSink::Udp(sock) => {
                    let wire: &[u8] = if udps {
                        encode_seqnr(&mut dgram, seqnr);
                        dgram[SEQUENCE_HEADER..SEQUENCE_HEADER + chunk.len()]
                            .copy_from_slice(chunk);
                        &dgram[..SEQUENCE_HEADER + chunk.len()]
                    } else {
                        chunk
                    };
                    match send_with_shed(sock, wire, holds_header, ctx)? {
                        SendOutcome::Sent => ctx.count(chunk.len() as u64),
                        SendOutcome::Shed => shed_bytes += chunk.len() as u64,
                        SendOutcome::Cancelled => return Ok(()),
                    }
                    if udps {
                        seqnr = seqnr.wrapping_add(1);
                    }
                }
            }
        }
    }
    if shed_bytes > 0 {
        warn!(shed_bytes, "netwriter shed load");
    }
    Ok(())
}

fn send_with_shed(
    sock: &std::net::UdpSocket,
    wire: &[u8],
    holds_header: Option<bool>,
    ctx: &StageCtx<NetWriterArgs>,
) -> Result<SendOutcome, StepError> {
    loop {
        match sock.send(wire) {
            Ok(_) => return Ok(SendOutcome::Sent),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // header chunks are never shed; the correlator resyncs on
                // them
                if holds_header == Some(false) {
                    trace!(len = wire.len(), "kernel full, chunk shed");
                    return Ok(SendOutcome::Shed);
                }
                if ctx.cancelled() {
                    return Ok(SendOutcome::Cancelled);
                }
                std::thread::sleep(Duration::from_micros(100));
            }
            Err(e) if is_wakeup(&e) => {
                if ctx.cancelled() {
                    return Ok(SendOutcome::Cancelled);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// `write_all` that treats wakeups as "re-check the cancel flag"; false
/// means the stage was cancelled mid-write.
fn write_all_wakeup<A>(
    stream: &mut TcpStream,
    mut buf: &[u8],
    ctx: &StageCtx<A>,
) -> Result<bool, StepError> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(StepError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "peer stopped taking data",
                )));
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if is_wakeup(&e) => {
                if ctx.cancelled() {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Arguments of the receiving network stage.
pub struct NetReaderArgs {
    pub source: Option<DataSource>,
    pub sizes: ConstraintSet,
    pub pool: BlockPool,
    /// Shared with the runtime so `evlbi?` sees live numbers.
    pub stats: Arc<SenderStats>,
    pub ackperiod: usize,
    /// Core to pin the reader thread to, when the embedder laid cores out.
    pub core: Option<usize>,
}

/// Producer assembling blocks from the data connection. For udps the
/// per-datagram sequence numbers feed the per-sender statistics, and the
/// NACKs they generate go straight back out the same socket.
pub fn net_reader(
    outq: &Bqueue<Block>,
    ctx: &StageCtx<NetReaderArgs>,
) -> Result<(), StepError> {
    let Some((source, sizes, pool, stats, ackperiod, core)) = ctx.wait_args(|a| {
        a.source.take().map(|s| {
            (s, a.sizes.clone(), a.pool.clone(), Arc::clone(&a.stats), a.ackperiod, a.core)
        })
    }) else {
        return Ok(());
    };
    boot_stage(StageKind::PacketReader, core);

    let established = match source.establish() {
        Ok(e) => e,
        Err(e) if is_wakeup(&e) && ctx.cancelled() => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    match established {
        EstablishedSource::Tcp(mut stream) => tcp_read_loop(&mut stream, outq, &pool, ctx),
        EstablishedSource::Udp(sock) => {
            let udps = sizes.application == Protocol::Udps;
            udp_read_loop(&sock, udps, outq, &pool, &stats, ackperiod, ctx)
        }
    }
}

fn tcp_read_loop(
    stream: &mut TcpStream,
    outq: &Bqueue<Block>,
    pool: &BlockPool,
    ctx: &StageCtx<NetReaderArgs>,
) -> Result<(), StepError> {
    loop {
        if ctx.cancelled() {
            return Ok(());
        }
        let Some(mut b) = pool.get_timeout(CANCEL_POLL) else { continue };
        let mut filled = 0;
        let mut eof = false;
        if let Some(buf) = b.as_mut_slice() {
            while filled < buf.len() {
                match stream.read(&mut buf[filled..]) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => filled += n,
                    Err(e) if is_wakeup(&e) => {
                        if ctx.cancelled() {
                            return Ok(());
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if filled > 0 {
            b.resize(filled);
            let len = filled as u64;
            if !outq.push(b) {
                return Ok(());
            }
            ctx.count(len);
        }
        if eof {
            debug!("data connection closed by peer");
            return Ok(());
        }
    }
}

fn udp_read_loop(
    sock: &std::net::UdpSocket,
    udps: bool,
    outq: &Bqueue<Block>,
    pool: &BlockPool,
    stats: &SenderStats,
    ackperiod: usize,
    ctx: &StageCtx<NetReaderArgs>,
) -> Result<(), StepError> {
    let mut dgram = vec![0u8; 65536];
    let mut block: Option<Block> = None;
    let mut offset = 0usize;

    loop {
        if ctx.cancelled() {
            return Ok(());
        }
        let (n, from) = match sock.recv_from(&mut dgram) {
            Ok(r) => r,
            Err(e) if is_wakeup(&e) => continue,
            Err(e) => return Err(e.into()),
        };

        let payload = if udps {
            let Some(seqnr) = decode_seqnr(&dgram[..n]) else {
                trace!(len = n, %from, "runt datagram dropped");
                continue;
            };
            if let Some(nack) = stats.record(from, seqnr, ackperiod) {
                if let Err(err) = sock.send_to(&nack.to_wire(), from) {
                    warn!(?err, %from, "couldn't send nack");
                }
            }
            &dgram[SEQUENCE_HEADER..n]
        } else {
            &dgram[..n]
        };

        let mut taken = 0;
        while taken < payload.len() {
            let mut b = match block.take() {
                Some(b) => b,
                None => {
                    offset = 0;
                    match pool.get_timeout(CANCEL_POLL) {
                        Some(b) => b,
                        None => {
                            if ctx.cancelled() {
                                return Ok(());
                            }
                            // receiver starved of blocks sheds the rest
                            break;
                        }
                    }
                }
            };
            let room = b.len() - offset;
            let take = room.min(payload.len() - taken);
            if let Some(buf) = b.as_mut_slice() {
                buf[offset..offset + take].copy_from_slice(&payload[taken..taken + take]);
            }
            offset += take;
            taken += take;
            if offset == b.len() {
                let len = b.len() as u64;
                if !outq.push(b) {
                    return Ok(());
                }
                ctx.count(len);
            } else {
                block = Some(b);
            }
        }
    }
}
