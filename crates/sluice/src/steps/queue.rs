use std::{io, sync::Arc};

use sluice_communication::{Block, BlockPool, BroadcastHub, Bqueue};

use crate::{
    chain::{StageCtx, StepError},
    steps::{CANCEL_POLL, is_wakeup},
};

/// Consumer copying the stream into every registered interchain queue,
/// blocking on slow snoopers. Terminal stage of buffering pipelines.
pub struct HubWriterArgs {
    pub hub: Arc<BroadcastHub>,
    /// Disable the registered queues when the stream ends, so snooping
    /// chains drain out with it.
    pub disable_on_exit: bool,
}

pub fn hub_writer(
    inq: &Bqueue<Block>,
    ctx: &StageCtx<HubWriterArgs>,
) -> Result<(), StepError> {
    let (hub, disable) = ctx.with_args(|a| (Arc::clone(&a.hub), a.disable_on_exit));
    while let Some(b) = inq.pop() {
        let len = b.len() as u64;
        // a refused push only means a snooper went away mid-stream
        hub.push_all(&b);
        ctx.count(len);
        if ctx.cancelled() {
            break;
        }
    }
    if disable {
        hub.disable_all();
    }
    Ok(())
}

/// Producer popping from one registered interchain queue into its own
/// chain. Distinct from [`FifoReaderArgs`]: this one can either reuse the
/// broadcast blocks or copy them into a chain-local pool.
pub struct HubReaderArgs {
    pub queue: Arc<Bqueue<Block>>,
    pub pool: Option<BlockPool>,
    /// Push the broadcast block itself instead of a local copy.
    pub reuse_blocks: bool,
    pub run: bool,
    pub finished: bool,
}

pub fn hub_reader(
    outq: &Bqueue<Block>,
    ctx: &StageCtx<HubReaderArgs>,
) -> Result<(), StepError> {
    let Some((queue, pool, reuse)) = ctx.wait_args(|a| {
        a.run.then(|| (Arc::clone(&a.queue), a.pool.clone(), a.reuse_blocks))
    }) else {
        return Ok(());
    };

    'stream: while let Some(b) = queue.pop() {
        if ctx.cancelled() {
            break;
        }
        let out = match (&pool, reuse) {
            (Some(pool), false) => {
                let mut copy = loop {
                    match pool.get_timeout(CANCEL_POLL) {
                        Some(c) => break c,
                        None if ctx.cancelled() => break 'stream,
                        None => {}
                    }
                };
                let n = b.len().min(copy.len());
                if let Some(buf) = copy.as_mut_slice() {
                    buf[..n].copy_from_slice(&b[..n]);
                }
                copy.resize(n);
                copy
            }
            _ => b,
        };
        let len = out.len() as u64;
        if !outq.push(out) {
            break;
        }
        ctx.count(len);
    }
    ctx.with_args(|a| a.finished = true);
    Ok(())
}

/// Pass-through stage teeing the stream into the interchain queues without
/// ever stalling the main transfer: broadcast pushes are best-effort.
pub struct HubForkerArgs {
    pub hub: Arc<BroadcastHub>,
}

pub fn hub_forker(
    inq: &Bqueue<Block>,
    outq: &Bqueue<Block>,
    ctx: &StageCtx<HubForkerArgs>,
) -> Result<(), StepError> {
    let hub = ctx.with_args(|a| Arc::clone(&a.hub));
    while let Some(b) = inq.pop() {
        if ctx.cancelled() {
            break;
        }
        hub.try_push_all(&b);
        let len = b.len() as u64;
        if !outq.push(b) {
            break;
        }
        ctx.count(len);
    }
    Ok(())
}

/// Byte source a capture-hardware producer drains. The real recorder feeds
/// this from the capture board FIFO through the device SDK; that half
/// lives outside this crate.
pub trait SampleSource: Send {
    /// Fill as much of `buf` as is available now; `Ok(0)` ends the stream.
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Deterministic ascending 32-bit word pattern, the stand-in source for
/// recording without hardware attached.
#[derive(Default)]
pub struct PatternSource {
    next: u32,
}

impl SampleSource for PatternSource {
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        for w in buf.chunks_exact_mut(4) {
            w.copy_from_slice(&self.next.to_le_bytes());
            self.next = self.next.wrapping_add(1);
        }
        Ok(buf.len() & !3)
    }
}

/// Producer draining a [`SampleSource`] into pool blocks. Like the fill
/// producer it idles until `run`; unlike it, the source is taken out of the
/// args when the stream starts.
pub struct FifoReaderArgs {
    pub source: Option<Box<dyn SampleSource>>,
    pub pool: BlockPool,
    pub run: bool,
    /// Stop after this many bytes; partial final block allowed.
    pub nbytes: Option<u64>,
}

pub fn fifo_reader(
    outq: &Bqueue<Block>,
    ctx: &StageCtx<FifoReaderArgs>,
) -> Result<(), StepError> {
    let Some((mut source, pool, nbytes)) = ctx.wait_args(|a| {
        if !a.run {
            return None;
        }
        a.source.take().map(|s| (s, a.pool.clone(), a.nbytes))
    }) else {
        return Ok(());
    };

    let mut total = 0u64;
    'stream: while nbytes.is_none_or(|n| total < n) {
        if ctx.cancelled() {
            break;
        }
        let Some(mut b) = pool.get_timeout(CANCEL_POLL) else { continue };

        let mut want = b.len();
        if let Some(n) = nbytes {
            want = want.min((n - total) as usize);
        }
        let mut filled = 0;
        if let Some(buf) = b.as_mut_slice() {
            while filled < want {
                match source.fill(&mut buf[filled..want]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if is_wakeup(&e) => {
                        if ctx.cancelled() {
                            break 'stream;
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if filled == 0 {
            break;
        }
        b.resize(filled);
        if !outq.push(b) {
            break;
        }
        total += filled as u64;
        ctx.count(filled as u64);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pattern_source_counts_words() {
        let mut src = PatternSource::default();
        let mut buf = [0u8; 12];
        assert_eq!(src.fill(&mut buf).unwrap(), 12);
        assert_eq!(&buf[..4], &0u32.to_le_bytes());
        assert_eq!(&buf[8..], &2u32.to_le_bytes());
        assert_eq!(src.fill(&mut buf).unwrap(), 12);
        assert_eq!(&buf[..4], &3u32.to_le_bytes());
    }
}
