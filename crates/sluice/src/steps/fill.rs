use sluice_communication::{Block, BlockPool, Bqueue};

use crate::{
    chain::{StageCtx, StepError},
    steps::CANCEL_POLL,
};

/// Default fill word, recognisable in any hexdump of the receiving end.
pub const DEFAULT_FILL_WORD: u64 = 0x1122_3344_1122_3344;

/// Arguments of the fill-pattern producer. The stage idles until `run`
/// flips true, so `fill2net=connect` can build the chain long before
/// `fill2net=on` opens the tap.
pub struct FillArgs {
    pub run: bool,
    pub fill_word: u64,
    /// Added to the fill word after every block; zero keeps it constant.
    pub inc: u64,
    /// Stop after this many blocks; `None` runs until stopped.
    pub nblocks: Option<u64>,
    pub pool: BlockPool,
}

impl FillArgs {
    pub fn new(pool: BlockPool) -> Self {
        Self { run: false, fill_word: DEFAULT_FILL_WORD, inc: 0, nblocks: None, pool }
    }
}

/// Producer generating blocks of repeated 64-bit fill words; the stand-in
/// data source for `fill2net` and for exercising a transfer without the
/// capture hardware.
pub fn fill_producer(
    outq: &Bqueue<Block>,
    ctx: &StageCtx<FillArgs>,
) -> Result<(), StepError> {
    let Some((mut word, inc, nblocks, pool)) =
        ctx.wait_args(|a| a.run.then(|| (a.fill_word, a.inc, a.nblocks, a.pool.clone())))
    else {
        return Ok(());
    };

    let mut made = 0u64;
    while nblocks.is_none_or(|n| made < n) {
        if ctx.cancelled() {
            break;
        }
        let Some(mut b) = pool.get_timeout(CANCEL_POLL) else { continue };
        if let Some(buf) = b.as_mut_slice() {
            for w in buf.chunks_exact_mut(8) {
                w.copy_from_slice(&word.to_le_bytes());
            }
        }
        let len = b.len() as u64;
        if !outq.push(b) {
            break;
        }
        ctx.count(len);
        word = word.wrapping_add(inc);
        made += 1;
    }
    Ok(())
}
