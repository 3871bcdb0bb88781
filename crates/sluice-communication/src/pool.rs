use std::sync::{Arc, Condvar, Mutex, Weak};

use sluice_utils::soft_assert_eq;
use tracing::debug;

use crate::{Block, error::PoolError};

/// Backing buffer of one [`Block`]. Its drop is what implements
/// "pool-return-on-last-reference": the box travels back to the free list of
/// the pool it was drawn from, or is simply freed for loose storage.
pub(crate) struct Storage {
    buf: Option<Box<[u8]>>,
    home: Weak<Shared>,
}

impl Storage {
    pub(crate) fn loose(buf: Box<[u8]>) -> Self {
        Self { buf: Some(buf), home: Weak::new() }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    pub(crate) fn data(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let (Some(buf), Some(pool)) = (self.buf.take(), self.home.upgrade()) {
            pool.put_back(buf);
        }
    }
}

struct Inner {
    free: Vec<Box<[u8]>>,
    allocated: usize,
}

struct Shared {
    blocksize: usize,
    blocks_per_chunk: usize,
    max_blocks: usize,
    inner: Mutex<Inner>,
    returned: Condvar,
}

impl Shared {
    fn put_back(&self, buf: Box<[u8]>) {
        let mut inner = self.inner.lock().unwrap();
        inner.free.push(buf);
        drop(inner);
        self.returned.notify_one();
    }
}

/// Fixed-item-size buffer pool.
///
/// Buffers are allocated `blocks_per_chunk` at a time to amortise
/// allocation, up to `max_blocks`; an exhausted pool blocks in [`get`]
/// until a block comes back. Memory is only released to the OS when the
/// last handle to the pool *and* every outstanding block have dropped.
///
/// Clones share the same pool; a stage hands clones to whoever needs to
/// draw from its pool.
///
/// [`get`]: BlockPool::get
#[derive(Clone)]
pub struct BlockPool {
    shared: Arc<Shared>,
}

impl BlockPool {
    pub fn new(blocksize: usize, blocks_per_chunk: usize) -> Result<Self, PoolError> {
        Self::with_cap(blocksize, blocks_per_chunk, usize::MAX)
    }

    /// Pool that refuses to grow beyond `max_blocks` buffers in total.
    pub fn with_cap(
        blocksize: usize,
        blocks_per_chunk: usize,
        max_blocks: usize,
    ) -> Result<Self, PoolError> {
        if blocksize == 0 {
            return Err(PoolError::ZeroBlockSize);
        }
        if blocks_per_chunk == 0 {
            return Err(PoolError::ZeroChunkSize);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                blocksize,
                blocks_per_chunk,
                max_blocks: max_blocks.max(1),
                inner: Mutex::new(Inner { free: Vec::new(), allocated: 0 }),
                returned: Condvar::new(),
            }),
        })
    }

    pub fn blocksize(&self) -> usize {
        self.shared.blocksize
    }

    /// Blocks drawn so far minus blocks sitting on the free list.
    pub fn outstanding(&self) -> usize {
        let inner = self.shared.inner.lock().unwrap();
        inner.allocated - inner.free.len()
    }

    /// Total buffers ever allocated by this pool.
    pub fn allocated(&self) -> usize {
        self.shared.inner.lock().unwrap().allocated
    }

    /// Draw a fresh block of exactly `blocksize` bytes, growing the pool a
    /// chunk at a time and blocking once the cap is reached.
    pub fn get(&self) -> Block {
        let sh = &self.shared;
        let mut inner = sh.inner.lock().unwrap();
        loop {
            if let Some(buf) = inner.free.pop() {
                return self.wrap(buf);
            }
            if inner.allocated < sh.max_blocks {
                self.grow(&mut inner);
                continue;
            }
            inner = sh.returned.wait(inner).unwrap();
        }
    }

    /// Like [`get`](BlockPool::get), but gives up after `timeout` so a
    /// stage blocked on an exhausted pool can notice its cancel flag.
    pub fn get_timeout(&self, timeout: std::time::Duration) -> Option<Block> {
        let sh = &self.shared;
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = sh.inner.lock().unwrap();
        loop {
            if let Some(buf) = inner.free.pop() {
                return Some(self.wrap(buf));
            }
            if inner.allocated < sh.max_blocks {
                self.grow(&mut inner);
                continue;
            }
            let left = deadline.checked_duration_since(std::time::Instant::now())?;
            let (g, res) = sh.returned.wait_timeout(inner, left).unwrap();
            inner = g;
            if res.timed_out() && inner.free.is_empty() {
                return None;
            }
        }
    }

    /// Nonblocking variant of [`get`](BlockPool::get) for stages that shed
    /// load instead of applying backpressure.
    pub fn try_get(&self) -> Result<Block, PoolError> {
        let sh = &self.shared;
        let mut inner = sh.inner.lock().unwrap();
        if inner.free.is_empty() {
            if inner.allocated >= sh.max_blocks {
                return Err(PoolError::Exhausted {
                    allocated: inner.allocated,
                    cap: sh.max_blocks,
                });
            }
            self.grow(&mut inner);
        }
        let buf = inner.free.pop().ok_or(PoolError::Exhausted {
            allocated: inner.allocated,
            cap: sh.max_blocks,
        })?;
        Ok(self.wrap(buf))
    }

    fn grow(&self, inner: &mut Inner) {
        let sh = &self.shared;
        let n = sh.blocks_per_chunk.min(sh.max_blocks - inner.allocated);
        debug!(blocks = n, blocksize = sh.blocksize, "blockpool grows");
        for _ in 0..n {
            inner.free.push(vec![0u8; sh.blocksize].into_boxed_slice());
        }
        inner.allocated += n;
    }

    fn wrap(&self, buf: Box<[u8]>) -> Block {
        // every buffer on the free list is exactly one pool item
        soft_assert_eq!(buf.len(), self.shared.blocksize);
        Block::from_storage(Arc::new(Storage {
            buf: Some(buf),
            home: Arc::downgrade(&self.shared),
        }))
    }
}
