use std::io;
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use super::block::Block;
use super::registry::MemoryRegistry;
use super::{MemoryRegistrar, DEFAULT_PAYLOAD};

struct PoolShared {
    base: usize,
    chunk_size: usize,
    free: SegQueue<usize>,
    // The backing memory must outlive every lease; it is only ever accessed
    // through chunk pointers handed out via the free queue, which guarantees
    // one owner per chunk at a time.
    _mem: Box<[u8]>,
}

// SAFETY: chunk ownership is serialized by the free queue, exactly one lease
// exists per popped index, and the metadata is immutable after construction.
unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

/// Pool of fixed-size blocks carved out of one large registered region.
///
/// Allocation is lock-free; a dropped lease returns its chunk to the pool.
pub struct BlockPool {
    shared: Arc<PoolShared>,
}

impl BlockPool {
    /// Carve `chunks` blocks of the default payload size out of a single
    /// region, register the region, and advertise it to `registry`.
    pub fn new(
        registrar: &dyn MemoryRegistrar,
        registry: &MemoryRegistry,
        chunks: usize,
    ) -> io::Result<Self> {
        let chunk_size = DEFAULT_PAYLOAD;
        let total = chunk_size
            .checked_mul(chunks)
            .ok_or_else(|| io::Error::other("block pool size overflow"))?;
        let mem = vec![0u8; total].into_boxed_slice();
        let base = mem.as_ptr() as usize;

        let handle = registrar.register(base, total)?;
        registry.add_region(base, total, handle.lkey, handle.guard);

        let free = SegQueue::new();
        for idx in 0..chunks {
            free.push(idx);
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                base,
                chunk_size,
                free,
                _mem: mem,
            }),
        })
    }

    /// Lease one registered block, or `None` when the pool is exhausted.
    pub fn alloc_block(&self) -> Option<Arc<Block>> {
        let idx = self.shared.free.pop()?;
        let ptr = self.shared.base + idx * self.shared.chunk_size;
        let lease = PoolLease {
            pool: Arc::clone(&self.shared),
            idx,
        };
        Some(Block::leased(ptr, self.shared.chunk_size, lease))
    }

    /// Number of currently free chunks.
    pub fn available(&self) -> usize {
        self.shared.free.len()
    }
}

/// Lease on one pool chunk, returned on drop.
pub struct PoolLease {
    pool: Arc<PoolShared>,
    idx: usize,
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.free.push(self.idx);
    }
}
