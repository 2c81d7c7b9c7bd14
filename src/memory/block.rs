use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use super::block_pool::PoolLease;
use super::DEFAULT_PAYLOAD;

enum BlockOwner {
    Heap(#[allow(dead_code)] BytesMut),
    Lease(#[allow(dead_code)] PoolLease),
}

/// A fixed-capacity chunk of bytes, either plain heap memory (lkey 0) or a
/// lease on a pre-registered pool chunk.
///
/// All access goes through the raw base pointer captured at construction;
/// the owner field only keeps the backing memory alive. `[0, used)` is the
/// initialized prefix. Appends are performed by the single `ChunkedBuf`
/// holding the unique tail reference, so writes past `used` never race with
/// reads of the prefix.
pub struct Block {
    ptr: usize,
    cap: usize,
    used: AtomicUsize,
    _owner: BlockOwner,
}

// SAFETY: the backing memory is owned (heap) or leased (pool) for the
// block's lifetime, the pointer never changes, and mutation is confined to
// the un-shared region past `used` as documented above.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// Allocate an unregistered heap block of the default payload size.
    pub fn heap() -> Arc<Self> {
        Self::heap_with_capacity(DEFAULT_PAYLOAD)
    }

    pub fn heap_with_capacity(cap: usize) -> Arc<Self> {
        // Fixed capacity, never resized, so the base pointer is stable.
        let mem = BytesMut::zeroed(cap);
        Arc::new(Self {
            ptr: mem.as_ptr() as usize,
            cap,
            used: AtomicUsize::new(0),
            _owner: BlockOwner::Heap(mem),
        })
    }

    pub(crate) fn leased(ptr: usize, cap: usize, lease: PoolLease) -> Arc<Self> {
        Arc::new(Self {
            ptr,
            cap,
            used: AtomicUsize::new(0),
            _owner: BlockOwner::Lease(lease),
        })
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.ptr
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn data_at(&self, offset: usize) -> *const u8 {
        debug_assert!(offset <= self.cap);
        (self.ptr + offset) as *const u8
    }

    /// View of the initialized range `[offset, offset + len)`.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.used());
        unsafe { std::slice::from_raw_parts(self.data_at(offset), len) }
    }

    /// Append `src` at the current watermark. The caller must hold the
    /// unique reference to this block (tail of the owning buffer).
    pub fn append(&self, src: &[u8]) -> usize {
        let used = self.used.load(Ordering::Relaxed);
        let n = src.len().min(self.cap - used);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), (self.ptr + used) as *mut u8, n);
        }
        self.used.store(used + n, Ordering::Release);
        n
    }

    /// Mark the whole capacity initialized. Used for receive blocks the
    /// hardware writes into after posting.
    pub(crate) fn mark_full(&self) {
        self.used.store(self.cap, Ordering::Release);
    }
}

/// A byte range inside a shared block.
#[derive(Clone)]
pub struct BlockRef {
    pub block: Arc<Block>,
    pub offset: usize,
    pub len: usize,
}

impl BlockRef {
    #[inline]
    pub fn data(&self) -> *const u8 {
        self.block.data_at(self.offset)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.block.slice(self.offset, self.len)
    }
}
