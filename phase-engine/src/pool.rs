//! Pool of page-committed memory buffers

use std::{
    alloc::{self, Layout},
    cmp::Ordering,
    ptr,
    sync::{Mutex, MutexGuard},
};
use thiserror::Error;

/// Default upper bound on the size of a single buffer (256 MiB)
///
/// Growing the pool by more than this amount splits the request into multiple
/// buffers, which keeps individual allocations and their commit latency
/// bounded.
///
pub const DEFAULT_CHUNK_SIZE: usize = 256 << 20;

/// Stride at which buffers are touched to commit them
pub const PAGE_SIZE: usize = 4096;

/// Thread-safe stack of resident memory buffers
///
/// Memory is released in last-allocated, first-freed order. There is no way to
/// free a specific buffer, only to shrink the pool from the top.
///
/// Every operation holds the pool's lock for its whole duration, so other
/// threads never observe a partially updated total.
///
#[derive(Debug)]
pub struct MemoryPool {
    /// Buffers and their total size
    state: Mutex<PoolState>,

    /// Maximal size of a newly allocated buffer
    chunk_size: usize,
}
//
impl MemoryPool {
    /// Set up an empty pool with the default chunk size
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Set up an empty pool that allocates buffers of at most `chunk_size` bytes
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert_ne!(chunk_size, 0, "Buffers must have a nonzero size");
        Self {
            state: Mutex::new(PoolState::default()),
            chunk_size,
        }
    }

    /// Allocate and commit `bytes` more bytes of memory
    ///
    /// If an allocation fails, the buffers that were allocated earlier in the
    /// same call are kept and accounted for.
    ///
    pub fn grow(&self, bytes: usize) -> Result<(), PoolError> {
        self.lock().grow(bytes, self.chunk_size)
    }

    /// Release `bytes` bytes of memory, most recently allocated first
    ///
    /// Asking for more than the current total empties the pool.
    ///
    pub fn shrink(&self, bytes: usize) -> Result<(), PoolError> {
        self.lock().shrink(bytes)
    }

    /// Grow or shrink the pool so that it holds exactly `target` bytes
    pub fn set_total(&self, target: usize) -> Result<(), PoolError> {
        let mut state = self.lock();
        match target.cmp(&state.total) {
            Ordering::Greater => {
                let missing = target - state.total;
                state.grow(missing, self.chunk_size)
            }
            Ordering::Less => {
                let excess = state.total - target;
                state.shrink(excess)
            }
            Ordering::Equal => Ok(()),
        }
    }

    /// Amount of memory currently held, in bytes
    pub fn current_total(&self) -> usize {
        self.lock().total
    }

    /// Size of each buffer, in allocation order
    pub fn buffer_sizes(&self) -> Vec<usize> {
        self.lock().buffers.iter().map(Buffer::len).collect()
    }

    /// Maximal size of a newly allocated buffer
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Acquire the pool's lock
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("Memory pool has been poisoned")
    }
}
//
impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure to resize the memory pool
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum PoolError {
    /// The allocator could not provide a buffer
    #[error("failed to allocate a buffer of {0} bytes")]
    OutOfMemory(usize),

    /// A requested size cannot be represented on this platform
    #[error("{0} bytes cannot be addressed on this platform")]
    Unaddressable(u64),
}

/// State protected by the pool's lock
#[derive(Debug, Default)]
struct PoolState {
    /// Buffers, in allocation order
    buffers: Vec<Buffer>,

    /// Sum of buffer sizes
    total: usize,
}
//
impl PoolState {
    /// Allocate `bytes` more bytes as buffers of at most `chunk_size` bytes
    fn grow(&mut self, bytes: usize, chunk_size: usize) -> Result<(), PoolError> {
        self.grow_with(bytes, chunk_size, Buffer::committed)
    }

    /// Like `grow`, with a custom buffer allocator
    fn grow_with(
        &mut self,
        bytes: usize,
        chunk_size: usize,
        mut allocate: impl FnMut(usize) -> Result<Buffer, PoolError>,
    ) -> Result<(), PoolError> {
        let mut remaining = bytes;
        while remaining > 0 {
            let len = remaining.min(chunk_size);
            let buffer = allocate(len)?;
            self.total += buffer.len();
            self.buffers.push(buffer);
            remaining -= len;
        }
        Ok(())
    }

    /// Free `bytes` bytes from the top of the buffer stack
    fn shrink(&mut self, bytes: usize) -> Result<(), PoolError> {
        let mut remaining = bytes;
        while remaining > 0 {
            let Some(last) = self.buffers.last_mut() else {
                log::debug!("Memory pool is empty, ignoring request to free {remaining} more bytes");
                break;
            };
            if last.len() <= remaining {
                remaining -= last.len();
                self.total -= last.len();
                self.buffers.pop();
            } else {
                let keep = last.len() - remaining;
                last.truncate(keep)?;
                self.total -= remaining;
                remaining = 0;
            }
        }
        Ok(())
    }
}

/// Heap buffer whose pages are backed by physical memory
#[derive(Debug)]
struct Buffer(Box<[u8]>);
//
impl Buffer {
    /// Allocate a buffer of `len` bytes and commit all of its pages
    fn committed(len: usize) -> Result<Self, PoolError> {
        let mut data = allocate_zeroed(len)?;
        commit_pages(&mut data);
        Ok(Self(data))
    }

    /// Size of the buffer in bytes
    fn len(&self) -> usize {
        self.0.len()
    }

    /// Shrink the buffer to its first `keep` bytes
    ///
    /// The retained prefix is moved to a fresh, smaller allocation so that the
    /// memory backing the rest of the buffer is returned to the allocator.
    ///
    fn truncate(&mut self, keep: usize) -> Result<(), PoolError> {
        debug_assert!(keep > 0 && keep < self.len());
        let mut smaller = allocate_zeroed(keep)?;
        smaller.copy_from_slice(&self.0[..keep]);
        self.0 = smaller;
        Ok(())
    }
}

/// Allocate `len` zeroed bytes without touching them
///
/// Large zeroed allocations are served by fresh mappings, which the operating
/// system only backs with physical pages once they are written to.
///
fn allocate_zeroed(len: usize) -> Result<Box<[u8]>, PoolError> {
    assert_ne!(len, 0, "Buffers must have a nonzero size");
    let layout = Layout::array::<u8>(len).map_err(|_| PoolError::OutOfMemory(len))?;
    // SAFETY: The layout has a nonzero size
    let data = unsafe { alloc::alloc_zeroed(layout) };
    if data.is_null() {
        return Err(PoolError::OutOfMemory(len));
    }
    // SAFETY: `data` was allocated by the global allocator with the layout of
    //         a `[u8]` of length `len`, and zeroed bytes are valid `u8`s.
    Ok(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(data, len)) })
}

/// Touch one byte per page so that the whole buffer becomes resident
fn commit_pages(data: &mut [u8]) {
    for byte in data.iter_mut().step_by(PAGE_SIZE) {
        *byte = byte.wrapping_add(1);
    }
    // The buffer may straddle one more page than the stride covers
    if let Some(last) = data.last_mut() {
        *last = last.wrapping_add(1);
    }
    std::hint::black_box(data);
}
