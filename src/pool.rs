//! Fixed-capacity buffer pool.
//!
//! The pool is an arena of slots addressed by `BufferHandle` (index + generation).
//! `acquire` checks a slot out as a `PooledBuffer`, which owns the slot's storage
//! until it checks itself back in, either through `BufferPool::release` or when it
//! is dropped. There is no way to free a slot without its buffer, so a slot is
//! never handed out twice. A check-in for a slot that is already free, or for a
//! stale generation, is rejected and logged so double releases surface instead
//! of corrupting the free list.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{PipelineError, PipelineResult};

/// Default number of buffers, matching the usual camera SDK default.
pub const DEFAULT_POOL_CAPACITY: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferHandle {
    index: usize,
    generation: u64,
}

impl BufferHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Shared handle to the pool. Clones refer to the same slots.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    capacity: usize,
    buffer_len: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    slots: Vec<Slot>,
    free: Vec<usize>,
    in_use: usize,
    peak_in_use: usize,
    rejected_releases: u64,
}

struct Slot {
    storage: Option<Vec<u8>>,
    generation: u64,
    in_use: bool,
}

impl BufferPool {
    /// Allocate `capacity` buffers of `buffer_len` bytes each.
    pub fn new(capacity: usize, buffer_len: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                storage: Some(vec![0u8; buffer_len]),
                generation: 0,
                in_use: false,
            })
            .collect();
        // Reverse so slot 0 is handed out first.
        let free = (0..capacity).rev().collect();
        Self {
            shared: Arc::new(PoolShared {
                capacity,
                buffer_len,
                state: Mutex::new(PoolState {
                    slots,
                    free,
                    in_use: 0,
                    peak_in_use: 0,
                    rejected_releases: 0,
                }),
            }),
        }
    }

    /// Check out a free buffer, or fail with `Exhausted` without blocking.
    pub fn acquire(&self) -> PipelineResult<PooledBuffer> {
        let mut state = self.shared.lock();
        let Some(index) = state.free.pop() else {
            return Err(PipelineError::Exhausted {
                capacity: self.shared.capacity,
            });
        };
        let slot = &mut state.slots[index];
        slot.in_use = true;
        slot.generation += 1;
        let generation = slot.generation;
        let data = slot
            .storage
            .take()
            .unwrap_or_else(|| vec![0u8; self.shared.buffer_len]);

        state.in_use += 1;
        state.peak_in_use = state.peak_in_use.max(state.in_use);

        Ok(PooledBuffer {
            handle: BufferHandle { index, generation },
            data,
            pool: Arc::clone(&self.shared),
            checked_in: false,
        })
    }

    /// Return a buffer to the pool.
    pub fn release(&self, mut buffer: PooledBuffer) -> PipelineResult<()> {
        buffer.check_in()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn buffer_len(&self) -> usize {
        self.shared.buffer_len
    }

    pub fn in_use(&self) -> usize {
        self.shared.lock().in_use
    }

    pub fn available(&self) -> usize {
        self.shared.lock().free.len()
    }

    pub fn peak_in_use(&self) -> usize {
        self.shared.lock().peak_in_use
    }

    pub fn rejected_releases(&self) -> u64 {
        self.shared.lock().rejected_releases
    }
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_in(&self, handle: BufferHandle, data: Vec<u8>) -> PipelineResult<()> {
        let mut state = self.lock();
        let valid = state
            .slots
            .get(handle.index)
            .is_some_and(|slot| slot.in_use && slot.generation == handle.generation);
        if !valid {
            state.rejected_releases += 1;
            log::error!(
                "BufferPool: rejected release of slot {} (generation {}): already free",
                handle.index,
                handle.generation
            );
            return Err(PipelineError::DoubleRelease {
                index: handle.index,
            });
        }

        let slot = &mut state.slots[handle.index];
        slot.in_use = false;
        slot.storage = Some(data);
        state.free.push(handle.index);
        state.in_use -= 1;
        Ok(())
    }
}

/// A checked-out pool buffer. Not `Clone`: one owner per slot.
pub struct PooledBuffer {
    handle: BufferHandle,
    data: Vec<u8>,
    pool: Arc<PoolShared>,
    checked_in: bool,
}

impl PooledBuffer {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn check_in(&mut self) -> PipelineResult<()> {
        if self.checked_in {
            return Ok(());
        }
        self.checked_in = true;
        let data = std::mem::take(&mut self.data);
        self.pool.check_in(self.handle, data)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // Rejections are already logged by the pool.
        let _ = self.check_in();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_fails_when_all_buffers_in_use() {
        let pool = BufferPool::new(2, 8);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();

        assert_eq!(
            pool.acquire().err(),
            Some(PipelineError::Exhausted { capacity: 2 })
        );

        pool.release(a).unwrap();
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn dropping_a_buffer_returns_it() {
        let pool = BufferPool::new(3, 8);
        {
            let _a = pool.acquire().unwrap();
            let _b = pool.acquire().unwrap();
            assert_eq!(pool.in_use(), 2);
        }
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.peak_in_use(), 2);
    }

    #[test]
    fn double_release_is_rejected() {
        let pool = BufferPool::new(1, 8);
        let mut buffer = pool.acquire().unwrap();
        buffer.check_in().unwrap();
        assert_eq!(pool.available(), 1);

        // Force a second check-in of the same guard.
        buffer.checked_in = false;
        assert_eq!(
            buffer.check_in(),
            Err(PipelineError::DoubleRelease { index: 0 })
        );
        assert_eq!(pool.rejected_releases(), 1);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn release_by_the_pool_is_idempotent_with_drop() {
        let pool = BufferPool::new(1, 8);
        let buffer = pool.acquire().unwrap();
        pool.release(buffer).unwrap();
        assert_eq!(pool.rejected_releases(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn stale_generation_does_not_free_a_reused_slot() {
        let pool = BufferPool::new(1, 8);
        let mut first = pool.acquire().unwrap();
        first.check_in().unwrap();

        let second = pool.acquire().unwrap();
        assert_eq!(second.handle().index(), first.handle().index());
        first.checked_in = false;
        assert!(first.check_in().is_err());
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.available(), 0);
        drop(second);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn a_live_buffer_keeps_its_slot_out_of_circulation() {
        let pool = BufferPool::new(1, 8);
        let held = pool.acquire().unwrap();
        assert_eq!(pool.acquire().err(), Some(PipelineError::Exhausted { capacity: 1 }));
        assert_eq!(pool.peak_in_use(), 1);
        drop(held);
        let again = pool.acquire().unwrap();
        assert_eq!(again.handle().index(), 0);
    }

    #[test]
    fn buffers_keep_their_storage_across_reuse() {
        let pool = BufferPool::new(1, 4);
        let mut buffer = pool.acquire().unwrap();
        buffer.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        drop(buffer);

        let buffer = pool.acquire().unwrap();
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4]);
    }
}
