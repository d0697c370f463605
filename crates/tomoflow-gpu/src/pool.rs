//! Process-wide buffer pool, one per memory domain.
//!
//! Stages reserve a lane of fixed-size buffers at construction
//! (`register_stage`) and draw from it on the hot path (`request_memory`)
//! without touching the allocator. Dropping a pooled [`Image`] puts its
//! buffer back on the lane's free list and wakes one waiter.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use tomoflow_core::{ReconError, Result};

use crate::image::Image;
use crate::manager::MemoryManager;

/// Identifies one pool lane. Ids are monotonic and never reused for the
/// lifetime of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationId(u32);

pub struct MemoryPool<M: MemoryManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: MemoryManager> Clone for MemoryPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: MemoryManager> Default for MemoryPool<M> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct PoolInner<M: MemoryManager> {
    state: Mutex<PoolState<M>>,
    available: Condvar,
}

struct PoolState<M: MemoryManager> {
    lanes: BTreeMap<RegistrationId, Lane<M>>,
    next_id: u32,
    shut_down: bool,
}

struct Lane<M: MemoryManager> {
    buf_len: usize,
    capacity: usize,
    free: Vec<M::Ptr>,
}

/// Ticket a pooled image carries so its destructor can find the way home.
/// Weak, so a pool can be torn down while images are still in flight.
pub(crate) struct PoolHandle<M: MemoryManager> {
    inner: Weak<PoolInner<M>>,
    registration: RegistrationId,
}

impl<M: MemoryManager> Clone for PoolHandle<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            registration: self.registration,
        }
    }
}

impl<M: MemoryManager> PoolHandle<M> {
    pub(crate) fn registration(&self) -> RegistrationId {
        self.registration
    }

    pub(crate) fn restock(&self, ptr: M::Ptr) {
        if let Some(pool) = self.inner.upgrade() {
            pool.restock(self.registration, ptr);
        }
        // Pool already gone: the buffer is simply freed.
    }
}

impl<M: MemoryManager> MemoryPool<M> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    lanes: BTreeMap::new(),
                    next_id: 0,
                    shut_down: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Reserve `capacity` buffers of `buf_len` elements each. Buffers are
    /// allocated eagerly; an allocation failure here is fatal for the
    /// registering stage.
    pub fn register_stage(&self, capacity: usize, buf_len: usize) -> Result<RegistrationId> {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            let ptr = M::alloc(buf_len).map_err(|e| {
                tracing::error!(capacity, buf_len, error = %e, "pool registration failed");
                ReconError::OutOfMemory {
                    count: capacity,
                    len: buf_len,
                }
            })?;
            free.push(ptr);
        }

        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(ReconError::Pipeline("memory pool is shut down".into()));
        }
        let id = RegistrationId(state.next_id);
        state.next_id += 1;
        state.lanes.insert(
            id,
            Lane {
                buf_len,
                capacity,
                free,
            },
        );
        tracing::debug!(id = id.0, capacity, buf_len, "registered pool lane");
        Ok(id)
    }

    /// Hand out one buffer from lane `id`, blocking while none is free.
    /// Returns an invalid image once the pool has been shut down.
    ///
    /// # Panics
    ///
    /// Requesting from an id that was never registered (or already freed)
    /// is a programming error.
    pub fn request_memory(&self, id: RegistrationId) -> Image<M> {
        let mut state = self.inner.state.lock();
        loop {
            if state.shut_down {
                return Image::empty();
            }
            let lane = state
                .lanes
                .get_mut(&id)
                .unwrap_or_else(|| panic!("pool lane {} is not registered", id.0));
            if let Some(ptr) = lane.free.pop() {
                let buf_len = lane.buf_len;
                drop(state);
                return Image::pooled(
                    ptr,
                    buf_len,
                    PoolHandle {
                        inner: Arc::downgrade(&self.inner),
                        registration: id,
                    },
                );
            }
            self.inner.available.wait(&mut state);
        }
    }

    /// Consume `img` and put its buffer back on the owning lane.
    ///
    /// The image's destructor routes pooled buffers back on its own, so
    /// this is just the explicit spelling of letting the handle go.
    pub fn return_memory(&self, img: Image<M>) {
        drop(img);
    }

    /// Drop all idle buffers of lane `id` and remove the lane. Buffers
    /// still checked out are freed when their images drop.
    pub fn free_registration(&self, id: RegistrationId) {
        let mut state = self.inner.state.lock();
        if state.lanes.remove(&id).is_none() {
            tracing::warn!(id = id.0, "freeing unknown pool lane");
        }
    }

    /// Tear the pool down: every current and future waiter receives an
    /// invalid image.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shut_down = true;
        state.lanes.clear();
        self.inner.available.notify_all();
    }

    /// Number of idle buffers in lane `id` (0 for unknown lanes).
    pub fn free_count(&self, id: RegistrationId) -> usize {
        self.inner
            .state
            .lock()
            .lanes
            .get(&id)
            .map_or(0, |lane| lane.free.len())
    }

    /// Number of buffers of lane `id` currently checked out.
    pub fn checked_out(&self, id: RegistrationId) -> usize {
        self.inner
            .state
            .lock()
            .lanes
            .get(&id)
            .map_or(0, |lane| lane.capacity - lane.free.len())
    }
}

impl<M: MemoryManager> PoolInner<M> {
    fn restock(&self, id: RegistrationId, ptr: M::Ptr) {
        let mut state = self.state.lock();
        if let Some(lane) = state.lanes.get_mut(&id) {
            lane.free.push(ptr);
            self.available.notify_one();
        }
        // Lane freed or pool shut down while the buffer was in flight:
        // dropping the buffer here releases the memory.
    }
}
