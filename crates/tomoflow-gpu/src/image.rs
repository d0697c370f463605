use std::time::{Duration, Instant};

use tomoflow_core::Result;

use crate::manager::{DomainBuffer, MemoryManager};
use crate::pool::{PoolHandle, RegistrationId};

/// Typed 1-D or 2-D buffer handle in one memory domain.
///
/// An image is either *valid*, owning a buffer that may be checked out of a
/// [`MemoryPool`](crate::pool::MemoryPool), or an empty husk. Dropping a
/// valid pool-issued image returns its buffer to the owning lane; that
/// destructor discipline is what keeps the pipeline leak-free. Frames also
/// carry the scanner-assigned index, the plane parity and a creation
/// timestamp for latency measurement.
pub struct Image<M: MemoryManager> {
    data: Option<M::Ptr>,
    width: usize,
    height: usize,
    index: u64,
    plane: u32,
    pool: Option<PoolHandle<M>>,
    start: Option<Instant>,
    valid: bool,
}

impl<M: MemoryManager> Image<M> {
    /// The invalid sentinel. Doubles as the end-of-stream pill flowing
    /// through pipeline queues.
    pub fn empty() -> Self {
        Self {
            data: None,
            width: 0,
            height: 0,
            index: 0,
            plane: 0,
            pool: None,
            start: None,
            valid: false,
        }
    }

    /// Allocate a fresh 1-D image of `len` elements from the domain.
    pub fn new(len: usize) -> Result<Self> {
        Self::with_dims(len, 1)
    }

    /// Allocate a fresh `width` x `height` image from the domain.
    pub fn with_dims(width: usize, height: usize) -> Result<Self> {
        let ptr = M::alloc(width * height)?;
        Ok(Self::from_parts(width, height, 0, ptr))
    }

    /// Adopt an existing buffer. The buffer must hold at least
    /// `width * height` elements.
    pub fn from_parts(width: usize, height: usize, index: u64, ptr: M::Ptr) -> Self {
        debug_assert!(ptr.len() >= width * height);
        Self {
            data: Some(ptr),
            width,
            height,
            index,
            plane: 0,
            pool: None,
            start: None,
            valid: true,
        }
    }

    /// Wrap a buffer checked out of a pool lane.
    pub(crate) fn pooled(ptr: M::Ptr, len: usize, handle: PoolHandle<M>) -> Self {
        Self {
            data: Some(ptr),
            width: len,
            height: 1,
            index: 0,
            plane: 0,
            pool: Some(handle),
            start: None,
            valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Element count.
    pub fn size(&self) -> usize {
        self.width * self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Row stride in bytes.
    pub fn pitch(&self) -> usize {
        self.width * std::mem::size_of::<M::Elem>()
    }

    /// Reinterpret the buffer as `width` x `height`. The product must match
    /// the current element count.
    pub fn set_dims(&mut self, width: usize, height: usize) {
        assert_eq!(
            width * height,
            self.size(),
            "reshape must preserve the element count"
        );
        self.width = width;
        self.height = height;
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn set_index(&mut self, index: u64) {
        self.index = index;
    }

    pub fn plane(&self) -> u32 {
        self.plane
    }

    pub fn set_plane(&mut self, plane: u32) {
        self.plane = plane;
    }

    /// Registration id of the pool lane this image was drawn from.
    pub fn pool_id(&self) -> Option<RegistrationId> {
        self.pool.as_ref().map(|h| h.registration())
    }

    /// Stamp the frame's creation time (set by the source stage).
    pub fn mark_start(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn set_start(&mut self, start: Instant) {
        self.start = Some(start);
    }

    pub fn start(&self) -> Option<Instant> {
        self.start
    }

    /// Time since the frame entered the pipeline.
    pub fn latency(&self) -> Option<Duration> {
        self.start.map(|s| s.elapsed())
    }

    /// The underlying buffer, if any.
    pub fn data(&self) -> Option<&M::Ptr> {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> Option<&mut M::Ptr> {
        self.data.as_mut()
    }

    /// Host-visible view of the contents, `None` for device images or
    /// invalid handles.
    pub fn as_slice(&self) -> Option<&[M::Elem]> {
        self.data
            .as_ref()
            .and_then(|p| p.as_slice())
            .map(|s| &s[..self.size()])
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [M::Elem]> {
        let size = self.size();
        self.data
            .as_mut()
            .and_then(|p| p.as_mut_slice())
            .map(|s| &mut s[..size])
    }

    /// Move the contents out, leaving this handle invalid with a null
    /// pointer. The returned image owns the buffer (and the pool ticket,
    /// if any).
    pub fn take(&mut self) -> Image<M> {
        std::mem::replace(self, Image::empty())
    }

    /// Mark the handle invalid so its destructor frees the buffer instead
    /// of recycling it into the pool.
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.pool = None;
    }
}

impl<M: MemoryManager> Drop for Image<M> {
    fn drop(&mut self) {
        if !self.valid {
            return;
        }
        self.valid = false;
        if let (Some(ptr), Some(handle)) = (self.data.take(), self.pool.take()) {
            handle.restock(ptr);
        }
        // Non-pooled buffers are released by their own drop.
    }
}

/// Deep copy: a fresh buffer in the same domain with the contents copied
/// element-wise. Copies are never pooled. This is deliberately expensive
/// and reserved for snapshots; moving is the normal way to pass frames on.
impl<M: MemoryManager> Clone for Image<M> {
    fn clone(&self) -> Self {
        let Some(src) = self.data.as_ref() else {
            return Image::empty();
        };
        let mut ptr = M::alloc(self.size()).expect("allocation for image copy");
        M::copy(&mut ptr, src, self.size()).expect("same-domain image copy");
        Self {
            data: Some(ptr),
            width: self.width,
            height: self.height,
            index: self.index,
            plane: self.plane,
            pool: None,
            start: self.start,
            valid: self.valid,
        }
    }
}

impl<M: MemoryManager> std::fmt::Debug for Image<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("index", &self.index)
            .field("plane", &self.plane)
            .field("valid", &self.valid)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostMemory;
    use crate::pool::MemoryPool;

    type HostImage = Image<HostMemory<u16>>;

    #[test]
    fn fresh_image_is_valid_and_zeroed() {
        let img = HostImage::with_dims(8, 4).unwrap();
        assert!(img.is_valid());
        assert_eq!(img.size(), 32);
        assert_eq!(img.pitch(), 16);
        assert!(img.as_slice().unwrap().iter().all(|&v| v == 0));
    }

    #[test]
    fn take_leaves_invalid_husk_with_null_pointer() {
        let pool = MemoryPool::<HostMemory<u16>>::new();
        let id = pool.register_stage(1, 64).unwrap();

        let mut a = pool.request_memory(id);
        a.set_index(7);
        let b = a.take();

        assert!(!a.is_valid());
        assert!(a.data().is_none());
        assert!(b.is_valid());
        assert_eq!(b.index(), 7);
        assert_eq!(b.pool_id(), Some(id));

        drop(b);
        assert_eq!(pool.free_count(id), 1);
    }

    #[test]
    fn clone_is_deep() {
        let mut src = HostImage::new(16).unwrap();
        src.as_mut_slice().unwrap().fill(3);
        let copy = src.clone();

        src.as_mut_slice().unwrap().fill(9);
        assert!(copy.as_slice().unwrap().iter().all(|&v| v == 3));
        assert!(copy.pool_id().is_none());
    }

    #[test]
    fn invalidate_detaches_from_pool() {
        let pool = MemoryPool::<HostMemory<u16>>::new();
        let id = pool.register_stage(1, 8).unwrap();

        let mut img = pool.request_memory(id);
        img.invalidate();
        drop(img);
        // The buffer was freed, not recycled.
        assert_eq!(pool.free_count(id), 0);
        assert_eq!(pool.checked_out(id), 1);
    }

    #[test]
    fn metadata_round_trip() {
        let mut img = HostImage::new(4).unwrap();
        img.set_index(41);
        img.set_plane(1);
        img.mark_start();
        assert_eq!(img.index(), 41);
        assert_eq!(img.plane(), 1);
        assert!(img.latency().is_some());
    }
}
