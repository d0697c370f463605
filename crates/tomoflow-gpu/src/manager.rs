use bytemuck::Pod;

use tomoflow_core::Result;

/// Detector sample types the pipeline can carry.
///
/// The `f64` round-trip is the single conversion choke point used by file
/// loaders; it is lossless for every type listed here.
pub trait Sample: Pod + Send + Sync + PartialEq + std::fmt::Debug + 'static {
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

macro_rules! impl_sample {
    ($($t:ty),*) => {
        $(impl Sample for $t {
            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $t
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
        })*
    };
}

impl_sample!(u8, u16, u32, f32, f64);

/// Access surface shared by every domain's buffer handle.
pub trait DomainBuffer<T>: Send + 'static {
    /// Number of elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host-visible view of the contents. `None` for true device memory.
    fn as_slice(&self) -> Option<&[T]>;

    fn as_mut_slice(&mut self) -> Option<&mut [T]>;

    /// Raw device address. `None` for host memory.
    fn device_ptr(&self) -> Option<u64>;
}

/// One memory domain: an element type, an opaque buffer handle, and the
/// allocation/copy primitives.
///
/// Three domains exist (pageable host, page-locked host and device) and
/// all expose this identical capability set, so any component generic over
/// a domain can be instantiated against any of them. `copy` is same-domain
/// only; crossing domains goes through the explicit transfer functions in
/// [`crate::device`].
pub trait MemoryManager: Send + Sync + 'static {
    type Elem: Sample;
    type Ptr: DomainBuffer<Self::Elem>;

    /// Allocate a fresh buffer of `len` elements.
    fn alloc(len: usize) -> Result<Self::Ptr>;

    /// Element-wise copy of `len` elements between buffers of this domain.
    fn copy(dst: &mut Self::Ptr, src: &Self::Ptr, len: usize) -> Result<()>;
}
