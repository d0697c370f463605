use std::marker::PhantomData;

use bytemuck::Zeroable;

use tomoflow_core::{ReconError, Result};

use crate::manager::{DomainBuffer, MemoryManager, Sample};

/// Pageable host buffer.
pub struct HostBuffer<T> {
    data: Box<[T]>,
}

impl<T: Sample> HostBuffer<T> {
    pub fn alloc(len: usize) -> Self {
        Self {
            data: vec![T::zeroed(); len].into_boxed_slice(),
        }
    }
}

impl<T: Sample> DomainBuffer<T> for HostBuffer<T> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn as_slice(&self) -> Option<&[T]> {
        Some(&self.data)
    }

    fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        Some(&mut self.data)
    }

    fn device_ptr(&self) -> Option<u64> {
        None
    }
}

fn copy_host<T: Sample, B: DomainBuffer<T>>(dst: &mut B, src: &B, len: usize) -> Result<()> {
    if len > src.len() || len > dst.len() {
        return Err(ReconError::InvalidInput(format!(
            "copy of {len} elements exceeds buffer sizes ({} -> {})",
            src.len(),
            dst.len()
        )));
    }
    let src = src.as_slice().expect("host buffer is host-visible");
    let dst = dst.as_mut_slice().expect("host buffer is host-visible");
    dst[..len].copy_from_slice(&src[..len]);
    Ok(())
}

/// Pageable host memory domain.
pub struct HostMemory<T>(PhantomData<T>);

impl<T: Sample> MemoryManager for HostMemory<T> {
    type Elem = T;
    type Ptr = HostBuffer<T>;

    fn alloc(len: usize) -> Result<Self::Ptr> {
        Ok(HostBuffer::alloc(len))
    }

    fn copy(dst: &mut Self::Ptr, src: &Self::Ptr, len: usize) -> Result<()> {
        copy_host(dst, src, len)
    }
}

#[cfg(feature = "cuda")]
pub use crate::cuda::PinnedBuffer;

/// Page-locked host buffer. Without the `cuda` feature this is ordinary
/// host memory; the domain still exists so code written against it keeps
/// the same shape on both builds.
#[cfg(not(feature = "cuda"))]
pub struct PinnedBuffer<T> {
    data: Box<[T]>,
}

#[cfg(not(feature = "cuda"))]
impl<T: Sample> PinnedBuffer<T> {
    pub fn alloc(len: usize) -> Result<Self> {
        Ok(Self {
            data: vec![T::zeroed(); len].into_boxed_slice(),
        })
    }
}

#[cfg(not(feature = "cuda"))]
impl<T: Sample> DomainBuffer<T> for PinnedBuffer<T> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn as_slice(&self) -> Option<&[T]> {
        Some(&self.data)
    }

    fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        Some(&mut self.data)
    }

    fn device_ptr(&self) -> Option<u64> {
        None
    }
}

/// Page-locked host memory domain. Page-locking is what allows the copy
/// stages to issue asynchronous transfers on a device stream.
pub struct PinnedMemory<T>(PhantomData<T>);

impl<T: Sample> MemoryManager for PinnedMemory<T> {
    type Elem = T;
    type Ptr = PinnedBuffer<T>;

    fn alloc(len: usize) -> Result<Self::Ptr> {
        PinnedBuffer::alloc(len)
    }

    fn copy(dst: &mut Self::Ptr, src: &Self::Ptr, len: usize) -> Result<()> {
        copy_host(dst, src, len)
    }
}
