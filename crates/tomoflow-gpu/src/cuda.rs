//! CUDA backend, compiled with the `cuda` feature.
//!
//! Uses the raw driver entry points of `cudarc` so buffers can stay
//! type-erased (byte-addressed) the way the pool hands them around; the
//! typed view is reconstructed at the domain boundary. Kernel bodies are
//! not part of this crate; stages supply them through `DeviceKernel`.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{result, sys, CudaDevice};

use tomoflow_core::{ReconError, Result};

use crate::device::DeviceLane;
use crate::manager::{DomainBuffer, Sample};

static DEVICES: OnceLock<Vec<Arc<CudaDevice>>> = OnceLock::new();

fn devices() -> Result<&'static [Arc<CudaDevice>]> {
    if DEVICES.get().is_none() {
        let count = CudaDevice::count()
            .map_err(|e| ReconError::Device(format!("device enumeration failed: {e}")))?
            as usize;
        let mut devs = Vec::with_capacity(count);
        for ordinal in 0..count {
            let dev = CudaDevice::new(ordinal)
                .map_err(|e| ReconError::Device(format!("device {ordinal} init failed: {e}")))?;
            devs.push(dev);
        }
        let _ = DEVICES.set(devs);
    }
    Ok(DEVICES.get().expect("device registry initialised"))
}

pub fn device_count() -> Result<usize> {
    Ok(devices()?.len())
}

/// Make `ordinal`'s primary context current on the calling thread.
pub fn bind_device(ordinal: usize) {
    if let Ok(devs) = devices() {
        if let Some(dev) = devs.get(ordinal) {
            dev.bind_to_thread().ok();
        }
    }
}

fn ensure_context() -> Result<()> {
    let devs = devices()?;
    let dev = devs
        .first()
        .ok_or_else(|| ReconError::Device("no CUDA devices found".into()))?;
    dev.bind_to_thread()
        .map_err(|e| ReconError::Device(format!("context bind failed: {e}")))
}

/// Raw device allocation.
pub struct DeviceBuffer<T> {
    ptr: sys::CUdeviceptr,
    len: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for DeviceBuffer<T> {}
unsafe impl<T: Sync> Sync for DeviceBuffer<T> {}

impl<T: Sample> DeviceBuffer<T> {
    pub fn alloc(len: usize) -> Result<Self> {
        ensure_context()?;
        let bytes = len * std::mem::size_of::<T>();
        let ptr = unsafe { result::malloc_sync(bytes) }
            .map_err(|e| ReconError::Device(format!("device alloc of {bytes} bytes failed: {e}")))?;
        unsafe { result::memset_d8_sync(ptr, 0, bytes) }
            .map_err(|e| ReconError::Device(format!("device memset failed: {e}")))?;
        Ok(Self {
            ptr,
            len,
            _marker: PhantomData,
        })
    }
}

impl<T> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        unsafe {
            result::free_sync(self.ptr).ok();
        }
    }
}

impl<T: Sample> DomainBuffer<T> for DeviceBuffer<T> {
    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> Option<&[T]> {
        None
    }

    fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        None
    }

    fn device_ptr(&self) -> Option<u64> {
        Some(self.ptr as u64)
    }
}

/// Page-locked host allocation.
pub struct PinnedBuffer<T> {
    ptr: *mut T,
    len: usize,
}

unsafe impl<T: Send> Send for PinnedBuffer<T> {}
unsafe impl<T: Sync> Sync for PinnedBuffer<T> {}

impl<T: Sample> PinnedBuffer<T> {
    pub fn alloc(len: usize) -> Result<Self> {
        ensure_context()?;
        let bytes = len * std::mem::size_of::<T>();
        let ptr = unsafe { result::malloc_host(bytes, sys::CU_MEMHOSTALLOC_PORTABLE) }
            .map_err(|e| ReconError::Device(format!("pinned alloc of {bytes} bytes failed: {e}")))?
            as *mut T;
        unsafe { std::ptr::write_bytes(ptr, 0, len) };
        Ok(Self { ptr, len })
    }
}

impl<T> Drop for PinnedBuffer<T> {
    fn drop(&mut self) {
        unsafe {
            result::free_host(self.ptr as *mut std::ffi::c_void).ok();
        }
    }
}

impl<T: Sample> DomainBuffer<T> for PinnedBuffer<T> {
    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> Option<&[T]> {
        Some(unsafe { std::slice::from_raw_parts(self.ptr, self.len) })
    }

    fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) })
    }

    fn device_ptr(&self) -> Option<u64> {
        None
    }
}

/// One CUDA stream, owned by the stage-device lane that created it.
#[derive(Debug)]
pub struct DeviceStream {
    raw: sys::CUstream,
    ordinal: usize,
}

unsafe impl Send for DeviceStream {}
unsafe impl Sync for DeviceStream {}

impl DeviceStream {
    pub(crate) fn create(ordinal: usize) -> Result<Self> {
        bind_device(ordinal);
        let raw = result::stream::create(result::stream::StreamKind::NonBlocking)
            .map_err(|e| ReconError::Device(format!("stream creation failed: {e}")))?;
        Ok(Self { raw, ordinal })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn raw(&self) -> sys::CUstream {
        self.raw
    }

    pub fn synchronize(&self) -> Result<()> {
        unsafe { result::stream::synchronize(self.raw) }
            .map_err(|e| ReconError::Device(format!("stream synchronize failed: {e}")))
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        unsafe {
            result::stream::destroy(self.raw).ok();
        }
    }
}

pub(crate) fn htod_copy<T: Sample>(
    lane: &DeviceLane,
    src: &[T],
    dst: &mut DeviceBuffer<T>,
) -> Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(src);
    unsafe {
        result::memcpy_htod_async(dst.ptr, bytes, lane.stream().raw())
            .map_err(|e| ReconError::Device(format!("H2D transfer failed: {e}")))
    }
}

pub(crate) fn dtoh_copy<T: Sample>(
    lane: &DeviceLane,
    src: &DeviceBuffer<T>,
    dst: &mut [T],
) -> Result<()> {
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
    unsafe {
        result::memcpy_dtoh_async(bytes, src.ptr, lane.stream().raw())
            .map_err(|e| ReconError::Device(format!("D2H transfer failed: {e}")))
    }
}

pub(crate) fn dtod_copy<T: Sample>(
    dst: &mut DeviceBuffer<T>,
    src: &DeviceBuffer<T>,
    len: usize,
) -> Result<()> {
    if len > src.len || len > dst.len {
        return Err(ReconError::InvalidInput(format!(
            "copy of {len} elements exceeds buffer sizes ({} -> {})",
            src.len, dst.len
        )));
    }
    let bytes = len * std::mem::size_of::<T>();
    unsafe {
        result::memcpy_dtod_sync(dst.ptr, src.ptr, bytes)
            .map_err(|e| ReconError::Device(format!("D2D copy failed: {e}")))
    }
}
