//! Device memory domain, device enumeration and per-device streams.
//!
//! Two backends share this interface. With the `cuda` feature the real
//! driver is used via `cudarc`; the default build emulates the device
//! domain in host memory with no-op streams, so the whole pipeline runs
//! and tests on machines without a GPU. Emulated device buffers are
//! host-visible, which is what lets the reference kernels execute.

use std::marker::PhantomData;

use tomoflow_core::{ReconError, Result};

use crate::manager::{DomainBuffer, MemoryManager, Sample};

#[cfg(feature = "cuda")]
pub use crate::cuda::{DeviceBuffer, DeviceStream};

/// Emulated device buffer: host memory standing in for device memory.
#[cfg(not(feature = "cuda"))]
pub struct DeviceBuffer<T> {
    data: Box<[T]>,
}

#[cfg(not(feature = "cuda"))]
impl<T: Sample> DeviceBuffer<T> {
    pub fn alloc(len: usize) -> Result<Self> {
        Ok(Self {
            data: vec![bytemuck::Zeroable::zeroed(); len].into_boxed_slice(),
        })
    }
}

#[cfg(not(feature = "cuda"))]
impl<T: Sample> DomainBuffer<T> for DeviceBuffer<T> {
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
        Some(self.data.as_ptr() as u64)
    }
}

/// Emulated device stream: submission order is trivially preserved because
/// the "kernels" run synchronously on the worker thread.
#[cfg(not(feature = "cuda"))]
#[derive(Debug)]
pub struct DeviceStream {
    ordinal: usize,
}

#[cfg(not(feature = "cuda"))]
impl DeviceStream {
    pub(crate) fn create(ordinal: usize) -> Result<Self> {
        Ok(Self { ordinal })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

/// Device memory domain.
pub struct DeviceMemory<T>(PhantomData<T>);

impl<T: Sample> MemoryManager for DeviceMemory<T> {
    type Elem = T;
    type Ptr = DeviceBuffer<T>;

    fn alloc(len: usize) -> Result<Self::Ptr> {
        DeviceBuffer::alloc(len)
    }

    #[cfg(not(feature = "cuda"))]
    fn copy(dst: &mut Self::Ptr, src: &Self::Ptr, len: usize) -> Result<()> {
        if len > src.len() || len > dst.len() {
            return Err(ReconError::InvalidInput(format!(
                "copy of {len} elements exceeds buffer sizes ({} -> {})",
                src.len(),
                dst.len()
            )));
        }
        let src = src.as_slice().expect("emulated device buffer is host-visible");
        let dst = dst
            .as_mut_slice()
            .expect("emulated device buffer is host-visible");
        dst[..len].copy_from_slice(&src[..len]);
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn copy(dst: &mut Self::Ptr, src: &Self::Ptr, len: usize) -> Result<()> {
        crate::cuda::dtod_copy(dst, src, len)
    }
}

/// The set of accelerator devices this process schedules onto.
#[derive(Debug, Clone)]
pub struct DeviceSet {
    count: usize,
}

impl DeviceSet {
    /// Enumerate the devices available to this process. The emulated
    /// backend reports a single device unless `TOMOFLOW_EMULATED_DEVICES`
    /// overrides it.
    pub fn detect() -> Result<Self> {
        #[cfg(feature = "cuda")]
        {
            let count = crate::cuda::device_count()?;
            if count == 0 {
                return Err(ReconError::Device("no CUDA devices found".into()));
            }
            tracing::info!(devices = count, "detected CUDA devices");
            Ok(Self { count })
        }
        #[cfg(not(feature = "cuda"))]
        {
            let count = std::env::var("TOMOFLOW_EMULATED_DEVICES")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(1);
            tracing::info!(devices = count, "using emulated device backend");
            Ok(Self { count })
        }
    }

    /// A fixed-size device set, used by tests and config overrides.
    pub fn with_count(count: usize) -> Self {
        assert!(count > 0, "a device set needs at least one device");
        Self { count }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Create the per-device lane (stream + ordinal) a stage worker runs on.
    pub fn lane(&self, ordinal: usize) -> Result<DeviceLane> {
        if ordinal >= self.count {
            return Err(ReconError::Device(format!(
                "device ordinal {ordinal} out of range (0..{})",
                self.count
            )));
        }
        Ok(DeviceLane {
            ordinal,
            stream: DeviceStream::create(ordinal)?,
        })
    }
}

/// One device's execution context: the ordinal plus the stage-private
/// stream all of this stage's work on that device is serialised onto.
#[derive(Debug)]
pub struct DeviceLane {
    ordinal: usize,
    stream: DeviceStream,
}

impl DeviceLane {
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn stream(&self) -> &DeviceStream {
        &self.stream
    }

    /// Pin the calling worker thread to this lane's device.
    pub fn bind(&self) {
        #[cfg(feature = "cuda")]
        crate::cuda::bind_device(self.ordinal);
    }

    /// Wait until all work submitted to this lane's stream has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()
    }
}

/// Copy `src` into the device buffer `dst` on `lane`'s stream.
pub fn host_to_device<T: Sample>(
    lane: &DeviceLane,
    src: &[T],
    dst: &mut DeviceBuffer<T>,
) -> Result<()> {
    if src.len() > dst.len() {
        return Err(ReconError::InvalidInput(format!(
            "transfer of {} elements into a {}-element device buffer",
            src.len(),
            dst.len()
        )));
    }
    #[cfg(feature = "cuda")]
    {
        crate::cuda::htod_copy(lane, src, dst)
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = lane;
        let view = dst
            .as_mut_slice()
            .expect("emulated device buffer is host-visible");
        view[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// Copy the device buffer `src` into `dst` on `lane`'s stream.
pub fn device_to_host<T: Sample>(
    lane: &DeviceLane,
    src: &DeviceBuffer<T>,
    dst: &mut [T],
) -> Result<()> {
    if dst.len() > src.len() {
        return Err(ReconError::InvalidInput(format!(
            "transfer of {} elements out of a {}-element device buffer",
            dst.len(),
            src.len()
        )));
    }
    #[cfg(feature = "cuda")]
    {
        crate::cuda::dtoh_copy(lane, src, dst)
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = lane;
        let view = src.as_slice().expect("emulated device buffer is host-visible");
        dst.copy_from_slice(&view[..dst.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_set_lane_bounds() {
        let set = DeviceSet::with_count(2);
        assert_eq!(set.count(), 2);
        assert!(set.lane(0).is_ok());
        assert!(set.lane(1).is_ok());
        assert!(set.lane(2).is_err());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn transfers_round_trip() {
        let set = DeviceSet::with_count(1);
        let lane = set.lane(0).unwrap();

        let src: Vec<u16> = (0..32).collect();
        let mut dev = DeviceBuffer::<u16>::alloc(32).unwrap();
        host_to_device(&lane, &src, &mut dev).unwrap();
        lane.synchronize().unwrap();

        let mut back = vec![0u16; 32];
        device_to_host(&lane, &dev, &mut back).unwrap();
        lane.synchronize().unwrap();
        assert_eq!(src, back);
    }
}
