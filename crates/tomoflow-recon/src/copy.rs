//! The only stages whose input and output memory domains differ: H2D lifts
//! raw sinograms from pinned host memory onto the device, D2H brings
//! reconstructed slices back. All cross-domain traffic in the pipeline
//! goes through these two stages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tomoflow_core::{ConfigReader, ReconError, Result, Timer};
use tomoflow_gpu::{
    device_to_host, host_to_device, DeviceLane, DeviceMemory, DeviceSet, Image, MemoryPool,
    PinnedMemory,
};
use tomoflow_pipeline::{DeviceFanout, DeviceKernel, FanoutOptions, Stage};

use crate::geometry::ScanGeometry;

/// Pinned host → device transfer of raw sinograms.
pub struct H2DKernel {
    geometry: ScanGeometry,
}

impl H2DKernel {
    pub fn from_config(cfg: &ConfigReader) -> Result<Self> {
        Ok(Self {
            geometry: ScanGeometry::from_config(cfg)?,
        })
    }
}

impl DeviceKernel for H2DKernel {
    type In = PinnedMemory<u16>;
    type Out = DeviceMemory<u16>;

    fn output_len(&self) -> usize {
        self.geometry.sinogram_len()
    }

    fn launch(
        &self,
        lane: &DeviceLane,
        input: &Image<PinnedMemory<u16>>,
        output: &mut Image<DeviceMemory<u16>>,
    ) -> Result<()> {
        let src = input
            .as_slice()
            .ok_or_else(|| ReconError::Device("H2D input must be host-visible".into()))?;
        let dst = output
            .data_mut()
            .ok_or_else(|| ReconError::Device("H2D output buffer missing".into()))?;
        host_to_device(lane, src, dst)
    }
}

pub fn h2d_stage(
    cfg: &ConfigReader,
    devices: &DeviceSet,
    pool: MemoryPool<DeviceMemory<u16>>,
) -> Result<Arc<Stage<DeviceFanout<H2DKernel>>>> {
    let kernel = H2DKernel::from_config(cfg)?;
    let opts = FanoutOptions {
        pool_capacity: kernel.geometry.pool_size,
        ..FanoutOptions::default()
    };
    let fanout = DeviceFanout::new("h2d", kernel, devices, pool, opts)?;
    Ok(Stage::new("h2d", fanout))
}

/// Frames between throughput log lines.
const RATE_LOG_INTERVAL: u64 = 1000;

/// Device → pinned host transfer of reconstructed slices. Also the spot
/// where the end-to-end reconstruction rate is measured, since every
/// finished slice passes through here.
pub struct D2HKernel {
    geometry: ScanGeometry,
    count: AtomicU64,
    timer: Timer,
}

impl D2HKernel {
    pub fn from_config(cfg: &ConfigReader) -> Result<Self> {
        Ok(Self {
            geometry: ScanGeometry::from_config(cfg)?,
            count: AtomicU64::new(0),
            timer: Timer::start(),
        })
    }

    /// Slices transferred so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl DeviceKernel for D2HKernel {
    type In = DeviceMemory<f32>;
    type Out = PinnedMemory<f32>;

    fn output_len(&self) -> usize {
        self.geometry.grid_len()
    }

    fn launch(
        &self,
        lane: &DeviceLane,
        input: &Image<DeviceMemory<f32>>,
        output: &mut Image<PinnedMemory<f32>>,
    ) -> Result<()> {
        let src = input
            .data()
            .ok_or_else(|| ReconError::Device("D2H input buffer missing".into()))?;
        let dst = output
            .as_mut_slice()
            .ok_or_else(|| ReconError::Device("D2H output must be host-visible".into()))?;
        device_to_host(lane, src, dst)?;

        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % RATE_LOG_INTERVAL == 0 {
            let rate = count as f64 / self.timer.elapsed_s();
            tracing::info!(slices = count, rate_hz = rate, "reconstruction rate");
        }
        if let Some(latency) = input.latency() {
            tracing::trace!(
                index = input.index(),
                latency_ms = latency.as_secs_f64() * 1000.0,
                "slice left the device"
            );
        }
        Ok(())
    }
}

pub fn d2h_stage(
    cfg: &ConfigReader,
    devices: &DeviceSet,
    pool: MemoryPool<PinnedMemory<f32>>,
) -> Result<Arc<Stage<DeviceFanout<D2HKernel>>>> {
    let kernel = D2HKernel::from_config(cfg)?;
    let opts = FanoutOptions {
        pool_capacity: kernel.geometry.pool_size,
        ..FanoutOptions::default()
    };
    let fanout = DeviceFanout::new("d2h", kernel, devices, pool, opts)?;
    Ok(Stage::new("d2h", fanout))
}
