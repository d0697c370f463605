use std::sync::Arc;

use tomoflow_core::{ConfigReader, ReconError, Result};
use tomoflow_gpu::{DeviceLane, DeviceMemory, DeviceSet, Image, MemoryPool};
use tomoflow_pipeline::{DeviceFanout, DeviceKernel, FanoutOptions, Stage};

use crate::geometry::ScanGeometry;

/// Rearranges raw sinograms from the receiver's module-major layout
/// (`[module][projection][channel]`) into the projection-major layout
/// (`[projection][detector]`) the downstream stages expect.
pub struct ReorderingKernel {
    geometry: ScanGeometry,
}

impl ReorderingKernel {
    pub fn from_config(cfg: &ConfigReader) -> Result<Self> {
        Ok(Self {
            geometry: ScanGeometry::from_config(cfg)?,
        })
    }
}

impl DeviceKernel for ReorderingKernel {
    type In = DeviceMemory<u16>;
    type Out = DeviceMemory<u16>;

    fn output_len(&self) -> usize {
        self.geometry.sinogram_len()
    }

    fn launch(
        &self,
        _lane: &DeviceLane,
        input: &Image<DeviceMemory<u16>>,
        output: &mut Image<DeviceMemory<u16>>,
    ) -> Result<()> {
        let geo = &self.geometry;
        let dpm = geo.detectors_per_module();
        let slice_len = geo.projections * dpm;

        let src = input
            .as_slice()
            .ok_or_else(|| ReconError::Device("reordering kernel needs a host-visible buffer".into()))?;
        let dst = output
            .as_mut_slice()
            .ok_or_else(|| ReconError::Device("reordering kernel needs a host-visible buffer".into()))?;

        for module in 0..geo.modules {
            for projection in 0..geo.projections {
                let src_base = module * slice_len + projection * dpm;
                let dst_base = projection * geo.detectors + module * dpm;
                dst[dst_base..dst_base + dpm].copy_from_slice(&src[src_base..src_base + dpm]);
            }
        }
        Ok(())
    }
}

pub fn reordering_stage(
    cfg: &ConfigReader,
    devices: &DeviceSet,
    pool: MemoryPool<DeviceMemory<u16>>,
) -> Result<Arc<Stage<DeviceFanout<ReorderingKernel>>>> {
    let kernel = ReorderingKernel::from_config(cfg)?;
    let opts = FanoutOptions {
        pool_capacity: kernel.geometry.pool_size,
        ..FanoutOptions::default()
    };
    let fanout = DeviceFanout::new("reordering", kernel, devices, pool, opts)?;
    Ok(Stage::new("reordering", fanout))
}
