use std::sync::Arc;

use tomoflow_core::{ConfigReader, ReconError, Result};
use tomoflow_gpu::{DeviceLane, DeviceMemory, DeviceSet, Image, MemoryPool};
use tomoflow_pipeline::{DeviceFanout, DeviceKernel, FanoutOptions, Stage};

use crate::geometry::ScanGeometry;

/// Multiplies the reconstructed slice with a precomputed circular mask:
/// pixels outside the scan field of view are set to `maskingValue`.
pub struct MaskingKernel {
    geometry: ScanGeometry,
    /// true = inside the field of view.
    mask: Vec<bool>,
    masking_value: f32,
}

impl MaskingKernel {
    pub fn from_config(cfg: &ConfigReader) -> Result<Self> {
        let geometry = ScanGeometry::from_config(cfg)?;
        let masking_value: f32 = cfg.lookup_or("maskingValue", 0.0)?;

        let center = geometry.pixels as f32 / 2.0;
        let radius = center;
        let mut mask = vec![false; geometry.grid_len()];
        for y in 0..geometry.pixels {
            for x in 0..geometry.pixels {
                let dx = x as f32 + 0.5 - center;
                let dy = y as f32 + 0.5 - center;
                mask[y * geometry.pixels + x] = dx * dx + dy * dy <= radius * radius;
            }
        }
        Ok(Self {
            geometry,
            mask,
            masking_value,
        })
    }
}

impl DeviceKernel for MaskingKernel {
    type In = DeviceMemory<f32>;
    type Out = DeviceMemory<f32>;

    fn output_len(&self) -> usize {
        self.geometry.grid_len()
    }

    fn launch(
        &self,
        _lane: &DeviceLane,
        input: &Image<DeviceMemory<f32>>,
        output: &mut Image<DeviceMemory<f32>>,
    ) -> Result<()> {
        let src = input
            .as_slice()
            .ok_or_else(|| ReconError::Device("masking kernel needs a host-visible buffer".into()))?;
        let dst = output
            .as_mut_slice()
            .ok_or_else(|| ReconError::Device("masking kernel needs a host-visible buffer".into()))?;

        for ((d, &s), &inside) in dst.iter_mut().zip(src.iter()).zip(self.mask.iter()) {
            *d = if inside { s } else { self.masking_value };
        }
        Ok(())
    }
}

pub fn masking_stage(
    cfg: &ConfigReader,
    devices: &DeviceSet,
    pool: MemoryPool<DeviceMemory<f32>>,
) -> Result<Arc<Stage<DeviceFanout<MaskingKernel>>>> {
    let kernel = MaskingKernel::from_config(cfg)?;
    let opts = FanoutOptions {
        pool_capacity: kernel.geometry.pool_size,
        ..FanoutOptions::default()
    };
    let fanout = DeviceFanout::new("masking", kernel, devices, pool, opts)?;
    Ok(Stage::new("masking", fanout))
}
