use std::collections::BTreeSet;
use std::sync::Arc;

use tomoflow_core::{ConfigReader, ReconError, Result};
use tomoflow_gpu::{DeviceLane, DeviceMemory, DeviceSet, Image, MemoryPool};
use tomoflow_pipeline::{DeviceFanout, DeviceKernel, FanoutOptions, Stage};

use crate::geometry::ScanGeometry;

/// Replaces defect detector channels with values interpolated from their
/// nearest healthy neighbours.
///
/// A channel counts as defect if it is listed in the config
/// (`defectDetectors`) or if its mean over the sinogram falls outside
/// `[threshMin, threshMax]`.
pub struct InterpolationKernel {
    geometry: ScanGeometry,
    defects: BTreeSet<usize>,
    thresh_min: f64,
    thresh_max: f64,
}

impl InterpolationKernel {
    pub fn from_config(cfg: &ConfigReader) -> Result<Self> {
        let geometry = ScanGeometry::from_config(cfg)?;
        let listed: Vec<usize> = cfg.lookup_or("defectDetectors", Vec::new())?;
        for &d in &listed {
            if d >= geometry.detectors {
                return Err(ReconError::Config(format!(
                    "defect detector {d} out of range (0..{})",
                    geometry.detectors
                )));
            }
        }
        Ok(Self {
            geometry,
            defects: listed.into_iter().collect(),
            thresh_min: cfg.lookup_or("threshMin", 0.0)?,
            thresh_max: cfg.lookup_or("threshMax", f64::from(u16::MAX))?,
        })
    }

    /// Configured plus threshold-detected defect channels for one sinogram.
    fn find_defects(&self, data: &[u16]) -> BTreeSet<usize> {
        let geo = &self.geometry;
        let mut defects = self.defects.clone();
        for channel in 0..geo.detectors {
            let sum: u64 = (0..geo.projections)
                .map(|p| data[p * geo.detectors + channel] as u64)
                .sum();
            let mean = sum as f64 / geo.projections as f64;
            if mean < self.thresh_min || mean > self.thresh_max {
                defects.insert(channel);
            }
        }
        defects
    }
}

impl DeviceKernel for InterpolationKernel {
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
        let src = input
            .as_slice()
            .ok_or_else(|| ReconError::Device("interpolation kernel needs a host-visible buffer".into()))?;
        let defects = self.find_defects(src);
        let dst = output
            .as_mut_slice()
            .ok_or_else(|| ReconError::Device("interpolation kernel needs a host-visible buffer".into()))?;

        dst[..src.len()].copy_from_slice(src);
        if defects.is_empty() {
            return Ok(());
        }

        for projection in 0..geo.projections {
            let row = projection * geo.detectors;
            for &channel in &defects {
                let left = (0..channel)
                    .rev()
                    .find(|c| !defects.contains(c))
                    .map(|c| src[row + c]);
                let right = ((channel + 1)..geo.detectors)
                    .find(|c| !defects.contains(c))
                    .map(|c| src[row + c]);

                dst[row + channel] = match (left, right) {
                    (Some(l), Some(r)) => ((l as u32 + r as u32) / 2) as u16,
                    (Some(l), None) => l,
                    (None, Some(r)) => r,
                    (None, None) => 0,
                };
            }
        }
        Ok(())
    }
}

pub fn interpolation_stage(
    cfg: &ConfigReader,
    devices: &DeviceSet,
    pool: MemoryPool<DeviceMemory<u16>>,
) -> Result<Arc<Stage<DeviceFanout<InterpolationKernel>>>> {
    let kernel = InterpolationKernel::from_config(cfg)?;
    let opts = FanoutOptions {
        pool_capacity: kernel.geometry.pool_size,
        ..FanoutOptions::default()
    };
    let fanout = DeviceFanout::new("interpolation", kernel, devices, pool, opts)?;
    Ok(Stage::new("interpolation", fanout))
}
