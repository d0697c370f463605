use std::sync::Arc;

use tomoflow_core::{ConfigReader, ReconError, Result};
use tomoflow_gpu::{DeviceLane, DeviceMemory, DeviceSet, Image, MemoryPool};
use tomoflow_pipeline::{DeviceFanout, DeviceKernel, FanoutOptions, Stage};

use crate::geometry::ScanGeometry;

/// Unfiltered back-projection of an attenuation sinogram onto the
/// reconstruction grid: every pixel accumulates the nearest detector
/// sample of each projection along its ray. This is the reference form of
/// the stage contract; an optimised kernel replaces `launch` on real
/// hardware.
pub struct BackprojectionKernel {
    geometry: ScanGeometry,
    /// Per-projection (cos, sin) of the projection angle.
    angles: Vec<(f32, f32)>,
}

impl BackprojectionKernel {
    pub fn from_config(cfg: &ConfigReader) -> Result<Self> {
        let geometry = ScanGeometry::from_config(cfg)?;
        let angles = (0..geometry.projections)
            .map(|p| {
                let theta = std::f32::consts::PI * p as f32 / geometry.projections as f32;
                (theta.cos(), theta.sin())
            })
            .collect();
        Ok(Self { geometry, angles })
    }
}

impl DeviceKernel for BackprojectionKernel {
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
        let geo = &self.geometry;
        let src = input
            .as_slice()
            .ok_or_else(|| ReconError::Device("back-projection kernel needs a host-visible buffer".into()))?;
        let dst = output
            .as_mut_slice()
            .ok_or_else(|| ReconError::Device("back-projection kernel needs a host-visible buffer".into()))?;

        let center = geo.pixels as f32 / 2.0;
        let scale = geo.detectors as f32 / geo.pixels as f32;
        let norm = 1.0 / geo.projections as f32;

        for y in 0..geo.pixels {
            for x in 0..geo.pixels {
                let dx = x as f32 + 0.5 - center;
                let dy = y as f32 + 0.5 - center;
                let mut acc = 0.0f32;
                for (p, &(cos_t, sin_t)) in self.angles.iter().enumerate() {
                    let t = dx * cos_t + dy * sin_t;
                    let channel = (t * scale + geo.detectors as f32 / 2.0) as isize;
                    if (0..geo.detectors as isize).contains(&channel) {
                        acc += src[p * geo.detectors + channel as usize];
                    }
                }
                dst[y * geo.pixels + x] = acc * norm;
            }
        }
        Ok(())
    }
}

pub fn backprojection_stage(
    cfg: &ConfigReader,
    devices: &DeviceSet,
    pool: MemoryPool<DeviceMemory<f32>>,
) -> Result<Arc<Stage<DeviceFanout<BackprojectionKernel>>>> {
    let kernel = BackprojectionKernel::from_config(cfg)?;
    let opts = FanoutOptions {
        pool_capacity: kernel.geometry.pool_size,
        ..FanoutOptions::default()
    };
    let fanout = DeviceFanout::new("backprojection", kernel, devices, pool, opts)?;
    Ok(Stage::new("backprojection", fanout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_sinogram_projects_uniform_grid() {
        let cfg = ConfigReader::from_json_str(
            r#"{
                "samplingRate": 1,
                "scanRate": 125000,
                "numberOfFanDetectors": 16,
                "numberOfDetectorModules": 1,
                "numberOfPixels": 8,
                "inputBufferSize": 2
            }"#,
        )
        .unwrap();
        let kernel = BackprojectionKernel::from_config(&cfg).unwrap();
        assert_eq!(kernel.geometry.projections, 8);

        let mut input =
            Image::<DeviceMemory<f32>>::new(kernel.geometry.sinogram_len()).unwrap();
        input.as_mut_slice().unwrap().fill(2.0);

        let devices = DeviceSet::with_count(1);
        let lane = devices.lane(0).unwrap();
        let mut output = Image::<DeviceMemory<f32>>::new(kernel.output_len()).unwrap();
        kernel.launch(&lane, &input, &mut output).unwrap();

        let out = output.as_slice().unwrap();
        // Central pixels see every projection, so their accumulated mean
        // equals the sinogram value; rays through the corners may leave the
        // detector range, which only ever lowers the mean.
        let pixels = kernel.geometry.pixels;
        for y in [pixels / 2 - 1, pixels / 2] {
            for x in [pixels / 2 - 1, pixels / 2] {
                assert!((out[y * pixels + x] - 2.0).abs() < 1e-5);
            }
        }
        for &v in out {
            assert!((0.0..=2.0 + 1e-5).contains(&v));
        }
    }
}
