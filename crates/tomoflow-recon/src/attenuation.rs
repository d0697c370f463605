use std::sync::Arc;

use tomoflow_core::{ConfigReader, ReconError, Result};
use tomoflow_gpu::{DeviceLane, DeviceMemory, DeviceSet, Image, MemoryPool};
use tomoflow_pipeline::{DeviceFanout, DeviceKernel, FanoutOptions, Stage};

use crate::geometry::ScanGeometry;

/// Converts raw intensity sinograms into attenuation line integrals:
/// `a = -ln(I / I0)` with the reference intensity `I0` from the config
/// (`referenceIntensity`, defaulting to the full u16 range).
pub struct AttenuationKernel {
    geometry: ScanGeometry,
    reference: f32,
}

impl AttenuationKernel {
    pub fn from_config(cfg: &ConfigReader) -> Result<Self> {
        let reference: f32 = cfg.lookup_or("referenceIntensity", f32::from(u16::MAX))?;
        if !(reference.is_finite() && reference > 0.0) {
            return Err(ReconError::Config(
                "referenceIntensity must be a positive finite number".into(),
            ));
        }
        Ok(Self {
            geometry: ScanGeometry::from_config(cfg)?,
            reference,
        })
    }
}

impl DeviceKernel for AttenuationKernel {
    type In = DeviceMemory<u16>;
    type Out = DeviceMemory<f32>;

    fn output_len(&self) -> usize {
        self.geometry.sinogram_len()
    }

    fn launch(
        &self,
        _lane: &DeviceLane,
        input: &Image<DeviceMemory<u16>>,
        output: &mut Image<DeviceMemory<f32>>,
    ) -> Result<()> {
        let src = input
            .as_slice()
            .ok_or_else(|| ReconError::Device("attenuation kernel needs a host-visible buffer".into()))?;
        let dst = output
            .as_mut_slice()
            .ok_or_else(|| ReconError::Device("attenuation kernel needs a host-visible buffer".into()))?;

        for (d, &s) in dst.iter_mut().zip(src.iter()) {
            let intensity = f32::from(s.max(1));
            *d = -(intensity / self.reference).ln();
        }
        Ok(())
    }
}

pub fn attenuation_stage(
    cfg: &ConfigReader,
    devices: &DeviceSet,
    pool: MemoryPool<DeviceMemory<f32>>,
) -> Result<Arc<Stage<DeviceFanout<AttenuationKernel>>>> {
    let kernel = AttenuationKernel::from_config(cfg)?;
    let opts = FanoutOptions {
        pool_capacity: kernel.geometry.pool_size,
        ..FanoutOptions::default()
    };
    let fanout = DeviceFanout::new("attenuation", kernel, devices, pool, opts)?;
    Ok(Stage::new("attenuation", fanout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_intensity_maps_to_zero_attenuation() {
        let cfg = ConfigReader::from_json_str(
            r#"{
                "samplingRate": 1,
                "scanRate": 500000,
                "numberOfFanDetectors": 4,
                "numberOfDetectorModules": 1,
                "numberOfPixels": 4,
                "inputBufferSize": 2
            }"#,
        )
        .unwrap();
        let kernel = AttenuationKernel::from_config(&cfg).unwrap();

        let mut input = Image::<DeviceMemory<u16>>::new(kernel.output_len()).unwrap();
        input.as_mut_slice().unwrap().fill(u16::MAX);

        let devices = DeviceSet::with_count(1);
        let lane = devices.lane(0).unwrap();
        let mut output = Image::<DeviceMemory<f32>>::new(kernel.output_len()).unwrap();
        kernel.launch(&lane, &input, &mut output).unwrap();

        for &v in output.as_slice().unwrap() {
            assert!(v.abs() < 1e-6);
        }
    }

    #[test]
    fn absorbed_beam_has_positive_attenuation() {
        let cfg = ConfigReader::from_json_str(
            r#"{
                "samplingRate": 1,
                "scanRate": 500000,
                "numberOfFanDetectors": 4,
                "numberOfDetectorModules": 1,
                "numberOfPixels": 4,
                "inputBufferSize": 2,
                "referenceIntensity": 1000.0
            }"#,
        )
        .unwrap();
        let kernel = AttenuationKernel::from_config(&cfg).unwrap();

        let mut input = Image::<DeviceMemory<u16>>::new(kernel.output_len()).unwrap();
        input.as_mut_slice().unwrap().fill(100);

        let devices = DeviceSet::with_count(1);
        let lane = devices.lane(0).unwrap();
        let mut output = Image::<DeviceMemory<f32>>::new(kernel.output_len()).unwrap();
        kernel.launch(&lane, &input, &mut output).unwrap();

        for &v in output.as_slice().unwrap() {
            assert!((v - (10.0f32).ln()).abs() < 1e-5);
        }
    }
}
