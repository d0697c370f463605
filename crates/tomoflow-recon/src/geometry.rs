use tomoflow_core::{ConfigReader, ReconError, Result};

/// Scan geometry shared by every stage, read once from the config file.
#[derive(Debug, Clone, Copy)]
pub struct ScanGeometry {
    /// Detector channels in the fan beam sinogram.
    pub detectors: usize,
    /// Detector modules streaming into the receiver.
    pub modules: usize,
    /// Angular samples per sinogram.
    pub projections: usize,
    /// Reconstruction grid edge length in pixels.
    pub pixels: usize,
    /// Sinogram slots per receiver ring buffer.
    pub buffer_size: usize,
    /// Buffers reserved per pool lane.
    pub pool_size: usize,
}

impl ScanGeometry {
    pub fn from_config(cfg: &ConfigReader) -> Result<Self> {
        let sampling_rate: u64 = cfg.lookup("samplingRate")?;
        let scan_rate: u64 = cfg.lookup("scanRate")?;
        if scan_rate == 0 {
            return Err(ReconError::Config("scanRate must be non-zero".into()));
        }
        // samplingRate is in samples/s, scanRate in microseconds per scan.
        let computed = (sampling_rate * 1_000_000 / scan_rate) as usize;
        let projections = cfg.lookup_or("numberOfFanProjections", computed)?;

        let geometry = Self {
            detectors: cfg.lookup("numberOfFanDetectors")?,
            modules: cfg.lookup("numberOfDetectorModules")?,
            projections,
            pixels: cfg.lookup("numberOfPixels")?,
            buffer_size: cfg.lookup("inputBufferSize")?,
            pool_size: cfg.lookup_or("memPoolSize", 16)?,
        };

        if geometry.modules == 0 || geometry.detectors % geometry.modules != 0 {
            return Err(ReconError::Config(format!(
                "numberOfFanDetectors ({}) must be a positive multiple of numberOfDetectorModules ({})",
                geometry.detectors, geometry.modules
            )));
        }
        Ok(geometry)
    }

    pub fn detectors_per_module(&self) -> usize {
        self.detectors / self.modules
    }

    /// Elements in one full sinogram.
    pub fn sinogram_len(&self) -> usize {
        self.detectors * self.projections
    }

    /// Elements in one reconstructed slice.
    pub fn grid_len(&self) -> usize {
        self.pixels * self.pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "samplingRate": 1,
        "scanRate": 2000,
        "numberOfFanDetectors": 64,
        "numberOfDetectorModules": 4,
        "numberOfPixels": 32,
        "inputBufferSize": 8,
        "memPoolSize": 6
    }"#;

    #[test]
    fn projections_derived_from_rates() {
        let cfg = ConfigReader::from_json_str(SAMPLE).unwrap();
        let geo = ScanGeometry::from_config(&cfg).unwrap();
        assert_eq!(geo.projections, 500);
        assert_eq!(geo.detectors_per_module(), 16);
        assert_eq!(geo.sinogram_len(), 64 * 500);
        assert_eq!(geo.grid_len(), 1024);
        assert_eq!(geo.pool_size, 6);
    }

    #[test]
    fn explicit_projection_count_wins() {
        let cfg = ConfigReader::from_json_str(
            r#"{
                "samplingRate": 1,
                "scanRate": 2000,
                "numberOfFanProjections": 128,
                "numberOfFanDetectors": 16,
                "numberOfDetectorModules": 2,
                "numberOfPixels": 8,
                "inputBufferSize": 4
            }"#,
        )
        .unwrap();
        let geo = ScanGeometry::from_config(&cfg).unwrap();
        assert_eq!(geo.projections, 128);
        assert_eq!(geo.pool_size, 16);
    }

    #[test]
    fn module_mismatch_rejected() {
        let cfg = ConfigReader::from_json_str(
            r#"{
                "samplingRate": 1,
                "scanRate": 2000,
                "numberOfFanDetectors": 65,
                "numberOfDetectorModules": 4,
                "numberOfPixels": 8,
                "inputBufferSize": 4
            }"#,
        )
        .unwrap();
        assert!(ScanGeometry::from_config(&cfg).is_err());
    }
}
