//! HIS loader tests: synthetic files for every supported datatype, plus
//! the reject paths.

use std::path::PathBuf;

use tomoflow_gpu::HostMemory;
use tomoflow_recon::his::{HIS_FILE_HEADER_SIZE, HIS_FILE_ID, HIS_REST_SIZE};
use tomoflow_recon::HisLoader;

const WIDTH: u16 = 4;
const HEIGHT: u16 = 3;

struct HisFile {
    file_type: u16,
    header_size: u16,
    number_of_frames: u16,
    type_of_numbers: u16,
    image_header: Vec<u8>,
    pixels: Vec<u8>,
}

impl HisFile {
    fn new(type_of_numbers: u16, pixels: Vec<u8>) -> Self {
        Self {
            file_type: HIS_FILE_ID,
            header_size: HIS_FILE_HEADER_SIZE,
            number_of_frames: 1,
            type_of_numbers,
            image_header: vec![0xAB; 32],
            pixels,
        }
    }

    fn write(&self, dir: &std::path::Path, name: &str) -> PathBuf {
        let mut data = Vec::new();
        data.extend_from_slice(&self.file_type.to_le_bytes());
        data.extend_from_slice(&self.header_size.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes()); // header_version
        data.extend_from_slice(&0u32.to_le_bytes()); // file_size
        data.extend_from_slice(&(self.image_header.len() as u16).to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes()); // ulx
        data.extend_from_slice(&0u16.to_le_bytes()); // uly
        data.extend_from_slice(&(WIDTH - 1).to_le_bytes()); // brx
        data.extend_from_slice(&(HEIGHT - 1).to_le_bytes()); // bry
        data.extend_from_slice(&self.number_of_frames.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes()); // correction
        data.extend_from_slice(&1000.0f64.to_le_bytes()); // integration_time
        data.extend_from_slice(&self.type_of_numbers.to_le_bytes());
        data.extend_from_slice(&[0u8; HIS_REST_SIZE]);
        assert_eq!(data.len(), HIS_FILE_HEADER_SIZE as usize);

        data.extend_from_slice(&self.image_header);
        data.extend_from_slice(&self.pixels);

        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }
}

fn sample_values() -> Vec<f64> {
    (0..WIDTH as usize * HEIGHT as usize)
        .map(|i| (i * 3 + 1) as f64)
        .collect()
}

#[test]
fn loads_u8_samples() {
    let dir = tempfile::tempdir().unwrap();
    let pixels: Vec<u8> = sample_values().iter().map(|&v| v as u8).collect();
    let path = HisFile::new(2, pixels).write(dir.path(), "u8.his");

    let loader = HisLoader::<HostMemory<f32>>::new();
    let img = loader.load_image(&path, 5);
    assert!(img.is_valid());
    assert_eq!(img.width(), WIDTH as usize);
    assert_eq!(img.height(), HEIGHT as usize);
    assert_eq!(img.index(), 5);
    for (got, want) in img.as_slice().unwrap().iter().zip(sample_values()) {
        assert_eq!(*got, want as f32);
    }
}

#[test]
fn loads_u16_samples() {
    let dir = tempfile::tempdir().unwrap();
    let pixels: Vec<u8> = sample_values()
        .iter()
        .flat_map(|&v| (v as u16).to_le_bytes())
        .collect();
    let path = HisFile::new(4, pixels).write(dir.path(), "u16.his");

    let loader = HisLoader::<HostMemory<u16>>::new();
    let img = loader.load_image(&path, 0);
    assert!(img.is_valid());
    for (got, want) in img.as_slice().unwrap().iter().zip(sample_values()) {
        assert_eq!(*got, want as u16);
    }
}

#[test]
fn loads_u32_samples() {
    let dir = tempfile::tempdir().unwrap();
    let pixels: Vec<u8> = sample_values()
        .iter()
        .flat_map(|&v| (v as u32).to_le_bytes())
        .collect();
    let path = HisFile::new(32, pixels).write(dir.path(), "u32.his");

    let loader = HisLoader::<HostMemory<u32>>::new();
    let img = loader.load_image(&path, 0);
    assert!(img.is_valid());
    for (got, want) in img.as_slice().unwrap().iter().zip(sample_values()) {
        assert_eq!(*got, want as u32);
    }
}

#[test]
fn loads_f64_samples() {
    let dir = tempfile::tempdir().unwrap();
    let pixels: Vec<u8> = sample_values()
        .iter()
        .flat_map(|&v| v.to_le_bytes())
        .collect();
    let path = HisFile::new(64, pixels).write(dir.path(), "f64.his");

    let loader = HisLoader::<HostMemory<f64>>::new();
    let img = loader.load_image(&path, 0);
    assert!(img.is_valid());
    for (got, want) in img.as_slice().unwrap().iter().zip(sample_values()) {
        assert_eq!(*got, want);
    }
}

#[test]
fn loads_f32_samples_with_conversion_to_u16() {
    let dir = tempfile::tempdir().unwrap();
    let pixels: Vec<u8> = sample_values()
        .iter()
        .flat_map(|&v| (v as f32).to_le_bytes())
        .collect();
    let path = HisFile::new(128, pixels).write(dir.path(), "f32.his");

    let loader = HisLoader::<HostMemory<u16>>::new();
    let img = loader.load_image(&path, 0);
    assert!(img.is_valid());
    for (got, want) in img.as_slice().unwrap().iter().zip(sample_values()) {
        assert_eq!(*got, want as u16);
    }
}

#[test]
fn rejects_wrong_file_id() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = HisFile::new(4, vec![0; WIDTH as usize * HEIGHT as usize * 2]);
    file.file_type = 0x1234;
    let path = file.write(dir.path(), "bad_id.his");

    let loader = HisLoader::<HostMemory<u16>>::new();
    assert!(!loader.load_image(&path, 0).is_valid());
}

#[test]
fn rejects_header_size_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = HisFile::new(4, vec![0; WIDTH as usize * HEIGHT as usize * 2]);
    file.header_size = 64;
    let path = file.write(dir.path(), "bad_header.his");

    let loader = HisLoader::<HostMemory<u16>>::new();
    assert!(!loader.load_image(&path, 0).is_valid());
}

#[test]
fn rejects_unsupported_datatype() {
    let dir = tempfile::tempdir().unwrap();
    let file = HisFile::new(7, vec![0; WIDTH as usize * HEIGHT as usize * 2]);
    let path = file.write(dir.path(), "bad_dtype.his");

    let loader = HisLoader::<HostMemory<u16>>::new();
    assert!(!loader.load_image(&path, 0).is_valid());
}

#[test]
fn rejects_multi_frame_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = HisFile::new(4, vec![0; WIDTH as usize * HEIGHT as usize * 2]);
    file.number_of_frames = 2;
    let path = file.write(dir.path(), "multi.his");

    let loader = HisLoader::<HostMemory<u16>>::new();
    assert!(!loader.load_image(&path, 0).is_valid());
}

#[test]
fn rejects_missing_file() {
    let loader = HisLoader::<HostMemory<u16>>::new();
    assert!(!loader.load_image("/nonexistent/file.his", 0).is_valid());
}

#[test]
fn rejects_truncated_pixel_data() {
    let dir = tempfile::tempdir().unwrap();
    let file = HisFile::new(4, vec![0; 4]); // far too short
    let path = file.write(dir.path(), "truncated.his");

    let loader = HisLoader::<HostMemory<u16>>::new();
    assert!(!loader.load_image(&path, 0).is_valid());
}
