//! Offline replacements for the online receiver and a raw-file sink, used
//! for reprocessing recorded scans from disk.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use tomoflow_core::{fs, ReconError, Result};
use tomoflow_gpu::{Image, PinnedMemory};
use tomoflow_pipeline::{FrameSink, FrameSource};

use crate::his::HisLoader;

/// Streams a directory of HIS files into the pipeline, one frame per file,
/// in lexicographic order with monotonically increasing indices. Invalid
/// files are skipped with a warning.
pub struct OfflineLoader {
    loader: HisLoader<PinnedMemory<u16>>,
    pending: Mutex<VecDeque<PathBuf>>,
    next_index: Mutex<u64>,
}

impl OfflineLoader {
    pub fn new(input_dir: impl AsRef<Path>) -> Result<Self> {
        let paths = fs::read_directory(&input_dir)?;
        if paths.is_empty() {
            return Err(ReconError::InvalidInput(format!(
                "{} contains no files",
                input_dir.as_ref().display()
            )));
        }
        tracing::info!(
            dir = %input_dir.as_ref().display(),
            files = paths.len(),
            "offline loader scanning directory"
        );
        Ok(Self {
            loader: HisLoader::new(),
            pending: Mutex::new(paths.into()),
            next_index: Mutex::new(0),
        })
    }
}

impl FrameSource for OfflineLoader {
    type Output = Image<PinnedMemory<u16>>;

    fn load(&self) -> Image<PinnedMemory<u16>> {
        loop {
            let Some(path) = self.pending.lock().pop_front() else {
                return Image::empty();
            };
            let index = {
                let guard = self.next_index.lock();
                *guard
            };
            let mut img = self.loader.load_image(&path, index);
            if !img.is_valid() {
                tracing::warn!(path = %path.display(), "skipping invalid file");
                continue;
            }
            *self.next_index.lock() += 1;
            img.set_plane((index % 2) as u32);
            img.mark_start();
            return img;
        }
    }
}

/// Writes each reconstructed slice as raw little-endian f32 into the
/// target directory. The directory is created at construction.
pub struct OfflineSaver {
    output_dir: PathBuf,
    prefix: String,
}

impl OfflineSaver {
    pub fn new(output_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_directory(&output_dir)?;
        Ok(Self {
            output_dir,
            prefix: prefix.into(),
        })
    }

    fn save(&self, img: &Image<PinnedMemory<f32>>) -> Result<()> {
        let path = self.output_dir.join(format!(
            "{}_{:06}_p{}.raw",
            self.prefix,
            img.index(),
            img.plane()
        ));
        let data = img
            .as_slice()
            .ok_or_else(|| ReconError::InvalidInput("cannot save an empty image".into()))?;
        let mut file = std::fs::File::create(&path)?;
        file.write_all(bytemuck::cast_slice(data))?;
        tracing::debug!(path = %path.display(), "saved slice");
        Ok(())
    }
}

impl FrameSink for OfflineSaver {
    type Input = Image<PinnedMemory<f32>>;

    fn consume(&self, item: Image<PinnedMemory<f32>>) {
        if let Err(e) = self.save(&item) {
            tracing::error!(index = item.index(), error = %e, "failed to save slice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saver_writes_raw_slices() {
        let dir = tempfile::tempdir().unwrap();
        let saver = OfflineSaver::new(dir.path().join("reco"), "IMG").unwrap();

        let mut img = Image::<PinnedMemory<f32>>::new(4).unwrap();
        img.as_mut_slice().unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        img.set_index(7);
        img.set_plane(1);
        saver.consume(img);

        let written = std::fs::read(dir.path().join("reco/IMG_000007_p1.raw")).unwrap();
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(&written);
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn loader_requires_a_non_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OfflineLoader::new(dir.path()).is_err());
    }
}
