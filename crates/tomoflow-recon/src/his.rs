//! Loader for the HIS detector file format.
//!
//! A HIS file starts with a fixed 68-byte header, followed by a variable
//! image-header block and the pixel data. Only single-frame files are
//! supported; every reject returns an invalid [`Image`] so directory scans
//! can skip bad files and keep going.

use std::io::Read;
use std::marker::PhantomData;
use std::path::Path;

use tomoflow_gpu::{DomainBuffer, Image, MemoryManager, Sample};

/// Expected value of `file_type`.
pub const HIS_FILE_ID: u16 = 0x7000;
/// Size of the fixed file header in bytes.
pub const HIS_FILE_HEADER_SIZE: u16 = 68;
/// Trailing padding inside the fixed header.
pub const HIS_REST_SIZE: usize = 34;

/// Fixed file header, fields in wire order (little-endian, packed).
#[derive(Debug, Clone)]
pub struct HisHeader {
    pub file_type: u16,
    pub header_size: u16,
    pub header_version: u16,
    pub file_size: u32,
    pub image_header_size: u16,
    /// Bounding rectangle of the image: upper-left / bottom-right corners.
    pub ulx: u16,
    pub uly: u16,
    pub brx: u16,
    pub bry: u16,
    pub number_of_frames: u16,
    /// 0 = none, 1 = offset, 2 = gain, 4 = bad pixel (or-ed).
    pub correction: u16,
    /// Frame integration time in microseconds.
    pub integration_time: f64,
    pub type_of_numbers: u16,
}

/// Sample width codes carried in `type_of_numbers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HisDatatype {
    U8 = 2,
    U16 = 4,
    U32 = 32,
    F64 = 64,
    F32 = 128,
}

impl HisDatatype {
    fn from_code(code: u16) -> Option<Self> {
        match code {
            2 => Some(Self::U8),
            4 => Some(Self::U16),
            32 => Some(Self::U32),
            64 => Some(Self::F64),
            128 => Some(Self::F32),
            _ => None,
        }
    }

    fn sample_bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
            Self::F64 => 8,
            Self::F32 => 4,
        }
    }
}

fn read_u16(r: &mut impl Read) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

impl HisHeader {
    pub fn read(r: &mut impl Read) -> std::io::Result<Self> {
        let header = Self {
            file_type: read_u16(r)?,
            header_size: read_u16(r)?,
            header_version: read_u16(r)?,
            file_size: read_u32(r)?,
            image_header_size: read_u16(r)?,
            ulx: read_u16(r)?,
            uly: read_u16(r)?,
            brx: read_u16(r)?,
            bry: read_u16(r)?,
            number_of_frames: read_u16(r)?,
            correction: read_u16(r)?,
            integration_time: read_f64(r)?,
            type_of_numbers: read_u16(r)?,
        };
        let mut rest = [0u8; HIS_REST_SIZE];
        r.read_exact(&mut rest)?;
        Ok(header)
    }

    pub fn width(&self) -> usize {
        (self.brx - self.ulx + 1) as usize
    }

    pub fn height(&self) -> usize {
        (self.bry - self.uly + 1) as usize
    }
}

/// Loads HIS files into images of the target domain, converting samples to
/// the domain's element type on read.
pub struct HisLoader<M: MemoryManager> {
    _marker: PhantomData<M>,
}

impl<M: MemoryManager> Default for HisLoader<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemoryManager> HisLoader<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// Load one image, tagging it with `index`. Any reject (unreadable
    /// file, wrong file id, header size mismatch, unsupported datatype,
    /// more than one frame) yields an invalid image.
    pub fn load_image(&self, path: impl AsRef<Path>, index: u64) -> Image<M> {
        let path = path.as_ref();
        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "HIS loader: could not open file");
                return Image::empty();
            }
        };

        let header = match HisHeader::read(&mut file) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "HIS loader: truncated header");
                return Image::empty();
            }
        };

        if header.file_type != HIS_FILE_ID {
            tracing::warn!(path = %path.display(), file_type = header.file_type, "HIS loader: not a HIS file");
            return Image::empty();
        }
        if header.header_size != HIS_FILE_HEADER_SIZE {
            tracing::warn!(path = %path.display(), header_size = header.header_size, "HIS loader: header size mismatch");
            return Image::empty();
        }
        let Some(datatype) = HisDatatype::from_code(header.type_of_numbers) else {
            tracing::warn!(path = %path.display(), code = header.type_of_numbers, "HIS loader: unsupported datatype");
            return Image::empty();
        };
        if header.brx < header.ulx || header.bry < header.uly {
            tracing::warn!(path = %path.display(), "HIS loader: degenerate bounding rectangle");
            return Image::empty();
        }
        if header.number_of_frames != 1 {
            tracing::warn!(
                path = %path.display(),
                frames = header.number_of_frames,
                "HIS loader: multi-frame files are not supported"
            );
            return Image::empty();
        }

        // Skip the image header block.
        let mut image_header = vec![0u8; header.image_header_size as usize];
        if let Err(e) = file.read_exact(&mut image_header) {
            tracing::warn!(path = %path.display(), error = %e, "HIS loader: truncated image header");
            return Image::empty();
        }

        let width = header.width();
        let height = header.height();
        let mut raw = vec![0u8; width * height * datatype.sample_bytes()];
        if let Err(e) = file.read_exact(&mut raw) {
            tracing::warn!(path = %path.display(), error = %e, "HIS loader: truncated pixel data");
            return Image::empty();
        }

        let mut ptr = match M::alloc(width * height) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "HIS loader: allocation failed");
                return Image::empty();
            }
        };
        let Some(dest) = ptr.as_mut_slice() else {
            tracing::warn!(path = %path.display(), "HIS loader: target domain is not host-visible");
            return Image::empty();
        };
        convert_samples::<M::Elem>(datatype, &raw, dest);

        Image::from_parts(width, height, index, ptr)
    }
}

fn convert_samples<T: Sample>(datatype: HisDatatype, raw: &[u8], dest: &mut [T]) {
    match datatype {
        HisDatatype::U8 => {
            for (d, s) in dest.iter_mut().zip(raw.iter()) {
                *d = T::from_f64(*s as f64);
            }
        }
        HisDatatype::U16 => {
            for (d, s) in dest.iter_mut().zip(raw.chunks_exact(2)) {
                *d = T::from_f64(u16::from_le_bytes([s[0], s[1]]) as f64);
            }
        }
        HisDatatype::U32 => {
            for (d, s) in dest.iter_mut().zip(raw.chunks_exact(4)) {
                *d = T::from_f64(u32::from_le_bytes([s[0], s[1], s[2], s[3]]) as f64);
            }
        }
        HisDatatype::F64 => {
            for (d, s) in dest.iter_mut().zip(raw.chunks_exact(8)) {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(s);
                *d = T::from_f64(f64::from_le_bytes(bytes));
            }
        }
        HisDatatype::F32 => {
            for (d, s) in dest.iter_mut().zip(raw.chunks_exact(4)) {
                *d = T::from_f64(f32::from_le_bytes([s[0], s[1], s[2], s[3]]) as f64);
            }
        }
    }
}
