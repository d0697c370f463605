use tomoflow_core::Result;

use crate::image::Image;
use crate::manager::{DomainBuffer, MemoryManager};

/// Three-dimensional analogue of [`Image`]: `width` x `height` x `depth`
/// elements in one memory domain.
pub struct Volume<M: MemoryManager> {
    data: Option<M::Ptr>,
    width: usize,
    height: usize,
    depth: usize,
    valid: bool,
}

impl<M: MemoryManager> Volume<M> {
    pub fn empty() -> Self {
        Self {
            data: None,
            width: 0,
            height: 0,
            depth: 0,
            valid: false,
        }
    }

    pub fn new(width: usize, height: usize, depth: usize) -> Result<Self> {
        let ptr = M::alloc(width * height * depth)?;
        Ok(Self {
            data: Some(ptr),
            width,
            height,
            depth,
            valid: true,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn size(&self) -> usize {
        self.width * self.height * self.depth
    }

    pub fn pitch(&self) -> usize {
        self.width * std::mem::size_of::<M::Elem>()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn data(&self) -> Option<&M::Ptr> {
        self.data.as_ref()
    }

    pub fn as_slice(&self) -> Option<&[M::Elem]> {
        self.data
            .as_ref()
            .and_then(|p| p.as_slice())
            .map(|s| &s[..self.size()])
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [M::Elem]> {
        let size = self.size();
        self.data
            .as_mut()
            .and_then(|p| p.as_mut_slice())
            .map(|s| &mut s[..size])
    }

    /// An independent copy of axial slice `i`, as an image carrying `i`
    /// as its index. Mutating the returned image never touches the volume.
    ///
    /// # Panics
    ///
    /// Out-of-range indices are a fatal condition, as is slicing a domain
    /// that is not host-visible.
    pub fn slice(&self, i: usize) -> Image<M> {
        assert!(
            i < self.depth,
            "volume slice index {i} out of range (depth {})",
            self.depth
        );
        let plane = self.width * self.height;
        let src = self
            .as_slice()
            .expect("volume slicing requires a host-visible domain");

        let mut ptr = M::alloc(plane).expect("allocation for volume slice");
        let view = ptr
            .as_mut_slice()
            .expect("volume slicing requires a host-visible domain");
        view.copy_from_slice(&src[i * plane..(i + 1) * plane]);

        Image::from_parts(self.width, self.height, i as u64, ptr)
    }
}

impl<M: MemoryManager> Clone for Volume<M> {
    fn clone(&self) -> Self {
        let Some(src) = self.data.as_ref() else {
            return Volume::empty();
        };
        let mut ptr = M::alloc(self.size()).expect("allocation for volume copy");
        M::copy(&mut ptr, src, self.size()).expect("same-domain volume copy");
        Self {
            data: Some(ptr),
            width: self.width,
            height: self.height,
            depth: self.depth,
            valid: self.valid,
        }
    }
}

impl<M: MemoryManager> std::fmt::Debug for Volume<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("depth", &self.depth)
            .field("valid", &self.valid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostMemory;

    #[test]
    fn slice_is_an_independent_copy() {
        let mut vol = Volume::<HostMemory<f32>>::new(4, 3, 5).unwrap();
        {
            let data = vol.as_mut_slice().unwrap();
            for k in 0..5 {
                for j in 0..3 {
                    for i in 0..4 {
                        data[k * 12 + j * 4 + i] = (k * 100 + j * 10 + i) as f32;
                    }
                }
            }
        }

        let mut img = vol.slice(2);
        assert_eq!(img.width(), 4);
        assert_eq!(img.height(), 3);
        assert_eq!(img.index(), 2);
        for j in 0..3 {
            for i in 0..4 {
                assert_eq!(img.as_slice().unwrap()[j * 4 + i], (200 + 10 * j + i) as f32);
            }
        }

        // Mutating the slice must not alter the volume.
        img.as_mut_slice().unwrap().fill(-1.0);
        assert_eq!(vol.as_slice().unwrap()[2 * 12], 200.0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_slice_panics() {
        let vol = Volume::<HostMemory<f32>>::new(2, 2, 2).unwrap();
        let _ = vol.slice(2);
    }
}
