//! In-memory segmented binary image.

use std::fs;
use std::path::Path;

use log::debug;

use crate::{Address, DisassemblyError, ImageProvider};

/// Largest offset range a real-mode segment can address.
pub const SEGMENT_SIZE: usize = 0x10000;

/// One contiguous segment of the image.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Offset of the first byte (e.g. 0x100 for a COM image)
    pub base: u16,
    /// Segment contents
    pub data: Vec<u8>,
}

impl Segment {
    /// Exclusive end offset
    pub fn end(&self) -> i32 {
        self.base as i32 + self.data.len() as i32
    }
}

/// A raw image split into numbered segments.
#[derive(Debug, Clone, Default)]
pub struct BinaryImage {
    segments: Vec<Segment>,
}

impl BinaryImage {
    /// Create an empty image
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment and return its index.
    ///
    /// Data that would run past offset 0xFFFF is truncated.
    pub fn add_segment(&mut self, base: u16, mut data: Vec<u8>) -> i32 {
        let room = SEGMENT_SIZE - base as usize;
        data.truncate(room);
        self.segments.push(Segment { base, data });
        (self.segments.len() - 1) as i32
    }

    /// Lay out a flat image: the first segment starts at `base`, the rest
    /// of the data fills further 64 KiB segments starting at offset 0.
    pub fn from_bytes(data: &[u8], base: u16) -> Self {
        let mut image = Self::new();
        let first = data.len().min(SEGMENT_SIZE - base as usize);
        image.add_segment(base, data[..first].to_vec());

        for chunk in data[first..].chunks(SEGMENT_SIZE) {
            image.add_segment(0, chunk.to_vec());
        }
        image
    }

    /// Load a raw image from disk, see [`BinaryImage::from_bytes`].
    pub fn from_file<P: AsRef<Path>>(path: P, base: u16) -> Result<Self, DisassemblyError> {
        let data = fs::read(path.as_ref())?;
        if data.is_empty() {
            return Err(DisassemblyError::Generic(format!(
                "{} is empty",
                path.as_ref().display()
            )));
        }
        let image = Self::from_bytes(&data, base);
        debug!(
            "Loaded {} bytes from {} into {} segment(s)",
            data.len(),
            path.as_ref().display(),
            image.segments.len()
        );
        Ok(image)
    }

    /// All segments in index order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn segment(&self, index: i32) -> Option<&Segment> {
        usize::try_from(index).ok().and_then(|i| self.segments.get(i))
    }
}

impl ImageProvider for BinaryImage {
    fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn segment_bounds(&self, segment: i32) -> Option<(i32, i32)> {
        self.segment(segment).map(|s| (s.base as i32, s.end()))
    }

    fn is_address_valid(&self, address: Address) -> bool {
        self.segment(address.segment)
            .is_some_and(|s| address.offset >= s.base as i32 && address.offset < s.end())
    }

    fn get_bytes(&self, address: Address, count: usize) -> Option<&[u8]> {
        let segment = self.segment(address.segment)?;
        if address.offset < segment.base as i32 {
            return None;
        }
        let start = (address.offset - segment.base as i32) as usize;
        let end = start.checked_add(count)?;
        segment.data.get(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_com_layout() {
        let image = BinaryImage::from_bytes(&[0x90, 0xc3], 0x100);
        assert_eq!(image.segment_count(), 1);
        assert_eq!(image.segment_bounds(0), Some((0x100, 0x102)));
        assert!(image.is_address_valid(Address::new(0, 0x101)));
        assert!(!image.is_address_valid(Address::new(0, 0xff)));
        assert!(!image.is_address_valid(Address::new(0, 0x102)));
        assert!(!image.is_address_valid(Address::new(1, 0)));
        assert!(!image.is_address_valid(Address::INVALID));
    }

    #[test]
    fn test_get_bytes_stays_in_segment() {
        let image = BinaryImage::from_bytes(&[1, 2, 3, 4], 0);
        assert_eq!(image.get_bytes(Address::new(0, 1), 2), Some(&[2u8, 3][..]));
        assert_eq!(image.get_bytes(Address::new(0, 3), 2), None);
        assert_eq!(image.segment_tail(Address::new(0, 2)), Some(&[3u8, 4][..]));
        assert_eq!(image.segment_tail(Address::new(0, 4)), None);
    }

    #[test]
    fn test_large_image_splits_into_segments() {
        let data = vec![0x90; SEGMENT_SIZE + 0x80];
        let image = BinaryImage::from_bytes(&data, 0x100);
        assert_eq!(image.segment_count(), 2);
        assert_eq!(image.segment_bounds(0), Some((0x100, 0x10000)));
        assert_eq!(image.segment_bounds(1), Some((0, 0x180)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xb8, 0x01, 0x00, 0xc3]).unwrap();

        let image = BinaryImage::from_file(file.path(), 0x100).unwrap();
        assert_eq!(image.segments()[0].data.len(), 4);
        assert_eq!(image.get_bytes(Address::new(0, 0x103), 1), Some(&[0xc3u8][..]));
    }

    #[test]
    fn test_from_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(BinaryImage::from_file(file.path(), 0x100).is_err());
    }
}
