//! Relative virtual addresses
//!
//! An RVA names a byte in the pool file independently of where its segment
//! happens to be mapped: `(segment_index << segment_shift) | offset`. RVAs are
//! what callers persist; transient pointers are only good while referenced.

use crate::error::{PoolError, Result};
use crate::header::Geometry;
use std::fmt;

/// Stable 32-bit address of a byte in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rva(u32);

impl Rva {
    pub const fn new(raw: u32) -> Self {
        Rva(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// RVA of `offset` within segment `segment_index`
    pub fn encode(geometry: &Geometry, segment_index: u32, offset: usize) -> Rva {
        debug_assert!(offset < geometry.segment_size);
        debug_assert!(u64::from(segment_index) < geometry.max_segments());
        Rva((segment_index << geometry.segment_shift) | offset as u32)
    }

    /// Split into `(segment_index, offset)`
    ///
    /// Fails for segments the pool does not have.
    pub fn decode(self, geometry: &Geometry, segment_count: u32) -> Result<(u32, usize)> {
        let segment_index = self.0 >> geometry.segment_shift;
        if segment_index >= segment_count {
            return Err(PoolError::InvalidRva(self.0));
        }
        let offset = (self.0 as usize) & (geometry.segment_size - 1);
        Ok((segment_index, offset))
    }
}

impl From<u32> for Rva {
    fn from(raw: u32) -> Self {
        Rva(raw)
    }
}

impl From<Rva> for u32 {
    fn from(rva: Rva) -> Self {
        rva.0
    }
}

impl fmt::Display for Rva {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let geo = Geometry::new(16);
        assert_eq!(Rva::encode(&geo, 0, 0x108).get(), 0x108);
        assert_eq!(Rva::encode(&geo, 3, 0x48).get(), 0x0003_0048);

        let geo = Geometry::new(18);
        assert_eq!(Rva::encode(&geo, 1, 0).get(), 0x0004_0000);
    }

    #[test]
    fn test_decode_splits_segment_and_offset() {
        let geo = Geometry::new(16);
        let rva = Rva::new(0x0002_1234);
        assert_eq!(rva.decode(&geo, 3).unwrap(), (2, 0x1234));
    }

    #[test]
    fn test_decode_rejects_missing_segment() {
        let geo = Geometry::new(16);
        let rva = Rva::new(0x0005_0010);
        assert!(matches!(
            rva.decode(&geo, 5),
            Err(PoolError::InvalidRva(0x0005_0010))
        ));
        assert!(rva.decode(&geo, 6).is_ok());
    }

    #[test]
    fn test_highest_segment_round_trips() {
        let geo = Geometry::new(28);
        let last = (geo.max_segments() - 1) as u32;
        let rva = Rva::encode(&geo, last, geo.segment_size - 1);
        assert_eq!(rva.get(), u32::MAX);
        assert_eq!(rva.decode(&geo, last + 1).unwrap(), (last, geo.segment_size - 1));
    }

    #[test]
    fn test_display() {
        assert_eq!(Rva::new(0x48).to_string(), "0x00000048");
    }
}
