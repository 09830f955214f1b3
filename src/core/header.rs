//! Binary layout of a pool file
//!
//! Every structure is read and written field by field at fixed little-endian
//! offsets; nothing in this module reinterprets mapped memory as a Rust struct.
//!
//! ```text
//! Segment 0:
//!   [Block Header][File Header][Block Header][Segment Header][Block Header][User Data]...
//! Segment N (N>0):
//!   [Block Header][Segment Header][Block Header][User Data]...
//! ```

use crate::allocator::bitmap::Bitmap;
use crate::error::{PoolError, Result};

/// File magic: "SGPL"
pub const MAGIC: u32 = u32::from_le_bytes(*b"SGPL");

/// log2 of the number of blocks in a segment
pub const BLOCK_COUNT_SHIFT: u32 = 10;

/// Blocks per segment
pub const BLOCK_COUNT: u32 = 1 << BLOCK_COUNT_SHIFT;

/// Number of free-list buckets kept in the file header
pub const FREE_LIST_COUNT: usize = 8;

/// Sentinel for "no segment" in free-list links and heads
pub const NO_SEGMENT: u32 = u32::MAX;

/// Files shorter than this are treated as new pools
pub const HEADER_MAP_SIZE: usize = 4096;

pub const MIN_SEGMENT_SHIFT: u32 = 16;
pub const MAX_SEGMENT_SHIFT: u32 = 28;

pub const BLOCK_HEADER_SIZE: usize = 8;
pub const FILE_HEADER_SIZE: usize = 56;
pub const BITMAP_SIZE: usize = (BLOCK_COUNT / 8) as usize;
pub const SEGMENT_HEADER_SIZE: usize = BITMAP_SIZE + 12;

// File header field offsets, relative to the start of the file header body.
const FH_MAGIC: usize = 0;
const FH_SEGMENT_SHIFT: usize = 4;
const FH_SEGMENT_COUNT: usize = 8;
const FH_FREE_LISTS: usize = 12;
const FH_RESERVED: usize = 44;
const FH_USER_CONTEXT: usize = 48;

// Segment header field offsets, relative to the start of the segment header body.
const SH_FREE_BLOCKS: usize = BITMAP_SIZE;
const SH_FREE_FLINK: usize = BITMAP_SIZE + 4;
const SH_FREE_BLINK: usize = BITMAP_SIZE + 8;

/// Byte offset of the file header body inside segment 0
pub const FILE_HEADER_OFFSET: usize = BLOCK_HEADER_SIZE;

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Header placed in front of every allocation
///
/// The file header and segment headers are allocations too, so they carry
/// one as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Number of blocks covered by the allocation, header included
    pub span: u32,
    pub flags: u32,
}

impl BlockHeader {
    pub fn new(span: u32) -> Self {
        BlockHeader { span, flags: 0 }
    }

    /// Read the block header starting at `offset` within a segment
    pub fn read(segment: &[u8], offset: usize) -> Self {
        BlockHeader {
            span: read_u32(segment, offset),
            flags: read_u32(segment, offset + 4),
        }
    }

    pub fn write(&self, segment: &mut [u8], offset: usize) {
        write_u32(segment, offset, self.span);
        write_u32(segment, offset + 4, self.flags);
    }
}

/// Pool file header, stored in segment 0 right after its block header
///
/// Only `segment_count`, `free_lists` and `user_context` change after
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub segment_shift: u32,
    pub segment_count: u32,
    /// Head segment of each free-list bucket, or [`NO_SEGMENT`]
    pub free_lists: [u32; FREE_LIST_COUNT],
    pub user_context: u64,
}

impl FileHeader {
    /// Header for a freshly created pool with a single segment
    pub fn new(segment_shift: u32) -> Self {
        FileHeader {
            magic: MAGIC,
            segment_shift,
            segment_count: 1,
            free_lists: [NO_SEGMENT; FREE_LIST_COUNT],
            user_context: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        write_u32(&mut buf, FH_MAGIC, self.magic);
        write_u32(&mut buf, FH_SEGMENT_SHIFT, self.segment_shift);
        write_u32(&mut buf, FH_SEGMENT_COUNT, self.segment_count);
        for (i, head) in self.free_lists.iter().enumerate() {
            write_u32(&mut buf, FH_FREE_LISTS + i * 4, *head);
        }
        write_u32(&mut buf, FH_RESERVED, 0);
        write_u64(&mut buf, FH_USER_CONTEXT, self.user_context);
        buf
    }

    /// Decode a file header body (without its block header)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(PoolError::BadFileType(format!(
                "file header needs {} bytes, got {}",
                FILE_HEADER_SIZE,
                bytes.len()
            )));
        }

        let mut free_lists = [NO_SEGMENT; FREE_LIST_COUNT];
        for (i, head) in free_lists.iter_mut().enumerate() {
            *head = read_u32(bytes, FH_FREE_LISTS + i * 4);
        }

        Ok(FileHeader {
            magic: read_u32(bytes, FH_MAGIC),
            segment_shift: read_u32(bytes, FH_SEGMENT_SHIFT),
            segment_count: read_u32(bytes, FH_SEGMENT_COUNT),
            free_lists,
            user_context: read_u64(bytes, FH_USER_CONTEXT),
        })
    }

    /// Check magic and geometry before anything else is derived from the header
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(PoolError::BadFileType(format!(
                "bad magic {:#010x}",
                self.magic
            )));
        }

        if !(MIN_SEGMENT_SHIFT..=MAX_SEGMENT_SHIFT).contains(&self.segment_shift) {
            return Err(PoolError::Corrupt(format!(
                "segment shift {} outside [{}, {}]",
                self.segment_shift, MIN_SEGMENT_SHIFT, MAX_SEGMENT_SHIFT
            )));
        }

        let max_segments = Geometry::new(self.segment_shift).max_segments();
        if self.segment_count == 0 || u64::from(self.segment_count) > max_segments {
            return Err(PoolError::Corrupt(format!(
                "segment count {} outside [1, {}]",
                self.segment_count, max_segments
            )));
        }

        for head in self.free_lists {
            if head != NO_SEGMENT && head >= self.segment_count {
                return Err(PoolError::Corrupt(format!(
                    "free list head {} beyond segment count {}",
                    head, self.segment_count
                )));
            }
        }

        Ok(())
    }

    pub fn segment_count(segment0: &[u8]) -> u32 {
        read_u32(segment0, FILE_HEADER_OFFSET + FH_SEGMENT_COUNT)
    }

    pub fn set_segment_count(segment0: &mut [u8], count: u32) {
        write_u32(segment0, FILE_HEADER_OFFSET + FH_SEGMENT_COUNT, count);
    }

    pub fn free_list_head(segment0: &[u8], bucket: usize) -> u32 {
        read_u32(segment0, FILE_HEADER_OFFSET + FH_FREE_LISTS + bucket * 4)
    }

    pub fn set_free_list_head(segment0: &mut [u8], bucket: usize, segment_index: u32) {
        write_u32(
            segment0,
            FILE_HEADER_OFFSET + FH_FREE_LISTS + bucket * 4,
            segment_index,
        );
    }

    pub fn user_context(segment0: &[u8]) -> u64 {
        read_u64(segment0, FILE_HEADER_OFFSET + FH_USER_CONTEXT)
    }

    pub fn set_user_context(segment0: &mut [u8], context: u64) {
        write_u64(segment0, FILE_HEADER_OFFSET + FH_USER_CONTEXT, context);
    }
}

/// Accessor over the segment header bytes of one segment
///
/// `B` is `&[u8]` for reads and `&mut [u8]` for updates.
pub struct SegmentHeader<B> {
    bytes: B,
}

impl<'a> SegmentHeader<&'a [u8]> {
    /// Segment header of `segment_index`, given the whole mapped segment
    pub fn at(segment: &'a [u8], geometry: &Geometry, segment_index: u32) -> Self {
        let start = geometry.segment_header_offset(segment_index);
        SegmentHeader {
            bytes: &segment[start..start + SEGMENT_HEADER_SIZE],
        }
    }
}

impl<'a> SegmentHeader<&'a mut [u8]> {
    pub fn at_mut(segment: &'a mut [u8], geometry: &Geometry, segment_index: u32) -> Self {
        let start = geometry.segment_header_offset(segment_index);
        SegmentHeader {
            bytes: &mut segment[start..start + SEGMENT_HEADER_SIZE],
        }
    }
}

impl<B: AsRef<[u8]>> SegmentHeader<B> {
    pub fn free_blocks(&self) -> u32 {
        read_u32(self.bytes.as_ref(), SH_FREE_BLOCKS)
    }

    pub fn free_flink(&self) -> u32 {
        read_u32(self.bytes.as_ref(), SH_FREE_FLINK)
    }

    pub fn free_blink(&self) -> u32 {
        read_u32(self.bytes.as_ref(), SH_FREE_BLINK)
    }

    pub fn bitmap(&self) -> Bitmap<&[u8]> {
        Bitmap::new(&self.bytes.as_ref()[..BITMAP_SIZE])
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SegmentHeader<B> {
    pub fn set_free_blocks(&mut self, value: u32) {
        write_u32(self.bytes.as_mut(), SH_FREE_BLOCKS, value);
    }

    pub fn set_free_flink(&mut self, value: u32) {
        write_u32(self.bytes.as_mut(), SH_FREE_FLINK, value);
    }

    pub fn set_free_blink(&mut self, value: u32) {
        write_u32(self.bytes.as_mut(), SH_FREE_BLINK, value);
    }

    pub fn bitmap_mut(&mut self) -> Bitmap<&mut [u8]> {
        Bitmap::new(&mut self.bytes.as_mut()[..BITMAP_SIZE])
    }
}

/// Sizes derived from the segment shift
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub segment_shift: u32,
    pub segment_size: usize,
    pub block_shift: u32,
    pub block_size: usize,
    /// Blocks taken by the file header allocation in segment 0
    pub file_header_span: u32,
    /// Blocks taken by the segment header allocation in every segment
    pub segment_header_span: u32,
}

impl Geometry {
    pub fn new(segment_shift: u32) -> Self {
        let block_shift = segment_shift - BLOCK_COUNT_SHIFT;
        let block_size = 1usize << block_shift;
        let span = |body: usize| ((BLOCK_HEADER_SIZE + body + block_size - 1) >> block_shift) as u32;

        Geometry {
            segment_shift,
            segment_size: 1usize << segment_shift,
            block_shift,
            block_size,
            file_header_span: span(FILE_HEADER_SIZE),
            segment_header_span: span(SEGMENT_HEADER_SIZE),
        }
    }

    /// Largest span a single allocation may have
    pub fn max_allocation_blocks(&self) -> u32 {
        BLOCK_COUNT - self.segment_header_span
    }

    /// Largest payload a single allocation may have
    pub fn max_allocation_size(&self) -> usize {
        ((self.max_allocation_blocks() as usize) << self.block_shift) - BLOCK_HEADER_SIZE
    }

    /// Blocks needed for a payload of `size` bytes, or `None` if it can never fit
    pub fn blocks_for(&self, size: usize) -> Option<u32> {
        let bytes = (BLOCK_HEADER_SIZE as u64)
            .checked_add(size as u64)?
            .checked_add(self.block_size as u64 - 1)?;
        let blocks = bytes >> self.block_shift;
        if blocks > u64::from(self.max_allocation_blocks()) {
            None
        } else {
            Some(blocks as u32)
        }
    }

    /// Payload bytes available in an allocation of `span` blocks
    pub fn payload_len(&self, span: u32) -> usize {
        ((span as usize) << self.block_shift) - BLOCK_HEADER_SIZE
    }

    /// Block holding the segment header's block header
    pub fn segment_header_block(&self, segment_index: u32) -> u32 {
        if segment_index == 0 {
            self.file_header_span
        } else {
            0
        }
    }

    /// Byte offset of the segment header body within its segment
    pub fn segment_header_offset(&self, segment_index: u32) -> usize {
        self.block_offset(self.segment_header_block(segment_index)) + BLOCK_HEADER_SIZE
    }

    /// First block that can hold user data; also the bitmap search hint
    pub fn first_data_block(&self, segment_index: u32) -> u32 {
        self.segment_header_block(segment_index) + self.segment_header_span
    }

    pub fn block_offset(&self, block: u32) -> usize {
        (block as usize) << self.block_shift
    }

    /// Segments addressable by a 32-bit RVA
    pub fn max_segments(&self) -> u64 {
        1u64 << (32 - self.segment_shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_smallest_segments() {
        let geo = Geometry::new(16);
        assert_eq!(geo.segment_size, 64 * 1024);
        assert_eq!(geo.block_size, 64);
        assert_eq!(geo.file_header_span, 1);
        assert_eq!(geo.segment_header_span, 3);
        assert_eq!(geo.first_data_block(0), 4);
        assert_eq!(geo.first_data_block(1), 3);
        assert_eq!(geo.segment_header_offset(0), 64 + BLOCK_HEADER_SIZE);
        assert_eq!(geo.segment_header_offset(7), BLOCK_HEADER_SIZE);
    }

    #[test]
    fn test_geometry_default_segments() {
        let geo = Geometry::new(18);
        assert_eq!(geo.block_size, 256);
        assert_eq!(geo.file_header_span, 1);
        assert_eq!(geo.segment_header_span, 1);
        assert_eq!(geo.max_segments(), 1 << 14);
    }

    #[test]
    fn test_blocks_for() {
        let geo = Geometry::new(16);
        assert_eq!(geo.blocks_for(0), Some(1));
        assert_eq!(geo.blocks_for(56), Some(1));
        assert_eq!(geo.blocks_for(57), Some(2));
        assert_eq!(geo.blocks_for(100), Some(2));
        assert_eq!(
            geo.blocks_for(geo.max_allocation_size()),
            Some(geo.max_allocation_blocks())
        );
        assert_eq!(geo.blocks_for(geo.max_allocation_size() + 1), None);
        assert_eq!(geo.blocks_for(usize::MAX), None);
    }

    #[test]
    fn test_file_header_serialization() {
        let mut header = FileHeader::new(20);
        header.segment_count = 9;
        header.free_lists[3] = 4;
        header.user_context = 0xDEAD_BEEF_0000_0001;

        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"SGPL");
        assert_eq!(&bytes[44..48], &[0, 0, 0, 0]);

        let decoded = FileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_invalid_magic() {
        let mut header = FileHeader::new(18);
        header.magic = 0x1234_5678;
        assert!(matches!(header.validate(), Err(PoolError::BadFileType(_))));
    }

    #[test]
    fn test_invalid_shift_and_count() {
        let mut header = FileHeader::new(30);
        assert!(matches!(header.validate(), Err(PoolError::Corrupt(_))));

        header.segment_shift = 16;
        header.segment_count = 0;
        assert!(matches!(header.validate(), Err(PoolError::Corrupt(_))));

        header.segment_count = 2;
        header.free_lists[0] = 5;
        assert!(matches!(header.validate(), Err(PoolError::Corrupt(_))));
    }

    #[test]
    fn test_short_header() {
        assert!(matches!(
            FileHeader::from_bytes(&[0u8; 12]),
            Err(PoolError::BadFileType(_))
        ));
    }

    #[test]
    fn test_in_place_fields() {
        let mut segment = vec![0u8; 256];
        let header = FileHeader::new(16);
        segment[FILE_HEADER_OFFSET..FILE_HEADER_OFFSET + FILE_HEADER_SIZE]
            .copy_from_slice(&header.to_bytes());

        FileHeader::set_segment_count(&mut segment, 3);
        FileHeader::set_free_list_head(&mut segment, 7, 2);
        FileHeader::set_user_context(&mut segment, 42);

        assert_eq!(FileHeader::segment_count(&segment), 3);
        assert_eq!(FileHeader::free_list_head(&segment, 7), 2);
        assert_eq!(FileHeader::free_list_head(&segment, 0), NO_SEGMENT);
        assert_eq!(FileHeader::user_context(&segment), 42);
    }

    #[test]
    fn test_segment_header_fields() {
        let geo = Geometry::new(16);
        let mut segment = vec![0u8; geo.segment_size];

        {
            let mut header = SegmentHeader::at_mut(&mut segment, &geo, 1);
            header.set_free_blocks(100);
            header.set_free_flink(3);
            header.set_free_blink(NO_SEGMENT);
        }

        let header = SegmentHeader::at(&segment, &geo, 1);
        assert_eq!(header.free_blocks(), 100);
        assert_eq!(header.free_flink(), 3);
        assert_eq!(header.free_blink(), NO_SEGMENT);
        assert_eq!(
            read_u32(&segment, BLOCK_HEADER_SIZE + BITMAP_SIZE),
            100
        );
    }

    #[test]
    fn test_block_header_layout() {
        let mut segment = vec![0u8; 64];
        BlockHeader { span: 5, flags: 2 }.write(&mut segment, 16);
        assert_eq!(&segment[16..24], &[5, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(BlockHeader::read(&segment, 16), BlockHeader { span: 5, flags: 2 });
    }
}
