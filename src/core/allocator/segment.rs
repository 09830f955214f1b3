//! Block allocation within a single mapped segment

use crate::header::{BlockHeader, Geometry, SegmentHeader, BLOCK_COUNT, BLOCK_HEADER_SIZE, NO_SEGMENT};

/// Write a fresh segment header into `segment`
///
/// `additional_used_blocks` counts blocks in front of the segment header that
/// are already taken; only segment 0 has any (the file header).
pub fn initialize_segment(
    segment: &mut [u8],
    geometry: &Geometry,
    segment_index: u32,
    additional_used_blocks: u32,
) {
    let header_block = geometry.segment_header_block(segment_index);
    BlockHeader::new(geometry.segment_header_span)
        .write(segment, geometry.block_offset(header_block));

    let used = geometry.segment_header_span + additional_used_blocks;
    let mut header = SegmentHeader::at_mut(segment, geometry, segment_index);
    let mut bitmap = header.bitmap_mut();
    bitmap.clear_range(0, BLOCK_COUNT);
    bitmap.set_range(0, used);

    header.set_free_blocks(BLOCK_COUNT - used);
    header.set_free_flink(NO_SEGMENT);
    header.set_free_blink(NO_SEGMENT);
}

/// Allocate `count` contiguous blocks, returning the first block index
///
/// Returns `None` when the segment has no run of that length, even if its
/// free count is large enough.
pub fn allocate_blocks(
    segment: &mut [u8],
    geometry: &Geometry,
    segment_index: u32,
    count: u32,
) -> Option<u32> {
    let hint = geometry.first_data_block(segment_index);

    let start = {
        let mut header = SegmentHeader::at_mut(segment, geometry, segment_index);
        let start = header.bitmap_mut().find_clear_run_and_set(count, hint)?;
        let free = header.free_blocks();
        header.set_free_blocks(free - count);
        start
    };

    BlockHeader::new(count).write(segment, geometry.block_offset(start));
    Some(start)
}

/// Release the allocation whose block header sits at `block_header_offset`
///
/// Returns the number of blocks released.
pub fn free_blocks(
    segment: &mut [u8],
    geometry: &Geometry,
    segment_index: u32,
    block_header_offset: usize,
) -> u32 {
    let start = (block_header_offset >> geometry.block_shift) as u32;
    let span = BlockHeader::read(segment, block_header_offset).span;

    let mut header = SegmentHeader::at_mut(segment, geometry, segment_index);
    header.bitmap_mut().clear_range(start, span);
    let free = header.free_blocks();
    header.set_free_blocks(free + span);

    span
}

/// Locate the live allocation whose payload starts at `payload_offset`
///
/// Returns `(block_header_offset, span)`, or `None` if the offset is not the
/// payload of an allocation that is currently marked used.
pub fn live_allocation(
    segment: &[u8],
    geometry: &Geometry,
    segment_index: u32,
    payload_offset: usize,
) -> Option<(usize, u32)> {
    let header_offset = payload_offset.checked_sub(BLOCK_HEADER_SIZE)?;
    if header_offset % geometry.block_size != 0 || header_offset >= geometry.segment_size {
        return None;
    }

    let start = (header_offset >> geometry.block_shift) as u32;
    if start < geometry.first_data_block(segment_index) {
        return None;
    }

    // Only a block reached by walking the allocation headers starts one
    let header = SegmentHeader::at(segment, geometry, segment_index);
    let bitmap = header.bitmap();
    let mut block = geometry.first_data_block(segment_index);
    while block <= start {
        if !bitmap.is_set(block) {
            block += 1;
            continue;
        }

        let span = BlockHeader::read(segment, geometry.block_offset(block)).span;
        if span == 0 || span > geometry.max_allocation_blocks() || !bitmap.are_set(block, span) {
            return None;
        }
        if block == start {
            return Some((header_offset, span));
        }
        block += span;
    }

    None
}
