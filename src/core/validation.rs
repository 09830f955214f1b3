//! Consistency checks over a whole pool
//!
//! Verification walks every free list and every segment and reports the first
//! broken invariant as [`PoolError::Corrupt`]:
//! - each segment's free count matches the clear bits of its bitmap
//! - every used run starts with a block header whose span is fully used
//! - bucket chains have consistent back links and no cycles
//! - each segment is in exactly one bucket, the one its free count selects

use crate::allocator::free_list::{self, free_list_index};
use crate::error::{PoolError, Result};
use crate::header::{BlockHeader, Geometry, SegmentHeader, BLOCK_COUNT, FREE_LIST_COUNT, NO_SEGMENT};
use crate::view_cache::ViewCache;

/// Totals gathered while verifying a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub segments: u32,
    /// Live user allocations
    pub allocations: u64,
    pub free_blocks: u64,
    /// Blocks in use, headers included
    pub used_blocks: u64,
}

/// Per-segment result of [`check_segment`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentReport {
    pub free_blocks: u32,
    pub allocations: u32,
}

pub fn verify(views: &mut ViewCache, geometry: &Geometry, segment_count: u32) -> Result<VerifyReport> {
    let buckets = bucket_membership(views, geometry, segment_count)?;
    let mut report = VerifyReport {
        segments: segment_count,
        ..Default::default()
    };

    for segment_index in 0..segment_count {
        views.reference(segment_index)?;
        let result = check_segment(views.segment(segment_index), geometry, segment_index);
        views.dereference(segment_index);
        let segment = result?;

        let expected = free_list_index(geometry, segment.free_blocks);
        match buckets[segment_index as usize] {
            Some(bucket) if bucket == expected => {}
            Some(bucket) => {
                return Err(PoolError::Corrupt(format!(
                    "segment {} with {} free blocks is in bucket {}, expected {}",
                    segment_index, segment.free_blocks, bucket, expected
                )))
            }
            None => {
                return Err(PoolError::Corrupt(format!(
                    "segment {} is not on any free list",
                    segment_index
                )))
            }
        }

        report.allocations += u64::from(segment.allocations);
        report.free_blocks += u64::from(segment.free_blocks);
        report.used_blocks += u64::from(BLOCK_COUNT - segment.free_blocks);
    }

    Ok(report)
}

/// Walk every bucket and record which bucket each segment sits in
fn bucket_membership(
    views: &mut ViewCache,
    geometry: &Geometry,
    segment_count: u32,
) -> Result<Vec<Option<usize>>> {
    let mut buckets = vec![None; segment_count as usize];

    for bucket in 0..FREE_LIST_COUNT {
        let mut previous = NO_SEGMENT;
        let mut current = free_list::head(views, bucket);

        while current != NO_SEGMENT {
            if current >= segment_count {
                return Err(PoolError::Corrupt(format!(
                    "bucket {} links to segment {} beyond segment count {}",
                    bucket, current, segment_count
                )));
            }
            if let Some(other) = buckets[current as usize] {
                return Err(PoolError::Corrupt(format!(
                    "segment {} reached twice (buckets {} and {})",
                    current, other, bucket
                )));
            }
            buckets[current as usize] = Some(bucket);

            views.reference(current)?;
            let header = SegmentHeader::at(views.segment(current), geometry, current);
            let (flink, blink) = (header.free_flink(), header.free_blink());
            views.dereference(current);

            if blink != previous {
                return Err(PoolError::Corrupt(format!(
                    "segment {} in bucket {} has back link {}, expected {}",
                    current, bucket, blink, previous
                )));
            }

            previous = current;
            current = flink;
        }
    }

    Ok(buckets)
}

/// Check the bitmap and block headers of one mapped segment
pub fn check_segment(segment: &[u8], geometry: &Geometry, segment_index: u32) -> Result<SegmentReport> {
    let corrupt = |what: String| PoolError::Corrupt(format!("segment {}: {}", segment_index, what));

    let header_block = geometry.segment_header_block(segment_index);
    let header_span = BlockHeader::read(segment, geometry.block_offset(header_block)).span;
    if header_span != geometry.segment_header_span {
        return Err(corrupt(format!(
            "segment header spans {} blocks, expected {}",
            header_span, geometry.segment_header_span
        )));
    }

    let header = SegmentHeader::at(segment, geometry, segment_index);
    let bitmap = header.bitmap();
    let free_blocks = header.free_blocks();

    if bitmap.count_clear() != free_blocks {
        return Err(corrupt(format!(
            "free count {} but {} clear bits",
            free_blocks,
            bitmap.count_clear()
        )));
    }

    let first_data_block = geometry.first_data_block(segment_index);
    if !bitmap.are_set(0, first_data_block) {
        return Err(corrupt("header blocks are marked free".to_string()));
    }

    let mut allocations = 0;
    let mut block = first_data_block;
    while block < BLOCK_COUNT {
        if !bitmap.is_set(block) {
            block += 1;
            continue;
        }

        let span = BlockHeader::read(segment, geometry.block_offset(block)).span;
        if span == 0 || span > geometry.max_allocation_blocks() || !bitmap.are_set(block, span) {
            return Err(corrupt(format!(
                "used block {} has a block header with span {}",
                block, span
            )));
        }

        allocations += 1;
        block += span;
    }

    Ok(SegmentReport {
        free_blocks,
        allocations,
    })
}
