//! Bucketed free lists of segments
//!
//! Every segment is threaded into exactly one of [`FREE_LIST_COUNT`] on-disk
//! doubly-linked lists, chosen by how many free blocks it has. The list heads
//! live in the file header, the links in each segment header.
//!
//! Every operation references all segments it will write before touching any
//! of them, so a mapping failure leaves the lists as they were.

use crate::error::Result;
use crate::header::{FileHeader, Geometry, SegmentHeader, BLOCK_COUNT, FREE_LIST_COUNT, NO_SEGMENT};
use crate::view_cache::ViewCache;

/// Bucket for a segment with `free_blocks` free blocks
///
/// Bucket 0 holds empty segments, bucket 7 full ones. Allocation of `n`
/// blocks scans buckets `0..=free_list_index(n)`.
pub fn free_list_index(geometry: &Geometry, free_blocks: u32) -> usize {
    let n = free_blocks;
    if n >= BLOCK_COUNT / 64 {
        if n >= BLOCK_COUNT / 2 {
            if n >= BLOCK_COUNT - geometry.segment_header_span {
                0
            } else {
                1
            }
        } else if n >= BLOCK_COUNT / 16 {
            2
        } else {
            3
        }
    } else if n >= 4 {
        if n >= BLOCK_COUNT / 256 {
            4
        } else {
            5
        }
    } else if n >= 1 {
        6
    } else {
        7
    }
}

/// First segment of `bucket`, or [`NO_SEGMENT`]
pub fn head(views: &ViewCache, bucket: usize) -> u32 {
    FileHeader::free_list_head(views.segment(0), bucket)
}

/// Segment following `segment_index` in its bucket; the segment must be mapped
pub fn next(views: &ViewCache, geometry: &Geometry, segment_index: u32) -> u32 {
    SegmentHeader::at(views.segment(segment_index), geometry, segment_index).free_flink()
}

fn links(views: &ViewCache, geometry: &Geometry, segment_index: u32) -> (u32, u32) {
    let header = SegmentHeader::at(views.segment(segment_index), geometry, segment_index);
    (header.free_flink(), header.free_blink())
}

fn set_flink(views: &mut ViewCache, geometry: &Geometry, segment_index: u32, flink: u32) -> Result<()> {
    let segment = views.segment_mut(segment_index)?;
    SegmentHeader::at_mut(segment, geometry, segment_index).set_free_flink(flink);
    Ok(())
}

fn set_blink(views: &mut ViewCache, geometry: &Geometry, segment_index: u32, blink: u32) -> Result<()> {
    let segment = views.segment_mut(segment_index)?;
    SegmentHeader::at_mut(segment, geometry, segment_index).set_free_blink(blink);
    Ok(())
}

fn set_head(views: &mut ViewCache, bucket: usize, segment_index: u32) -> Result<()> {
    FileHeader::set_free_list_head(views.segment_mut(0)?, bucket, segment_index);
    Ok(())
}

/// Reference each distinct segment in `segments`, skipping [`NO_SEGMENT`]
///
/// On failure every reference taken so far is dropped again.
fn acquire(views: &mut ViewCache, segments: &[u32]) -> Result<Vec<u32>> {
    let mut acquired = Vec::with_capacity(segments.len());
    for &index in segments {
        if index == NO_SEGMENT || acquired.contains(&index) {
            continue;
        }
        if let Err(e) = views.reference(index) {
            release(views, &acquired);
            return Err(e);
        }
        acquired.push(index);
    }
    Ok(acquired)
}

fn release(views: &mut ViewCache, acquired: &[u32]) {
    for &index in acquired.iter().rev() {
        views.dereference(index);
    }
}

/// Thread `segment_index` in at the head of `bucket`; all touched segments
/// must already be referenced
fn link_acquired(
    views: &mut ViewCache,
    geometry: &Geometry,
    bucket: usize,
    segment_index: u32,
) -> Result<()> {
    let old_head = head(views, bucket);

    set_flink(views, geometry, segment_index, old_head)?;
    set_blink(views, geometry, segment_index, NO_SEGMENT)?;
    if old_head != NO_SEGMENT {
        set_blink(views, geometry, old_head, segment_index)?;
    }
    set_head(views, bucket, segment_index)
}

/// Unthread `segment_index` from `bucket`; all touched segments must already
/// be referenced
fn unlink_acquired(
    views: &mut ViewCache,
    geometry: &Geometry,
    bucket: usize,
    segment_index: u32,
) -> Result<()> {
    let (flink, blink) = links(views, geometry, segment_index);

    if blink != NO_SEGMENT {
        set_flink(views, geometry, blink, flink)?;
    } else {
        set_head(views, bucket, flink)?;
    }
    if flink != NO_SEGMENT {
        set_blink(views, geometry, flink, blink)?;
    }

    set_flink(views, geometry, segment_index, NO_SEGMENT)?;
    set_blink(views, geometry, segment_index, NO_SEGMENT)
}

/// Insert a segment at the head of `bucket`
pub fn insert(
    views: &mut ViewCache,
    geometry: &Geometry,
    bucket: usize,
    segment_index: u32,
) -> Result<()> {
    debug_assert!(bucket < FREE_LIST_COUNT);

    let old_head = head(views, bucket);
    let acquired = acquire(views, &[segment_index, old_head])?;
    let result = link_acquired(views, geometry, bucket, segment_index);
    release(views, &acquired);
    result
}

/// Remove a segment from `bucket`
pub fn remove(
    views: &mut ViewCache,
    geometry: &Geometry,
    bucket: usize,
    segment_index: u32,
) -> Result<()> {
    let own = acquire(views, &[segment_index])?;
    let (flink, blink) = links(views, geometry, segment_index);

    let neighbours = match acquire(views, &[flink, blink]) {
        Ok(neighbours) => neighbours,
        Err(e) => {
            release(views, &own);
            return Err(e);
        }
    };

    let result = unlink_acquired(views, geometry, bucket, segment_index);
    release(views, &neighbours);
    release(views, &own);
    result
}

/// Move a segment from bucket `from` to bucket `to`
///
/// Either the segment ends up in `to` or nothing changed.
pub fn relink(
    views: &mut ViewCache,
    geometry: &Geometry,
    segment_index: u32,
    from: usize,
    to: usize,
) -> Result<()> {
    if from == to {
        return Ok(());
    }

    let own = acquire(views, &[segment_index])?;
    let (flink, blink) = links(views, geometry, segment_index);
    let new_head = head(views, to);

    let neighbours = match acquire(views, &[flink, blink, new_head]) {
        Ok(neighbours) => neighbours,
        Err(e) => {
            release(views, &own);
            return Err(e);
        }
    };

    let result = unlink_acquired(views, geometry, from, segment_index)
        .and_then(|_| link_acquired(views, geometry, to, segment_index));
    release(views, &neighbours);
    release(views, &own);
    result
}
