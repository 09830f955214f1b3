//! Open-time validation and corruption detection tests

use segpool::{FilePool, PoolError, PoolParameters};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::TempDir;

fn params() -> PoolParameters {
    PoolParameters {
        segment_shift: 16,
        ..Default::default()
    }
}

fn patch(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
}

fn create_pool(path: &Path, allocations: usize) {
    let mut pool = FilePool::create_or_open(path, false, &params()).unwrap();
    for _ in 0..allocations {
        let allocation = pool.allocate(100).unwrap();
        pool.dereference(allocation.ptr).unwrap();
    }
    pool.close().unwrap();
}

#[test]
fn test_bad_magic() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("magic.pool");
    std::fs::write(&path, vec![0xAB; 8192]).unwrap();

    let result = FilePool::create_or_open(&path, false, &params());
    assert!(matches!(result, Err(PoolError::BadFileType(_))));

    // Not created by the failed open, so it is left alone
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
}

#[test]
fn test_truncated_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("truncated.pool");
    create_pool(&path, 0);

    // Claim three segments in a one-segment file
    patch(&path, 8 + 8, &3u32.to_le_bytes());

    let result = FilePool::create_or_open(&path, false, &params());
    assert!(matches!(result, Err(PoolError::Corrupt(_))));
}

#[test]
fn test_zero_segment_count() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("zero.pool");
    create_pool(&path, 0);
    patch(&path, 8 + 8, &0u32.to_le_bytes());

    assert!(matches!(
        FilePool::create_or_open(&path, true, &params()),
        Err(PoolError::Corrupt(_))
    ));
}

#[test]
fn test_segment_shift_out_of_range() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shift.pool");
    create_pool(&path, 0);
    patch(&path, 8 + 4, &40u32.to_le_bytes());

    assert!(matches!(
        FilePool::create_or_open(&path, false, &params()),
        Err(PoolError::Corrupt(_))
    ));
}

#[test]
fn test_free_list_head_out_of_range() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("head.pool");
    create_pool(&path, 0);
    patch(&path, 8 + 12 + 2 * 4, &9u32.to_le_bytes());

    assert!(matches!(
        FilePool::create_or_open(&path, false, &params()),
        Err(PoolError::Corrupt(_))
    ));
}

#[test]
fn test_read_only_rejects_empty_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.pool");
    std::fs::write(&path, b"short").unwrap();

    assert!(matches!(
        FilePool::create_or_open(&path, true, &params()),
        Err(PoolError::BadFileType(_))
    ));
}

#[test]
fn test_read_only_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing.pool");

    assert!(matches!(
        FilePool::create_or_open(&path, true, &params()),
        Err(PoolError::Io(_))
    ));
    assert!(!path.exists());
}

#[test]
fn test_short_file_is_reformatted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.pool");
    std::fs::write(&path, vec![0xFF; 100]).unwrap();

    let mut pool = FilePool::create_or_open(&path, false, &params()).unwrap();
    assert_eq!(pool.segment_count(), 1);
    pool.verify().unwrap();
}

#[test]
fn test_verify_detects_bitmap_damage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bitmap.pool");
    create_pool(&path, 3);

    // Segment 0 at shift 16: file header block, then the segment header body
    // at 64 + 8. Clear the bit of the first user block (block 4).
    patch(&path, 64 + 8, &[0b0000_1111]);

    let mut pool = FilePool::create_or_open(&path, false, &params()).unwrap();
    let err = pool.verify().unwrap_err();
    assert!(matches!(err, PoolError::Corrupt(_)));
    assert!(err.to_string().contains("segment 0"));
}

#[test]
fn test_verify_detects_broken_back_link() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("links.pool");
    create_pool(&path, 0);

    // Segment 0's blink lives at segment header body + 136
    patch(&path, 64 + 8 + 136, &0u32.to_le_bytes());

    let mut pool = FilePool::create_or_open(&path, false, &params()).unwrap();
    assert!(matches!(pool.verify(), Err(PoolError::Corrupt(_))));
}
