//! # segpool - File-Backed Segmented Block Allocator
//!
//! `segpool` is a persistent heap that lives inside a single file:
//!
//! - **Segments**: the file is a sequence of power-of-two sized segments
//!   (64 KiB to 256 MiB), each split into 1024 blocks
//! - **Stable addresses**: every allocation has an [`Rva`] that survives
//!   closing and reopening the pool
//! - **Mapped views**: segments are memory-mapped on demand, reference counted,
//!   and unreferenced views are kept in an LRU cache
//! - **Bucketed free lists** on disk pick a segment with enough room without
//!   scanning the whole file
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use segpool::{PoolBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let mut pool = PoolBuilder::new().segment_shift(18).open("data.pool")?;
//!
//! // Allocate and write; the pointer comes referenced
//! let allocation = pool.allocate(100)?;
//! pool.bytes_mut(allocation.ptr)?[..5].copy_from_slice(b"hello");
//! pool.dereference(allocation.ptr)?;
//!
//! // Keep the RVA somewhere persistent, e.g. the user context slot
//! pool.set_user_context(u64::from(allocation.rva.get()))?;
//! pool.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Reopening
//!
//! ```rust,no_run
//! use segpool::{PoolBuilder, Result, Rva};
//!
//! # fn main() -> Result<()> {
//! let mut pool = PoolBuilder::new().open("data.pool")?;
//! let rva = Rva::new(pool.user_context() as u32);
//!
//! let ptr = pool.reference_by_rva(rva)?;
//! assert_eq!(&pool.bytes(ptr)?[..5], b"hello");
//! pool.dereference(ptr)?;
//!
//! pool.free_by_rva(rva)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## File Layout
//!
//! ```text
//! Segment 0:
//!   [Block Header][File Header][Block Header][Segment Header][Block Header][User Data]...
//! Segment N (N>0):
//!   [Block Header][Segment Header][Block Header][User Data]...
//! ```

pub mod core;
pub mod shared;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{
    allocator, config, error, header, io, pool, rva, validation, view_cache,
};

pub use crate::core::{
    config::{PoolParameters, DEFAULT_MAX_INACTIVE_VIEWS, DEFAULT_SEGMENT_SHIFT},
    error::{PoolError, Result},
    header::{Geometry, BLOCK_COUNT, MAX_SEGMENT_SHIFT, MIN_SEGMENT_SHIFT},
    io::{Backing, FileBacking, SegmentMap},
    pool::{Allocation, BlockPtr, FilePool, PoolStats},
    rva::Rva,
    validation::VerifyReport,
    view_cache::CacheStats,
};
pub use crate::shared::SharedFilePool;

use std::path::Path;
use tracing::info;

/// Builder for opening or creating a pool
///
/// # Examples
///
/// ```rust,no_run
/// use segpool::PoolBuilder;
///
/// # fn main() -> segpool::Result<()> {
/// let pool = PoolBuilder::new()
///     .segment_shift(20) // 1 MiB segments for new files
///     .max_inactive_views(32)
///     .open("big.pool")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    parameters: PoolParameters,
    read_only: bool,
}

impl PoolBuilder {
    /// Create a builder with default parameters
    pub fn new() -> Self {
        PoolBuilder {
            parameters: PoolParameters::default(),
            read_only: false,
        }
    }

    /// Segment size as a power of two; only used when creating a file
    pub fn segment_shift(mut self, segment_shift: u32) -> Self {
        self.parameters.segment_shift = segment_shift;
        self
    }

    /// Number of unreferenced views kept mapped
    pub fn max_inactive_views(mut self, max_inactive_views: usize) -> Self {
        self.parameters.max_inactive_views = max_inactive_views;
        self
    }

    /// Replace all parameters, e.g. with ones loaded from TOML
    pub fn parameters(mut self, parameters: PoolParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Open without write access; the file must already hold a pool
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Open the pool at `path`, creating it if needed
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<FilePool> {
        info!("Opening pool at {:?}", path.as_ref());
        FilePool::create_or_open(path, self.read_only, &self.parameters)
    }

    /// Open the pool at `path` behind a lock
    pub fn open_shared<P: AsRef<Path>>(self, path: P) -> Result<SharedFilePool> {
        Ok(SharedFilePool::new(self.open(path)?))
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creates_pool() -> Result<()> {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("builder.pool");

        let pool = PoolBuilder::new()
            .segment_shift(17)
            .max_inactive_views(4)
            .open(&path)?;

        assert_eq!(pool.geometry().segment_shift, 17);
        assert_eq!(pool.stats().segment_count, 1);
        assert_eq!(pool.path(), Some(path.as_path()));
        assert_eq!(std::fs::metadata(&path)?.len(), 1 << 17);

        Ok(())
    }

    #[test]
    fn test_builder_with_toml_parameters() -> Result<()> {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let parameters = PoolParameters::from_toml_str("segment_shift = 16\nmax_inactive_views = 1")?;

        let pool = PoolBuilder::new()
            .parameters(parameters)
            .open(temp_dir.path().join("toml.pool"))?;
        assert_eq!(pool.geometry().block_size, 64);

        Ok(())
    }

    #[test]
    fn test_stored_shift_wins_on_reopen() -> Result<()> {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("reopen.pool");

        PoolBuilder::new().segment_shift(16).open(&path)?.close()?;
        let pool = PoolBuilder::new().segment_shift(20).open(&path)?;
        assert_eq!(pool.geometry().segment_shift, 16);

        Ok(())
    }

    #[test]
    fn test_read_only_cannot_create() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.pool");
        std::fs::write(&path, b"").unwrap();

        let result = PoolBuilder::new().read_only(true).open(&path);
        assert!(matches!(result, Err(PoolError::BadFileType(_))));
        // The file was not created by the open, so it stays
        assert!(path.exists());
    }
}
