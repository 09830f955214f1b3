//! The file pool
//!
//! A [`FilePool`] is a persistent heap inside a single file. Allocations are
//! addressed two ways:
//! - an [`Rva`], stable across processes and reopenings
//! - a [`BlockPtr`], the address of the payload in this process, valid only
//!   while the caller holds a reference on its segment
//!
//! `allocate` and `reference*` hand out a reference together with the pointer;
//! `dereference*` and `free` give it back.

use crate::allocator::free_list::{self, free_list_index};
use crate::allocator::segment::{allocate_blocks, free_blocks, initialize_segment, live_allocation};
use crate::config::PoolParameters;
use crate::error::{PoolError, Result};
use crate::header::{
    BlockHeader, FileHeader, Geometry, SegmentHeader, BLOCK_HEADER_SIZE, FILE_HEADER_OFFSET,
    FILE_HEADER_SIZE, NO_SEGMENT, HEADER_MAP_SIZE,
};
use crate::io::{Backing, FileBacking};
use crate::rva::Rva;
use crate::validation::{self, VerifyReport};
use crate::view_cache::{CacheStats, ViewCache};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Transient address of an allocation's payload
///
/// Only meaningful while the segment it points into is referenced. Use
/// [`FilePool::bytes`] and [`FilePool::bytes_mut`] for safe access.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPtr(usize);

impl BlockPtr {
    pub fn from_addr(addr: usize) -> Self {
        BlockPtr(addr)
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl fmt::Debug for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockPtr({:#x})", self.0)
    }
}

/// Result of [`FilePool::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Payload address, referenced once on behalf of the caller
    pub ptr: BlockPtr,
    /// Stable address of the payload
    pub rva: Rva,
    /// Usable payload bytes; at least the requested size
    pub len: usize,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub segment_count: u32,
    pub segment_size: usize,
    pub block_size: usize,
    pub cache: CacheStats,
    /// True if the requested parameters were out of range and got clamped
    pub parameters_adjusted: bool,
}

pub struct FilePool {
    views: ViewCache,
    geometry: Geometry,
    read_only: bool,
    parameters_adjusted: bool,
    path: Option<PathBuf>,
}

impl FilePool {
    /// Open the pool stored in `path`, creating it if the file is new or empty
    ///
    /// If this call created the file and the pool cannot be set up, the file
    /// is removed again.
    pub fn create_or_open<P: AsRef<Path>>(
        path: P,
        read_only: bool,
        parameters: &PoolParameters,
    ) -> Result<Self> {
        let path = path.as_ref();
        let (backing, created) = FileBacking::open(path, read_only)?;

        match Self::with_backing(Box::new(backing), parameters) {
            Ok(mut pool) => {
                pool.path = Some(path.to_path_buf());
                Ok(pool)
            }
            Err(e) => {
                if created {
                    if let Err(remove_error) = std::fs::remove_file(path) {
                        warn!("Could not remove {:?} after failed creation: {}", path, remove_error);
                    }
                }
                Err(e)
            }
        }
    }

    /// Open or create a pool over any [`Backing`]
    ///
    /// Storage shorter than [`HEADER_MAP_SIZE`] is formatted as a new pool.
    pub fn with_backing(backing: Box<dyn Backing>, parameters: &PoolParameters) -> Result<Self> {
        let (parameters, adjusted) = parameters.normalized();
        if adjusted {
            warn!(
                "Segment shift clamped to {} (valid range is 16..=28)",
                parameters.segment_shift
            );
        }

        if backing.len()? < HEADER_MAP_SIZE as u64 {
            Self::create(backing, parameters, adjusted)
        } else {
            Self::open(backing, parameters, adjusted)
        }
    }

    fn create(
        mut backing: Box<dyn Backing>,
        parameters: PoolParameters,
        parameters_adjusted: bool,
    ) -> Result<Self> {
        if backing.is_read_only() {
            return Err(PoolError::BadFileType(
                "file is too short to hold a pool and cannot be created read-only".to_string(),
            ));
        }

        let geometry = Geometry::new(parameters.segment_shift);
        backing.grow(geometry.segment_size as u64)?;

        let mut views = ViewCache::new(backing, geometry.segment_shift, parameters.max_inactive_views);
        views.reference(0)?;

        let segment0 = views.segment_mut(0)?;
        BlockHeader::new(geometry.file_header_span).write(segment0, 0);
        segment0[FILE_HEADER_OFFSET..FILE_HEADER_OFFSET + FILE_HEADER_SIZE]
            .copy_from_slice(&FileHeader::new(geometry.segment_shift).to_bytes());
        initialize_segment(segment0, &geometry, 0, geometry.file_header_span);

        let free = SegmentHeader::at(views.segment(0), &geometry, 0).free_blocks();
        free_list::insert(&mut views, &geometry, free_list_index(&geometry, free), 0)?;

        info!(
            "Created pool with {} byte segments ({} byte blocks)",
            geometry.segment_size, geometry.block_size
        );

        Ok(FilePool {
            views,
            geometry,
            read_only: false,
            parameters_adjusted,
            path: None,
        })
    }

    fn open(
        backing: Box<dyn Backing>,
        parameters: PoolParameters,
        parameters_adjusted: bool,
    ) -> Result<Self> {
        let header = {
            let head = backing
                .map(0, HEADER_MAP_SIZE)
                .map_err(|source| PoolError::Map { segment: 0, source })?;
            FileHeader::from_bytes(&head.as_slice()[FILE_HEADER_OFFSET..])?
        };
        header.validate()?;

        let geometry = Geometry::new(header.segment_shift);
        let needed = u64::from(header.segment_count) << header.segment_shift;
        let len = backing.len()?;
        if len < needed {
            return Err(PoolError::Corrupt(format!(
                "file holds {} bytes but {} segments need {}",
                len, header.segment_count, needed
            )));
        }

        if parameters.segment_shift != header.segment_shift {
            debug!(
                "Using stored segment shift {} instead of requested {}",
                header.segment_shift, parameters.segment_shift
            );
        }

        let read_only = backing.is_read_only();
        let mut views = ViewCache::new(backing, geometry.segment_shift, parameters.max_inactive_views);
        views.reference(0)?;

        let span = BlockHeader::read(views.segment(0), 0).span;
        if span != geometry.file_header_span {
            return Err(PoolError::Corrupt(format!(
                "file header spans {} blocks, expected {}",
                span, geometry.file_header_span
            )));
        }

        info!(
            "Opened pool with {} segments of {} bytes{}",
            header.segment_count,
            geometry.segment_size,
            if read_only { " (read-only)" } else { "" }
        );

        Ok(FilePool {
            views,
            geometry,
            read_only,
            parameters_adjusted,
            path: None,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn segment_count(&self) -> u32 {
        FileHeader::segment_count(self.views.segment(0))
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Path the pool was opened from, if it was opened by path
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(PoolError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Allocate at least `size` bytes
    ///
    /// The returned pointer comes with one reference on its segment.
    pub fn allocate(&mut self, size: usize) -> Result<Allocation> {
        self.check_writable()?;

        let geometry = self.geometry;
        let blocks = geometry.blocks_for(size).ok_or(PoolError::AllocationTooLarge {
            size,
            max: geometry.max_allocation_size(),
        })?;

        for bucket in 0..=free_list_index(&geometry, blocks) {
            let mut segment_index = free_list::head(&self.views, bucket);

            while segment_index != NO_SEGMENT {
                let base = self.views.reference(segment_index)?;

                match self.allocate_in(segment_index, blocks) {
                    Ok(Some(start)) => {
                        return self.finish_allocation(segment_index, base, bucket, start, blocks)
                    }
                    Ok(None) => {
                        let next = free_list::next(&self.views, &geometry, segment_index);
                        self.views.dereference(segment_index);
                        segment_index = next;
                    }
                    Err(e) => {
                        self.views.dereference(segment_index);
                        return Err(e);
                    }
                }
            }
        }

        let (segment_index, base) = self.allocate_segment(blocks)?;
        let from = free_list_index(&geometry, geometry.max_allocation_blocks());
        match self.allocate_in(segment_index, blocks) {
            Ok(Some(start)) => self.finish_allocation(segment_index, base, from, start, blocks),
            Ok(None) => panic!("fresh segment {segment_index} cannot hold {blocks} blocks"),
            Err(e) => {
                self.views.dereference(segment_index);
                Err(e)
            }
        }
    }

    /// Try to take `blocks` blocks from a referenced segment
    fn allocate_in(&mut self, segment_index: u32, blocks: u32) -> Result<Option<u32>> {
        let segment = self.views.segment_mut(segment_index)?;
        Ok(allocate_blocks(segment, &self.geometry, segment_index, blocks))
    }

    /// Move the segment to its new bucket and build the allocation
    ///
    /// The block allocation is undone if the move fails.
    fn finish_allocation(
        &mut self,
        segment_index: u32,
        base: usize,
        from: usize,
        start: u32,
        blocks: u32,
    ) -> Result<Allocation> {
        let geometry = self.geometry;
        let header_offset = geometry.block_offset(start);

        let free = SegmentHeader::at(self.views.segment(segment_index), &geometry, segment_index)
            .free_blocks();
        let to = free_list_index(&geometry, free);

        if let Err(e) = free_list::relink(&mut self.views, &geometry, segment_index, from, to) {
            if let Ok(segment) = self.views.segment_mut(segment_index) {
                free_blocks(segment, &geometry, segment_index, header_offset);
            }
            self.views.dereference(segment_index);
            return Err(e);
        }

        let payload = header_offset + BLOCK_HEADER_SIZE;
        let allocation = Allocation {
            ptr: BlockPtr(base + payload),
            rva: Rva::encode(&geometry, segment_index, payload),
            len: geometry.payload_len(blocks),
        };
        trace!(
            "Allocated {} blocks at {} in segment {}",
            blocks,
            allocation.rva,
            segment_index
        );
        Ok(allocation)
    }

    /// Append a fresh segment to the file and link it into its bucket
    ///
    /// Returns the new segment's index and base address; the segment stays
    /// referenced for the caller.
    fn allocate_segment(&mut self, blocks: u32) -> Result<(u32, usize)> {
        let geometry = self.geometry;
        let segment_index = self.segment_count();

        if u64::from(segment_index) >= geometry.max_segments() {
            warn!("Pool reached its {} segment limit", geometry.max_segments());
            return Err(PoolError::OutOfSpace { blocks });
        }

        let new_len = (u64::from(segment_index) + 1) << geometry.segment_shift;
        self.views.backing_mut().grow(new_len)?;
        let base = self.views.reference(segment_index)?;

        if let Err(e) = self.link_new_segment(segment_index) {
            self.views.dereference(segment_index);
            return Err(e);
        }

        FileHeader::set_segment_count(self.views.segment_mut(0)?, segment_index + 1);
        debug!("Grew pool to {} segments", segment_index + 1);

        Ok((segment_index, base))
    }

    fn link_new_segment(&mut self, segment_index: u32) -> Result<()> {
        let geometry = self.geometry;
        let segment = self.views.segment_mut(segment_index)?;
        initialize_segment(segment, &geometry, segment_index, 0);

        let bucket = free_list_index(&geometry, geometry.max_allocation_blocks());
        free_list::insert(&mut self.views, &geometry, bucket, segment_index)
    }

    /// Locate the referenced segment containing `ptr`
    fn resolve(&self, ptr: BlockPtr) -> Result<(u32, usize)> {
        let addr = ptr.addr();
        let segment_index = self
            .views
            .find_view_containing(addr)
            .filter(|index| self.views.ref_count(*index).unwrap_or(0) > 0)
            .ok_or(PoolError::InvalidAddress(addr))?;
        let base = self
            .views
            .base(segment_index)
            .ok_or(PoolError::InvalidAddress(addr))?;
        Ok((segment_index, addr - base))
    }

    /// Release the allocation at `offset` in a referenced segment
    fn free_at(&mut self, segment_index: u32, offset: usize) -> Result<()> {
        let geometry = self.geometry;

        let (header_offset, span) =
            match live_allocation(self.views.segment(segment_index), &geometry, segment_index, offset) {
                Some(found) => found,
                None => {
                    let rva = Rva::encode(&geometry, segment_index, offset);
                    warn!("Refusing to free {}: not a live allocation", rva);
                    return Err(PoolError::NotAllocated(rva.get()));
                }
            };

        let free = SegmentHeader::at(self.views.segment(segment_index), &geometry, segment_index)
            .free_blocks();
        let from = free_list_index(&geometry, free);
        let to = free_list_index(&geometry, free + span);
        free_list::relink(&mut self.views, &geometry, segment_index, from, to)?;

        let segment = self.views.segment_mut(segment_index)?;
        free_blocks(segment, &geometry, segment_index, header_offset);
        trace!("Freed {} blocks in segment {}", span, segment_index);
        Ok(())
    }

    /// Free an allocation by pointer, consuming the reference held with it
    ///
    /// On error the reference is kept.
    pub fn free(&mut self, ptr: BlockPtr) -> Result<()> {
        self.check_writable()?;
        let (segment_index, offset) = self.resolve(ptr)?;
        self.free_at(segment_index, offset)?;
        self.views.dereference(segment_index);
        Ok(())
    }

    /// Free an allocation by RVA; references held by the caller are untouched
    pub fn free_by_rva(&mut self, rva: Rva) -> Result<()> {
        self.check_writable()?;
        let (segment_index, offset) = rva.decode(&self.geometry, self.segment_count())?;

        self.views.reference(segment_index)?;
        let result = self.free_at(segment_index, offset);
        self.views.dereference(segment_index);
        result
    }

    /// Take another reference on the segment containing `ptr`
    pub fn reference(&mut self, ptr: BlockPtr) -> Result<BlockPtr> {
        self.views.reference_by_address(ptr.addr())?;
        Ok(ptr)
    }

    /// Map the segment holding `rva` and return a referenced pointer to it
    pub fn reference_by_rva(&mut self, rva: Rva) -> Result<BlockPtr> {
        if rva.get() == 0 {
            return Err(PoolError::InvalidRva(0));
        }
        let (segment_index, offset) = rva.decode(&self.geometry, self.segment_count())?;
        let base = self.views.reference(segment_index)?;
        Ok(BlockPtr(base + offset))
    }

    /// Drop a reference taken with the pointer
    ///
    /// # Panics
    ///
    /// If this would drop the last reference on segment 0.
    pub fn dereference(&mut self, ptr: BlockPtr) -> Result<()> {
        self.views.dereference_by_address(ptr.addr())?;
        Ok(())
    }

    /// Drop a reference on the segment holding `rva`
    pub fn dereference_by_rva(&mut self, rva: Rva) -> Result<()> {
        let (segment_index, _) = rva.decode(&self.geometry, self.segment_count())?;
        if self.views.ref_count(segment_index).unwrap_or(0) == 0 {
            return Err(PoolError::InvalidRva(rva.get()));
        }
        self.views.dereference(segment_index);
        Ok(())
    }

    /// RVA of any address inside a mapped view; reference counts are untouched
    pub fn encode_rva(&self, ptr: BlockPtr) -> Result<Rva> {
        let addr = ptr.addr();
        let segment_index = self
            .views
            .find_view_containing(addr)
            .ok_or(PoolError::InvalidAddress(addr))?;
        let base = self
            .views
            .base(segment_index)
            .ok_or(PoolError::InvalidAddress(addr))?;
        Ok(Rva::encode(&self.geometry, segment_index, addr - base))
    }

    /// Payload of the referenced allocation at `ptr`
    pub fn bytes(&self, ptr: BlockPtr) -> Result<&[u8]> {
        let (segment_index, offset) = self.resolve(ptr)?;
        let segment = self.views.segment(segment_index);
        let (_, span) = live_allocation(segment, &self.geometry, segment_index, offset)
            .ok_or_else(|| {
                PoolError::NotAllocated(Rva::encode(&self.geometry, segment_index, offset).get())
            })?;
        Ok(&segment[offset..offset + self.geometry.payload_len(span)])
    }

    /// Mutable payload of the referenced allocation at `ptr`
    pub fn bytes_mut(&mut self, ptr: BlockPtr) -> Result<&mut [u8]> {
        self.check_writable()?;
        let (segment_index, offset) = self.resolve(ptr)?;
        let (_, span) = live_allocation(
            self.views.segment(segment_index),
            &self.geometry,
            segment_index,
            offset,
        )
        .ok_or_else(|| {
            PoolError::NotAllocated(Rva::encode(&self.geometry, segment_index, offset).get())
        })?;

        let len = self.geometry.payload_len(span);
        let segment = self.views.segment_mut(segment_index)?;
        Ok(&mut segment[offset..offset + len])
    }

    /// The 8-byte slot in the file header reserved for the pool's user
    pub fn user_context(&self) -> u64 {
        FileHeader::user_context(self.views.segment(0))
    }

    pub fn set_user_context(&mut self, context: u64) -> Result<()> {
        self.check_writable()?;
        FileHeader::set_user_context(self.views.segment_mut(0)?, context);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            segment_count: self.segment_count(),
            segment_size: self.geometry.segment_size,
            block_size: self.geometry.block_size,
            cache: self.views.stats(),
            parameters_adjusted: self.parameters_adjusted,
        }
    }

    /// Check every on-disk invariant of the pool
    pub fn verify(&mut self) -> Result<VerifyReport> {
        let segment_count = self.segment_count();
        validation::verify(&mut self.views, &self.geometry, segment_count)
    }

    /// Write all mapped views back to the file
    pub fn flush(&mut self) -> Result<()> {
        self.views.flush()
    }

    /// Flush and unmap everything
    pub fn close(mut self) -> Result<()> {
        self.views.flush()?;
        self.views.clear();
        info!("Closed pool {:?}", self.path);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn views(&self) -> &ViewCache {
        &self.views
    }
}

impl fmt::Debug for FilePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePool")
            .field("path", &self.path)
            .field("geometry", &self.geometry)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params(segment_shift: u32) -> PoolParameters {
        PoolParameters {
            segment_shift,
            ..Default::default()
        }
    }

    fn new_pool(segment_shift: u32) -> (TempDir, FilePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = FilePool::create_or_open(dir.path().join("test.pool"), false, &params(segment_shift)).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_create_formats_segment_zero() {
        let (_dir, pool) = new_pool(16);
        let geo = *pool.geometry();

        assert_eq!(pool.segment_count(), 1);
        assert_eq!(pool.user_context(), 0);
        assert_eq!(free_list::head(pool.views(), 1), 0);
        assert_eq!(free_list::head(pool.views(), 0), NO_SEGMENT);

        let seg0 = pool.views().segment(0);
        assert_eq!(&seg0[8..12], b"SGPL");
        let header = SegmentHeader::at(seg0, &geo, 0);
        assert_eq!(header.free_blocks(), 1020);
        assert_eq!(pool.views().ref_count(0), Some(1));
    }

    #[test]
    fn test_example_scenario() {
        let (_dir, mut pool) = new_pool(16);

        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(100).unwrap();
        let c = pool.allocate(100).unwrap();
        assert_eq!(a.rva.get(), 4 * 64 + 8);
        assert_eq!(b.rva.get(), 6 * 64 + 8);
        assert_eq!(c.rva.get(), 8 * 64 + 8);
        assert_eq!(a.len, 120);

        pool.free(b.ptr).unwrap();
        let d = pool.allocate(100).unwrap();
        assert_eq!(d.rva, b.rva);
        assert_eq!(pool.segment_count(), 1);
        assert_eq!(free_list::head(pool.views(), 1), 0);
    }

    #[test]
    fn test_growth_links_new_segment() {
        let (_dir, mut pool) = new_pool(16);
        let geo = *pool.geometry();

        // Too big for segment 0, which lost blocks to the file header
        let big = pool.allocate(geo.max_allocation_size()).unwrap();
        assert_eq!(pool.segment_count(), 2);
        assert_eq!(big.rva.get(), (1 << 16) + 3 * 64 + 8);
        assert_eq!(free_list::head(pool.views(), 7), 1);

        pool.free(big.ptr).unwrap();
        assert_eq!(free_list::head(pool.views(), 0), 1);
        pool.verify().unwrap();
    }

    #[test]
    fn test_allocation_too_large() {
        let (_dir, mut pool) = new_pool(16);
        let max = pool.geometry().max_allocation_size();
        let err = pool.allocate(max + 1).unwrap_err();
        assert!(matches!(err, PoolError::AllocationTooLarge { size, .. } if size == max + 1));
        assert_eq!(pool.segment_count(), 1);
    }

    #[test]
    fn test_bytes_access() {
        let (_dir, mut pool) = new_pool(16);
        let a = pool.allocate(10).unwrap();

        pool.bytes_mut(a.ptr).unwrap()[..5].copy_from_slice(b"hello");
        assert_eq!(&pool.bytes(a.ptr).unwrap()[..5], b"hello");
        assert_eq!(pool.bytes(a.ptr).unwrap().len(), a.len);

        let inside = BlockPtr::from_addr(a.ptr.addr() + 4);
        assert!(matches!(pool.bytes(inside), Err(PoolError::NotAllocated(_))));
    }

    #[test]
    fn test_double_free_is_refused() {
        let (_dir, mut pool) = new_pool(16);
        let a = pool.allocate(32).unwrap();
        pool.free_by_rva(a.rva).unwrap();
        assert!(matches!(pool.free_by_rva(a.rva), Err(PoolError::NotAllocated(_))));
        pool.verify().unwrap();
    }

    #[test]
    fn test_free_of_header_is_refused() {
        let (_dir, mut pool) = new_pool(16);
        let file_header = Rva::new(FILE_HEADER_OFFSET as u32);
        assert!(matches!(pool.free_by_rva(file_header), Err(PoolError::NotAllocated(_))));
    }

    #[test]
    fn test_rva_reference_round_trip() {
        let (_dir, mut pool) = new_pool(16);
        let a = pool.allocate(64).unwrap();

        let ptr = pool.reference_by_rva(a.rva).unwrap();
        assert_eq!(ptr, a.ptr);
        assert_eq!(pool.encode_rva(ptr).unwrap(), a.rva);
        pool.dereference(ptr).unwrap();

        assert!(matches!(pool.reference_by_rva(Rva::new(0)), Err(PoolError::InvalidRva(0))));
        assert!(matches!(
            pool.reference_by_rva(Rva::new(5 << 16)),
            Err(PoolError::InvalidRva(_))
        ));
        assert!(matches!(
            pool.dereference(BlockPtr::from_addr(8)),
            Err(PoolError::InvalidAddress(8))
        ));
    }

    #[test]
    fn test_user_context() {
        let (_dir, mut pool) = new_pool(16);
        pool.set_user_context(0x1122_3344_5566_7788).unwrap();
        assert_eq!(pool.user_context(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_clamped_parameters_are_reported() {
        let (_dir, pool) = new_pool(3);
        assert_eq!(pool.geometry().segment_shift, 16);
        assert!(pool.stats().parameters_adjusted);
    }
}
