//! Reference-counted cache of mapped segment views
//!
//! Every segment is mapped separately. A view moves through:
//! - Active: `ref_count >= 1`
//! - Inactive: `ref_count == 0`, still mapped, on the LRU list
//! - Unmapped: evicted from the tail of the LRU list
//!
//! Views are indexed by segment index and by base address, so a transient
//! pointer into any mapped segment resolves back to its view. Segment 0 holds
//! the file header and must never drop to zero references.

use crate::error::{PoolError, Result};
use crate::io::{Backing, SegmentMap};
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// A mapped segment
struct View {
    map: SegmentMap,
    ref_count: u32,
}

/// View cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// References satisfied by an existing view
    pub hits: u64,
    /// References that had to map the segment
    pub misses: u64,
    /// Inactive views unmapped to respect the inactive limit
    pub evictions: u64,
    /// Views currently mapped
    pub mapped: usize,
    /// Mapped views with no references
    pub inactive: usize,
}

pub struct ViewCache {
    backing: Box<dyn Backing>,
    segment_shift: u32,
    segment_size: usize,
    by_index: HashMap<u32, View>,
    by_base: BTreeMap<usize, u32>,
    /// Inactive views (front = most recently deactivated)
    inactive: LruCache<u32, ()>,
    max_inactive: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ViewCache {
    pub fn new(backing: Box<dyn Backing>, segment_shift: u32, max_inactive: usize) -> Self {
        ViewCache {
            backing,
            segment_shift,
            segment_size: 1usize << segment_shift,
            by_index: HashMap::new(),
            by_base: BTreeMap::new(),
            inactive: LruCache::unbounded(),
            max_inactive,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn backing_mut(&mut self) -> &mut dyn Backing {
        self.backing.as_mut()
    }

    pub fn is_read_only(&self) -> bool {
        self.backing.is_read_only()
    }

    /// Take a reference on a segment, mapping it if needed
    ///
    /// Returns the base address of the view. A mapping failure leaves the
    /// cache unchanged.
    pub fn reference(&mut self, segment_index: u32) -> Result<usize> {
        if let Some(view) = self.by_index.get_mut(&segment_index) {
            if view.ref_count == 0 {
                self.inactive.pop(&segment_index);
            }
            view.ref_count += 1;
            self.hits += 1;
            return Ok(view.map.base());
        }

        let offset = u64::from(segment_index) << self.segment_shift;
        let map = self
            .backing
            .map(offset, self.segment_size)
            .map_err(|source| PoolError::Map {
                segment: segment_index,
                source,
            })?;
        let base = map.base();

        trace!("Mapped segment {} at {:#x}", segment_index, base);
        self.misses += 1;
        self.by_base.insert(base, segment_index);
        self.by_index.insert(segment_index, View { map, ref_count: 1 });

        Ok(base)
    }

    /// Drop a reference on a segment
    ///
    /// # Panics
    ///
    /// If the segment has no view, has no references, or is segment 0 and
    /// would drop to zero references. Each of these means the reference
    /// bookkeeping is corrupt.
    pub fn dereference(&mut self, segment_index: u32) {
        let view = match self.by_index.get_mut(&segment_index) {
            Some(view) => view,
            None => panic!("dereferencing segment {segment_index}, which has no view"),
        };

        if view.ref_count == 0 {
            panic!("segment {segment_index} dereferenced more often than it was referenced");
        }

        view.ref_count -= 1;
        if view.ref_count == 0 {
            if segment_index == 0 {
                panic!("segment 0 is pinned and cannot become inactive");
            }
            self.deactivate(segment_index);
        }
    }

    fn deactivate(&mut self, segment_index: u32) {
        self.inactive.put(segment_index, ());

        while self.inactive.len() > self.max_inactive {
            match self.inactive.pop_lru() {
                Some((lru_index, ())) => self.destroy(lru_index),
                None => break,
            }
        }
    }

    fn destroy(&mut self, segment_index: u32) {
        if let Some(view) = self.by_index.remove(&segment_index) {
            self.by_base.remove(&view.map.base());
            self.evictions += 1;
            trace!("Unmapped segment {}", segment_index);
        }
    }

    /// Segment whose mapped range contains `address`
    pub fn find_view_containing(&self, address: usize) -> Option<u32> {
        let (&base, &segment_index) = self.by_base.range(..=address).next_back()?;
        if address - base < self.segment_size {
            Some(segment_index)
        } else {
            None
        }
    }

    /// Reference the segment containing `address`
    pub fn reference_by_address(&mut self, address: usize) -> Result<u32> {
        let segment_index = self
            .find_view_containing(address)
            .ok_or(PoolError::InvalidAddress(address))?;
        self.reference(segment_index)?;
        Ok(segment_index)
    }

    /// Dereference the segment containing `address`
    ///
    /// Fails without touching any count if no referenced view contains the
    /// address.
    pub fn dereference_by_address(&mut self, address: usize) -> Result<u32> {
        let segment_index = self
            .find_view_containing(address)
            .filter(|index| self.ref_count(*index).unwrap_or(0) > 0)
            .ok_or(PoolError::InvalidAddress(address))?;
        self.dereference(segment_index);
        Ok(segment_index)
    }

    pub fn base(&self, segment_index: u32) -> Option<usize> {
        self.by_index.get(&segment_index).map(|view| view.map.base())
    }

    pub fn ref_count(&self, segment_index: u32) -> Option<u32> {
        self.by_index.get(&segment_index).map(|view| view.ref_count)
    }

    fn view(&self, segment_index: u32) -> &View {
        match self.by_index.get(&segment_index) {
            Some(view) => view,
            None => panic!("segment {segment_index} is not mapped"),
        }
    }

    /// Bytes of a mapped segment
    ///
    /// # Panics
    ///
    /// If the segment is not mapped; callers hold a reference while they
    /// access a segment.
    pub fn segment(&self, segment_index: u32) -> &[u8] {
        self.view(segment_index).map.as_slice()
    }

    /// Mutable bytes of a mapped segment
    ///
    /// # Panics
    ///
    /// If the segment is not mapped.
    pub fn segment_mut(&mut self, segment_index: u32) -> Result<&mut [u8]> {
        let view = match self.by_index.get_mut(&segment_index) {
            Some(view) => view,
            None => panic!("segment {segment_index} is not mapped"),
        };
        view.map.as_mut_slice().ok_or(PoolError::ReadOnly)
    }

    pub fn mapped_views(&self) -> usize {
        self.by_index.len()
    }

    pub fn inactive_views(&self) -> usize {
        self.inactive.len()
    }

    pub fn max_inactive_views(&self) -> usize {
        self.max_inactive
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            mapped: self.by_index.len(),
            inactive: self.inactive.len(),
        }
    }

    /// Write every writable view back to the file
    pub fn flush(&self) -> Result<()> {
        for view in self.by_index.values() {
            view.map.flush()?;
        }
        Ok(())
    }

    /// Unmap every view, referenced or not
    pub fn clear(&mut self) {
        self.inactive.clear();
        self.by_base.clear();
        self.by_index.clear();
    }
}
