//! Thread-safe pool handle
//!
//! [`FilePool`] is single-writer by construction. [`SharedFilePool`] puts it
//! behind a `parking_lot::Mutex` so several threads can use one pool. The
//! copy-in/copy-out helpers never let a transient pointer outlive the lock.

use crate::core::pool::FilePool;
use crate::core::rva::Rva;
use crate::error::Result;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::warn;

/// Cloneable, lockable handle to a [`FilePool`]
#[derive(Clone, Debug)]
pub struct SharedFilePool {
    inner: Arc<Mutex<FilePool>>,
}

impl SharedFilePool {
    pub fn new(pool: FilePool) -> Self {
        SharedFilePool {
            inner: Arc::new(Mutex::new(pool)),
        }
    }

    /// Exclusive access to the pool
    ///
    /// Pointers obtained through the guard must be dereferenced before it is
    /// dropped; another thread may evict their view afterwards.
    pub fn lock(&self) -> MutexGuard<'_, FilePool> {
        self.inner.lock()
    }

    /// Copy `data` into a new allocation
    pub fn store(&self, data: &[u8]) -> Result<Rva> {
        let mut pool = self.inner.lock();
        let allocation = pool.allocate(data.len())?;

        let written = pool
            .bytes_mut(allocation.ptr)
            .map(|bytes| bytes[..data.len()].copy_from_slice(data));
        if let Err(e) = written {
            if let Err(free_error) = pool.free(allocation.ptr) {
                warn!("Could not release {} after failed store: {}", allocation.rva, free_error);
            }
            return Err(e);
        }

        pool.dereference(allocation.ptr)?;
        Ok(allocation.rva)
    }

    /// Copy out the payload at `rva`
    ///
    /// The payload covers whole blocks, so it may be longer than what was
    /// stored.
    pub fn load(&self, rva: Rva) -> Result<Vec<u8>> {
        let mut pool = self.inner.lock();
        let ptr = pool.reference_by_rva(rva)?;
        let payload = pool.bytes(ptr).map(|bytes| bytes.to_vec());
        pool.dereference(ptr)?;
        payload
    }

    /// Free the allocation at `rva`
    pub fn release(&self, rva: Rva) -> Result<()> {
        self.inner.lock().free_by_rva(rva)
    }

    /// Take the pool back once this is the last handle
    pub fn into_inner(self) -> std::result::Result<FilePool, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| SharedFilePool { inner })
    }
}
