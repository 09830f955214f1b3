//! Backing storage for a pool
//!
//! The allocator never touches the file directly; it asks a [`Backing`] for
//! the current length, to grow, and to map a byte range. [`FileBacking`] is
//! the memory-mapped file implementation.

use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// A mapped byte range of the backing storage
pub enum SegmentMap {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl SegmentMap {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            SegmentMap::ReadOnly(map) => &map[..],
            SegmentMap::ReadWrite(map) => &map[..],
        }
    }

    /// Mutable access, or `None` for a read-only mapping
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            SegmentMap::ReadOnly(_) => None,
            SegmentMap::ReadWrite(map) => Some(&mut map[..]),
        }
    }

    /// Address of the first mapped byte
    pub fn base(&self) -> usize {
        self.as_slice().as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> io::Result<()> {
        match self {
            SegmentMap::ReadOnly(_) => Ok(()),
            SegmentMap::ReadWrite(map) => map.flush(),
        }
    }
}

/// OS primitives the pool is built on
pub trait Backing: Send {
    /// Current size of the storage in bytes
    fn len(&self) -> io::Result<u64>;

    /// Grow the storage to `new_len` bytes; existing mappings stay valid
    fn grow(&mut self, new_len: u64) -> io::Result<()>;

    /// Map `len` bytes starting at `offset`
    fn map(&self, offset: u64, len: usize) -> io::Result<SegmentMap>;

    fn is_read_only(&self) -> bool;
}

/// Pool storage backed by a regular file
pub struct FileBacking {
    file: File,
    path: Option<PathBuf>,
    read_only: bool,
}

impl FileBacking {
    /// Wrap an already opened file
    pub fn new(file: File, read_only: bool) -> Self {
        FileBacking {
            file,
            path: None,
            read_only,
        }
    }

    /// Open (and for writable pools, create) the file at `path`
    ///
    /// Returns the backing and whether the file was created by this call.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> io::Result<(Self, bool)> {
        let path = path.as_ref();
        let existed = path.exists();

        let file = if read_only {
            OpenOptions::new().read(true).open(path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?
        };

        Ok((
            FileBacking {
                file,
                path: Some(path.to_path_buf()),
                read_only,
            },
            !existed,
        ))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Backing for FileBacking {
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn grow(&mut self, new_len: u64) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "backing file is read-only",
            ));
        }
        if new_len > self.len()? {
            self.file.set_len(new_len)?;
        }
        Ok(())
    }

    fn map(&self, offset: u64, len: usize) -> io::Result<SegmentMap> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "range overflows"))?;
        if end > self.len()? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {offset}..{end} lies beyond the end of the file"),
            ));
        }

        let mut options = MmapOptions::new();
        options.offset(offset).len(len);

        // The file is never truncated while mapped.
        unsafe {
            if self.read_only {
                Ok(SegmentMap::ReadOnly(options.map(&self.file)?))
            } else {
                Ok(SegmentMap::ReadWrite(options.map_mut(&self.file)?))
            }
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
