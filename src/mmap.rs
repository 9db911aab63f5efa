//! File-backed convenience wrapper around [`Ring`], behind the `mmap`
//! feature.
//!
//! Unmapping happens deterministically when the value is dropped (an
//! explicit scoped resource), not via a garbage-collector finalizer.

use std::fs::{File, OpenOptions};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{Result, RingError};
use crate::ring::Ring;

/// A [`Ring`] backed by a memory-mapped file.
///
/// `file` is kept alive alongside the mapping for the lifetime of the ring,
/// even though nothing reads from it directly after the initial mapping —
/// dropping it early would be a correctness hazard on platforms that tie
/// mapping lifetime to the originating descriptor.
pub struct MappedRing {
    ring: Ring<MmapMut>,
    file: File,
}

fn to_invalid_length(err: io::Error) -> RingError {
    RingError::InvalidLength(match err.kind() {
        io::ErrorKind::NotFound => "backing file not found",
        _ => "I/O error opening or sizing the backing file",
    })
}

impl MappedRing {
    /// Opens (creating if necessary) the file at `path`, sizing it to
    /// `region_size` bytes if newly created, mapping it, and binding a
    /// [`Ring`] over the mapping with `index_size` index slots.
    ///
    /// An existing file of the wrong size is rejected rather than silently
    /// truncated or extended, since that would discard or corrupt live
    /// packet data.
    pub fn create<P: AsRef<Path>>(path: P, region_size: usize, index_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(to_invalid_length)?;

        let len = file.metadata().map_err(to_invalid_length)?.len();
        if len == 0 {
            file.set_len(region_size as u64).map_err(to_invalid_length)?;
        } else if len != region_size as u64 {
            return Err(RingError::InvalidLength(
                "backing file exists with a different region size",
            ));
        }

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(to_invalid_length)? };
        let ring = Ring::bind(mmap, index_size)?;

        Ok(MappedRing { ring, file })
    }

    /// Opens an existing, already-sized backing file. Fails if the file
    /// doesn't exist or its length doesn't match `region_size`.
    pub fn open<P: AsRef<Path>>(path: P, region_size: usize, index_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(to_invalid_length)?;

        let len = file.metadata().map_err(to_invalid_length)?.len();
        if len != region_size as u64 {
            return Err(RingError::InvalidLength(
                "backing file size does not match the requested region size",
            ));
        }

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(to_invalid_length)? };
        let ring = Ring::bind(mmap, index_size)?;

        Ok(MappedRing { ring, file })
    }

    /// Flushes outstanding writes to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.ring.region().flush().map_err(to_invalid_length)
    }
}

impl Deref for MappedRing {
    type Target = Ring<MmapMut>;

    fn deref(&self) -> &Self::Target {
        &self.ring
    }
}

impl DerefMut for MappedRing {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ring
    }
}

impl Drop for MappedRing {
    fn drop(&mut self) {
        log::debug!("unmapping ring file {:?}", self.file.metadata().ok());
        // The mapping and file both drop here, in field declaration order:
        // the mapping unmaps first, then the descriptor closes.
    }
}
