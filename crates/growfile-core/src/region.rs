//! Memory-mapped view of a store file
//!
//! `Region` owns the file handle and its current mapping. Every access takes
//! an `Offset` and is bounds-checked against the mapping, so a stale or
//! corrupt offset turns into a `Corruption` error rather than a wild read.
//! Remapping replaces the mapping in place; offsets stay valid across it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapOptions, MmapRaw};
use tracing::debug;

use crate::error::{GrowError, GrowResult};
use crate::format::Offset;
use crate::platform;

pub(crate) struct Region {
    file: File,
    map: MmapRaw,
    path: PathBuf,
    writable: bool,
}

impl Region {
    /// Map the whole of `file`. The file must already be non-empty.
    pub(crate) fn from_file(file: File, path: &Path, writable: bool) -> GrowResult<Self> {
        let len = file
            .metadata()
            .map_err(|e| GrowError::io_at(path, e, "Failed to stat store"))?
            .len();
        let map = Self::map(&file, path, len, writable)?;
        Ok(Self {
            file,
            map,
            path: path.to_path_buf(),
            writable,
        })
    }

    fn map(file: &File, path: &Path, len: u64, writable: bool) -> GrowResult<MmapRaw> {
        let len = usize::try_from(len).map_err(|_| GrowError::CapacityExceeded {
            path: path.to_path_buf(),
            requested_bytes: len,
            limit_bytes: usize::MAX as u64,
        })?;
        let mut options = MmapOptions::new();
        options.len(len);
        let mapped = if writable {
            options.map_raw(file)
        } else {
            options.map_raw_read_only(file)
        };
        mapped.map_err(|e| GrowError::io_at(path, e, "Failed to map store"))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// Bytes currently mapped.
    pub(crate) fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub(crate) fn base_address(&self) -> usize {
        self.map.as_ptr() as usize
    }

    /// Replace the mapping with one covering the file's current length.
    pub(crate) fn remap(&mut self) -> GrowResult<()> {
        let len = self
            .file
            .metadata()
            .map_err(|e| GrowError::io_at(&self.path, e, "Failed to stat store"))?
            .len();
        if len == self.len() {
            return Ok(());
        }
        let old_len = self.len();
        self.map = Self::map(&self.file, &self.path, len, self.writable)?;
        debug!(path = %self.path.display(), old_len, new_len = len, "remapped store");
        Ok(())
    }

    /// Extend the file to at least `len` bytes. Never shrinks; the caller remaps.
    pub(crate) fn extend_file(&mut self, len: u64) -> std::io::Result<()> {
        platform::preallocate(&self.file, len)
    }

    fn check(&self, offset: Offset, len: u64) -> GrowResult<usize> {
        let end = offset.as_u64().checked_add(len);
        match end {
            Some(end) if end <= self.len() => Ok(offset.as_u64() as usize),
            _ => Err(GrowError::corrupt(
                &self.path,
                offset.as_u64(),
                format!("{} byte access beyond mapping of {} bytes", len, self.len()),
            )),
        }
    }

    fn check_writable(&self) -> GrowResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(GrowError::Io {
                path: Some(self.path.clone()),
                kind: std::io::ErrorKind::PermissionDenied,
                message: "store is mapped read-only".into(),
            })
        }
    }

    fn word(&self, offset: Offset) -> GrowResult<&AtomicU64> {
        let start = self.check(offset, 8)?;
        if start % 8 != 0 {
            return Err(GrowError::corrupt(&self.path, offset.as_u64(), "misaligned word"));
        }
        // SAFETY: in bounds and 8-aligned (the mapping itself is page aligned).
        // The mapping lives as long as `&self`.
        Ok(unsafe { &*(self.map.as_ptr().add(start) as *const AtomicU64) })
    }

    /// Acquire-load a u64 word.
    pub(crate) fn load(&self, offset: Offset) -> GrowResult<u64> {
        Ok(self.word(offset)?.load(Ordering::Acquire))
    }

    /// Release-store a u64 word.
    pub(crate) fn store(&self, offset: Offset, value: u64) -> GrowResult<()> {
        self.check_writable()?;
        self.word(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Atomically add to a u64 word, returning the previous value.
    pub(crate) fn fetch_add(&self, offset: Offset, delta: u64) -> GrowResult<u64> {
        self.check_writable()?;
        Ok(self.word(offset)?.fetch_add(delta, Ordering::AcqRel))
    }

    /// Copy bytes out of the mapping.
    pub(crate) fn read(&self, offset: Offset, dst: &mut [u8]) -> GrowResult<()> {
        let start = self.check(offset, dst.len() as u64)?;
        // SAFETY: source range checked above; `dst` is a distinct Rust buffer.
        unsafe {
            ptr::copy_nonoverlapping(self.map.as_ptr().add(start), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy bytes into the mapping.
    pub(crate) fn write(&mut self, offset: Offset, src: &[u8]) -> GrowResult<()> {
        self.check_writable()?;
        let start = self.check(offset, src.len() as u64)?;
        // SAFETY: destination range checked above; `&mut self` rules out
        // outstanding slices into the mapping.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.map.as_mut_ptr().add(start), src.len());
        }
        Ok(())
    }

    /// Copy `len` bytes between two ranges of the mapping.
    pub(crate) fn copy_within(&mut self, from: Offset, to: Offset, len: u64) -> GrowResult<()> {
        self.check_writable()?;
        let src = self.check(from, len)?;
        let dst = self.check(to, len)?;
        // SAFETY: both ranges checked; `ptr::copy` tolerates overlap.
        unsafe {
            let base = self.map.as_mut_ptr();
            ptr::copy(base.add(src), base.add(dst), len as usize);
        }
        Ok(())
    }

    pub(crate) fn fill_zero(&mut self, offset: Offset, len: u64) -> GrowResult<()> {
        self.check_writable()?;
        let start = self.check(offset, len)?;
        // SAFETY: range checked above.
        unsafe {
            ptr::write_bytes(self.map.as_mut_ptr().add(start), 0, len as usize);
        }
        Ok(())
    }

    /// Borrow mapped bytes. The borrow pins the mapping: no remap can happen
    /// while it lives.
    pub(crate) fn slice(&self, offset: Offset, len: u64) -> GrowResult<&[u8]> {
        let start = self.check(offset, len)?;
        // SAFETY: range checked; lifetime tied to `&self`.
        Ok(unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(start), len as usize) })
    }

    pub(crate) fn slice_mut(&mut self, offset: Offset, len: u64) -> GrowResult<&mut [u8]> {
        self.check_writable()?;
        let start = self.check(offset, len)?;
        // SAFETY: range checked; `&mut self` makes the borrow exclusive.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.map.as_mut_ptr().add(start), len as usize)
        })
    }

    /// Flush dirty pages and durably sync the file.
    pub(crate) fn flush(&self) -> GrowResult<()> {
        self.check_writable()?;
        self.map
            .flush()
            .map_err(|e| GrowError::io_at(&self.path, e, "Failed to flush mapping"))?;
        platform::durable_sync(&self.file)
            .map_err(|e| GrowError::io_at(&self.path, e, "Failed to sync store"))
    }
}
