//! Store lifecycle: header creation, validation, remapping and shared reads
//!
//! A `Store` pairs a `Region` with the parsed directory. Writers and readers
//! both sit on top of one; only writers ever allocate through it.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::alloc::Allocator;
use crate::cell::{self, CellState, BYTES};
use crate::config::Config;
use crate::directory::Directory;
use crate::error::{GrowError, GrowResult};
use crate::format::{
    DirEntry, Kind, Offset, CELL_SIZE, FORMAT_VERSION, HDR_CREATED_AT, HDR_DIRECTORY, HDR_END,
    HDR_GENERATION, HDR_ORPHANED, HDR_VERSION, HEADER_SIZE, MAGIC_ARRAY,
};
use crate::handle::{Handle, RawHandle, RawValue};
use crate::platform;
use crate::region::Region;
use crate::types::{TextRef, TypeDesc};

/// Space accounting for one store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Current length of the file on disk
    pub file_bytes: u64,
    /// Allocation high-water mark
    pub allocated_bytes: u64,
    /// Bytes held by superseded blocks and reference targets
    pub orphaned_bytes: u64,
    /// Number of named definitions
    pub definitions: usize,
    /// File-level generation
    pub generation: u64,
    /// Creation time, unix seconds
    pub created_at: u64,
}

impl StoreStats {
    /// Orphaned bytes as a fraction of allocated bytes.
    pub fn orphaned_ratio(&self) -> f64 {
        if self.allocated_bytes == 0 {
            return 0.0;
        }
        self.orphaned_bytes as f64 / self.allocated_bytes as f64
    }
}

/// Snapshot of a value's change counters.
///
/// A watch fires when either half moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Generation {
    /// File-level generation, bumped by `Writer::mark_dirty`
    pub file: u64,
    /// The definition's own generation
    pub value: u64,
}

pub(crate) struct Store {
    pub(crate) region: Region,
    pub(crate) directory: Directory,
}

impl Store {
    /// Open `path` for writing, creating and initializing it when it is
    /// missing or empty.
    pub(crate) fn open_writable(
        path: &Path,
        config: &Config,
        alloc: &Allocator,
    ) -> GrowResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| GrowError::io_at(path, e, "Failed to open store for writing"))?;

        let len = file
            .metadata()
            .map_err(|e| GrowError::io_at(path, e, "Failed to stat store"))?
            .len();
        if len == 0 {
            return Self::initialize(file, path, config, alloc);
        }
        Self::open_existing(file, path, len, true)
    }

    pub(crate) fn open_read_only(path: &Path) -> GrowResult<Self> {
        let file = File::open(path)
            .map_err(|e| GrowError::io_at(path, e, "Failed to open store for reading"))?;
        let len = file
            .metadata()
            .map_err(|e| GrowError::io_at(path, e, "Failed to stat store"))?
            .len();
        Self::open_existing(file, path, len, false)
    }

    fn open_existing(mut file: File, path: &Path, len: u64, writable: bool) -> GrowResult<Self> {
        if len < HEADER_SIZE {
            let mut found = [0u8; 4];
            let _ = file.read(&mut found);
            return Err(GrowError::NoMagicFound { path: path.to_path_buf(), found_bytes: found });
        }

        let region = Region::from_file(file, path, writable)?;
        let directory = Directory::new(Self::validate(&region)?);
        let mut store = Self { region, directory };
        store.with_remap(|s| s.directory.refresh(&s.region))?;
        Ok(store)
    }

    fn initialize(file: File, path: &Path, config: &Config, alloc: &Allocator) -> GrowResult<Self> {
        platform::preallocate(&file, config.initial_file_size)
            .map_err(|e| GrowError::io_at(path, e, "Failed to size new store"))?;
        let mut region = Region::from_file(file, path, true)?;

        region.write(HDR_VERSION, &FORMAT_VERSION.to_le_bytes())?;
        region.store(HDR_END, HEADER_SIZE)?;
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        region.store(HDR_CREATED_AT, created_at)?;

        let directory =
            cell::allocate_dynamic(&mut region, alloc, BYTES, config.directory_initial_bytes)?;
        region.store(HDR_DIRECTORY, directory.as_u64())?;

        // Readers refuse the file until the magic is in place
        region.write(Offset::NULL, &MAGIC_ARRAY)?;
        if config.sync_on_close {
            region.flush()?;
        }

        info!(path = %path.display(), size = region.len(), "created store");
        Ok(Self { region, directory: Directory::new(directory) })
    }

    /// Check magic and version; return the directory cell.
    fn validate(region: &Region) -> GrowResult<Offset> {
        let mut magic = [0u8; 4];
        region.read(Offset::NULL, &mut magic)?;
        if magic != MAGIC_ARRAY {
            return Err(GrowError::NoMagicFound {
                path: region.path().to_path_buf(),
                found_bytes: magic,
            });
        }

        let mut version = [0u8; 4];
        region.read(HDR_VERSION, &mut version)?;
        let version = u32::from_le_bytes(version);
        if version != FORMAT_VERSION {
            return Err(GrowError::UnsupportedVersion {
                path: region.path().to_path_buf(),
                found: version,
                expected: FORMAT_VERSION,
            });
        }

        let end = region.load(HDR_END)?;
        if end < HEADER_SIZE {
            return Err(GrowError::corrupt(
                region.path(),
                HDR_END.as_u64(),
                format!("end {} inside header", end),
            ));
        }
        let directory = region.load(HDR_DIRECTORY)?;
        if directory < HEADER_SIZE || directory.saturating_add(CELL_SIZE) > end {
            return Err(GrowError::corrupt(
                region.path(),
                HDR_DIRECTORY.as_u64(),
                format!("directory offset {} outside allocated space", directory),
            ));
        }
        Ok(Offset::new(directory))
    }

    pub(crate) fn path(&self) -> &Path {
        self.region.path()
    }

    /// True when the writer has published allocations past our mapping.
    pub(crate) fn needs_remap(&self) -> GrowResult<bool> {
        Ok(self.region.load(HDR_END)? > self.region.len())
    }

    /// Remap if the header's `end` has moved past the mapping.
    pub(crate) fn sync_mapping(&mut self) -> GrowResult<bool> {
        if !self.needs_remap()? {
            return Ok(false);
        }
        self.region.remap()?;
        let end = self.region.load(HDR_END)?;
        if end > self.region.len() {
            return Err(GrowError::corrupt(
                self.region.path(),
                HDR_END.as_u64(),
                format!("end {} beyond file length {}", end, self.region.len()),
            ));
        }
        Ok(true)
    }

    /// Run `op`, remapping and retrying when it failed because the writer
    /// published something past our mapping while it ran.
    ///
    /// Any offset a reader can observe was allocated before it was
    /// published, so once `end` is re-read the retry can reach it.
    pub(crate) fn with_remap<R>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> GrowResult<R>,
    ) -> GrowResult<R> {
        self.sync_mapping()?;
        loop {
            match op(self) {
                Err(err) if self.sync_mapping()? => {
                    debug!(path = %self.path().display(), error = %err, "retrying after remap");
                }
                result => return result,
            }
        }
    }

    /// Find `name` and check it was stored as `desc`.
    pub(crate) fn resolve(&mut self, name: &str, desc: &TypeDesc) -> GrowResult<DirEntry> {
        self.directory.refresh(&self.region)?;
        let entry = self
            .directory
            .get(name)
            .ok_or_else(|| GrowError::NotFound { name: name.to_string() })?;
        if entry.desc != *desc {
            return Err(GrowError::TypeMismatch {
                name: name.to_string(),
                stored: entry.desc.to_string(),
                requested: desc.to_string(),
            });
        }
        Ok(entry.clone())
    }

    pub(crate) fn entries(&mut self) -> GrowResult<Vec<DirEntry>> {
        self.directory.refresh(&self.region)?;
        Ok(self.directory.iter().cloned().collect())
    }

    pub(crate) fn file_generation(&self) -> GrowResult<u64> {
        self.region.load(HDR_GENERATION)
    }

    pub(crate) fn generation(&self, value_generation: Offset) -> GrowResult<Generation> {
        Ok(Generation {
            file: self.region.load(HDR_GENERATION)?,
            value: self.region.load(value_generation)?,
        })
    }

    pub(crate) fn read_bytes(&self, offset: Offset, len: u64) -> GrowResult<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        self.region.read(offset, &mut out)?;
        Ok(out)
    }

    /// Copy out the live elements of an array cell.
    pub(crate) fn read_elements(
        &self,
        cell: Offset,
        elem_size: u64,
    ) -> GrowResult<(CellState, Vec<u8>)> {
        let state = cell::dereference(&self.region, cell)?;
        if state.elem_size != elem_size {
            return Err(GrowError::corrupt(
                self.region.path(),
                state.target.as_u64(),
                format!("block holds {}-byte elements, expected {}", state.elem_size, elem_size),
            ));
        }
        let bytes = self.read_bytes(state.data(), state.live_bytes())?;
        Ok((state, bytes))
    }

    pub(crate) fn read_raw(&self, handle: &RawHandle) -> GrowResult<RawValue> {
        let layout = handle.value_layout()?;
        match handle.kind() {
            Kind::Scalar => Ok(RawValue::Scalar(self.read_bytes(handle.offset(), layout.size)?)),
            Kind::Array => {
                let (state, elements) = self.read_elements(handle.offset(), layout.size)?;
                Ok(RawValue::Array { capacity: state.capacity, elements })
            }
            Kind::Ref => {
                let value = cell::load_ref(&self.region, handle.offset(), layout.size)?;
                Ok(RawValue::Ref(value))
            }
        }
    }

    pub(crate) fn read_text(&self, text: TextRef) -> GrowResult<String> {
        if text.is_null() {
            return Ok(String::new());
        }
        let (_, bytes) = self.read_elements(text.cell(), 1)?;
        String::from_utf8(bytes).map_err(|_| {
            GrowError::corrupt(self.region.path(), text.cell().as_u64(), "text is not UTF-8")
        })
    }

    pub(crate) fn stats(&mut self) -> GrowResult<StoreStats> {
        self.directory.refresh(&self.region)?;
        let file_bytes = self
            .region
            .file()
            .metadata()
            .map_err(|e| GrowError::io_at(self.region.path(), e, "Failed to stat store"))?
            .len();
        Ok(StoreStats {
            file_bytes,
            allocated_bytes: self.region.load(HDR_END)?,
            orphaned_bytes: self.region.load(HDR_ORPHANED)?,
            definitions: self.directory.len(),
            generation: self.region.load(HDR_GENERATION)?,
            created_at: self.region.load(HDR_CREATED_AT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::embedded();
        config.initial_file_size = 8192;
        config.min_extend_bytes = 4096;
        config.directory_initial_bytes = 256;
        config
    }

    #[test]
    fn test_create_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let config = config();
        let alloc = Allocator::new(&config);

        {
            let store = Store::open_writable(&path, &config, &alloc).unwrap();
            assert_eq!(store.region.len(), 8192);
        }

        let mut reader = Store::open_read_only(&path).unwrap();
        let stats = reader.stats().unwrap();
        assert_eq!(stats.definitions, 0);
        assert_eq!(stats.orphaned_bytes, 0);
        assert!(stats.allocated_bytes > HEADER_SIZE);
        assert!(stats.created_at > 0);
    }

    #[test]
    fn test_empty_file_is_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        std::fs::File::create(&path).unwrap();
        let config = config();
        Store::open_writable(&path, &config, &Allocator::new(&config)).unwrap();
        Store::open_read_only(&path).unwrap();
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.db");
        std::fs::write(&path, vec![0xAB; 128]).unwrap();
        match Store::open_read_only(&path) {
            Err(GrowError::NoMagicFound { found_bytes, .. }) => assert_eq!(found_bytes, [0xAB; 4]),
            other => panic!("expected NoMagicFound, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_short_file_has_no_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.db");
        std::fs::write(&path, b"GR").unwrap();
        assert!(matches!(Store::open_read_only(&path), Err(GrowError::NoMagicFound { .. })));
    }

    #[test]
    fn test_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v2.db");
        let config = config();
        drop(Store::open_writable(&path, &config, &Allocator::new(&config)).unwrap());

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        match Store::open_read_only(&path) {
            Err(GrowError::UnsupportedVersion { found, expected, .. }) => {
                assert_eq!(found, 2);
                assert_eq!(expected, FORMAT_VERSION);
            }
            other => panic!("expected UnsupportedVersion, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_reader_remaps_after_writer_extends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remap.db");
        let config = config();
        let alloc = Allocator::new(&config);
        let mut writer = Store::open_writable(&path, &config, &alloc).unwrap();
        let mut reader = Store::open_read_only(&path).unwrap();
        let before = reader.region.len();

        let far = alloc.allocate(&mut writer.region, 64 * 1024, 8).unwrap();
        writer.region.store(far, 99).unwrap();

        assert!(reader.needs_remap().unwrap());
        assert!(reader.sync_mapping().unwrap());
        assert!(reader.region.len() > before);
        assert_eq!(reader.region.load(far).unwrap(), 99);
    }
}
