//! Root directory of named definitions
//!
//! The directory is a byte array behind an ordinary cell, grown with the
//! same relocation protocol as user arrays. Entries are append-only and
//! self-delimiting, so both sides keep a parse cursor and only decode what
//! was appended since the last refresh.

use hashbrown::HashMap;
use tracing::debug;

use crate::alloc::Allocator;
use crate::cell::{self, BYTES};
use crate::error::{GrowError, GrowResult};
use crate::format::{DirEntry, Offset, CELL_GENERATION};
use crate::region::Region;

pub(crate) struct Directory {
    cell: Offset,
    entries: HashMap<String, DirEntry>,
    order: Vec<String>,
    parsed: u64,
}

impl Directory {
    pub(crate) fn new(cell: Offset) -> Self {
        Self {
            cell,
            entries: HashMap::new(),
            order: Vec::new(),
            parsed: 0,
        }
    }

    /// Decode entries appended since the last refresh.
    pub(crate) fn refresh(&mut self, region: &Region) -> GrowResult<()> {
        let state = cell::dereference(region, self.cell)?;
        if state.length < self.parsed {
            return Err(GrowError::corrupt(
                region.path(),
                self.cell.as_u64(),
                format!("directory shrank from {} to {} bytes", self.parsed, state.length),
            ));
        }
        if state.length == self.parsed {
            return Ok(());
        }

        let mut buf = vec![0u8; (state.length - self.parsed) as usize];
        region.read(state.data().add(self.parsed), &mut buf)?;

        let mut pos = 0usize;
        while pos < buf.len() {
            let at = state.data().as_u64() + self.parsed + pos as u64;
            let (entry, used) = DirEntry::from_bytes(&buf[pos..])
                .map_err(|reason| GrowError::corrupt(region.path(), at, reason))?;
            self.insert(region, at, entry)?;
            pos += used;
        }
        self.parsed = state.length;
        Ok(())
    }

    fn insert(&mut self, region: &Region, at: u64, entry: DirEntry) -> GrowResult<()> {
        if let Some(existing) = self.entries.get(&entry.name) {
            if *existing == entry {
                return Ok(());
            }
            return Err(GrowError::corrupt(
                region.path(),
                at,
                format!("duplicate definition '{}'", entry.name),
            ));
        }
        self.order.push(entry.name.clone());
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<&DirEntry> {
        self.entries.get(name)
    }

    /// Entries in definition order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.order.iter().filter_map(|name| self.entries.get(name))
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Append an entry, growing the directory by doubling when full.
    ///
    /// The entry bytes land before the length that covers them is published.
    pub(crate) fn append(
        &mut self,
        region: &mut Region,
        alloc: &Allocator,
        entry: DirEntry,
    ) -> GrowResult<()> {
        self.refresh(region)?;
        let bytes = entry.to_bytes();

        let state = cell::dereference(region, self.cell)?;
        let needed = state.length + bytes.len() as u64;
        if needed > state.capacity {
            let new_capacity = needed.max(state.capacity.saturating_mul(2));
            cell::grow(region, alloc, self.cell, BYTES, new_capacity)?;
            debug!(entries = self.order.len(), capacity = new_capacity, "grew directory");
        }

        let state = cell::dereference(region, self.cell)?;
        region.write(state.data().add(state.length), &bytes)?;
        cell::set_length(region, self.cell, needed)?;
        region.fetch_add(self.cell.add(CELL_GENERATION), 1)?;

        let at = state.data().as_u64() + state.length;
        self.parsed = needed;
        self.insert(region, at, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::format::{Kind, HDR_END, HEADER_SIZE};
    use crate::types::{Storable, TypeDesc};
    use std::fs::OpenOptions;

    fn fresh(dir: &tempfile::TempDir) -> (Region, Allocator, Offset) {
        let path = dir.path().join("dir.db");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(16 * 1024).unwrap();
        let mut region = Region::from_file(file, &path, true).unwrap();
        region.store(HDR_END, HEADER_SIZE).unwrap();
        let alloc = Allocator::new(&Config::embedded());
        // Small so appends force relocation
        let cell = cell::allocate_dynamic(&mut region, &alloc, BYTES, 64).unwrap();
        (region, alloc, cell)
    }

    fn entry(name: &str, offset: u64) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            kind: Kind::Scalar,
            desc: i64::type_desc(),
            offset: Offset::new(offset),
            generation: Offset::new(offset - 8),
        }
    }

    #[test]
    fn test_append_grows_and_second_view_catches_up() {
        let dir = tempfile::tempdir().unwrap();
        let (mut region, alloc, cell) = fresh(&dir);
        let mut writer_view = Directory::new(cell);

        for i in 0..50u64 {
            let next = entry(&format!("value_{}", i), 1024 + i * 16);
            writer_view.append(&mut region, &alloc, next).unwrap();
        }
        assert_eq!(writer_view.len(), 50);

        let mut reader_view = Directory::new(cell);
        reader_view.refresh(&region).unwrap();
        assert_eq!(reader_view.len(), 50);
        assert_eq!(reader_view.get("value_49").unwrap().offset, Offset::new(1024 + 49 * 16));
        let names: Vec<&str> = reader_view.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names[0], "value_0");
        assert_eq!(names[49], "value_49");

        writer_view.append(&mut region, &alloc, entry("late", 4096)).unwrap();
        reader_view.refresh(&region).unwrap();
        assert!(reader_view.get("late").is_some());
    }

    #[test]
    fn test_corrupt_entry_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut region, alloc, cell) = fresh(&dir);
        let mut view = Directory::new(cell);
        view.append(&mut region, &alloc, entry("x", 1024)).unwrap();

        let state = cell::dereference(&region, cell).unwrap();
        let mut byte = [0u8; 1];
        region.read(state.data().add(33), &mut byte).unwrap();
        region.write(state.data().add(33), &[byte[0] ^ 0xFF]).unwrap();

        let mut fresh_view = Directory::new(cell);
        assert!(matches!(fresh_view.refresh(&region), Err(GrowError::Corruption { .. })));
    }

    #[test]
    fn test_array_entries_keep_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let (mut region, alloc, cell) = fresh(&dir);
        let mut view = Directory::new(cell);
        let mut e = entry("vs", 2048);
        e.kind = Kind::Array;
        e.desc = TypeDesc::array(i32::type_desc());
        view.append(&mut region, &alloc, e.clone()).unwrap();

        let mut other = Directory::new(cell);
        other.refresh(&region).unwrap();
        assert_eq!(other.get("vs"), Some(&e));
    }
}
