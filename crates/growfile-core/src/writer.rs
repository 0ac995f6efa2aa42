//! The single writer of a store file.
//!
//! A `Writer` defines named values, fills them in and grows them while any
//! number of readers keep the file mapped. Growth never moves a published
//! block: it relocates through the value's indirection cell (see `cell`).
//!
//! **Borrowing**: `slice` and `slice_mut` hand out slices tied to a
//! `&mut self` borrow. Any call that may allocate or remap takes
//! `&mut self`, so the borrow checker rules out a slice outliving a remap.
//!
//! **Catching up**: calls that follow offsets (cells, reference targets,
//! text, the directory) first remap if the header's `end` has moved past
//! the mapping, which happens when another writer extended the file.

use std::mem::{align_of, size_of};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::alloc::Allocator;
use crate::cell::{self, CellState, BYTES};
use crate::config::Config;
use crate::error::{GrowError, GrowResult};
use crate::format::{
    DirEntry, Kind, Offset, CELL_GENERATION, GENERATION_SIZE, HDR_GENERATION, MAX_NAME_LEN,
    REF_GENERATION, REF_SIZE,
};
use crate::handle::{ArrayHandle, Handle, RawHandle, RawValue, RefHandle, ScalarHandle};
use crate::store::{Generation, Store, StoreStats};
use crate::types::{check_storable, Layout, Storable, TextRef, TypeDesc};

/// Exclusive mutator of one store file.
///
/// Only one writer may be active on a file at a time; this is not enforced.
/// A second writer opened after the first is dropped continues where the
/// first stopped.
pub struct Writer {
    store: Store,
    alloc: Allocator,
    config: Config,
    closed: bool,
}

fn layout_of<T>() -> Layout {
    Layout {
        size: size_of::<T>() as u64,
        align: align_of::<T>() as u64,
    }
}

/// Element layout of an array handle, rejecting zero-sized elements.
fn element_layout(handle: &RawHandle) -> GrowResult<Layout> {
    let layout = handle.element_layout()?;
    if layout.size == 0 {
        return Err(GrowError::InvalidType {
            desc: handle.desc().to_string(),
            reason: "zero-sized elements".into(),
        });
    }
    Ok(layout)
}

fn check_name(name: &str) -> GrowResult<()> {
    if name.is_empty() {
        return Err(GrowError::InvalidName { name: name.to_string(), reason: "empty".into() });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(GrowError::InvalidName {
            name: name.chars().take(32).collect(),
            reason: format!("{} bytes, limit is {}", name.len(), MAX_NAME_LEN),
        });
    }
    Ok(())
}

impl Writer {
    /// Open `path` for writing, creating it if it is missing or empty.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> GrowResult<Self> {
        config.validate().map_err(|reason| GrowError::InvalidConfig { reason })?;
        let alloc = Allocator::new(&config);
        let store = Store::open_writable(path.as_ref(), &config, &alloc)?;
        debug!(
            path = %path.as_ref().display(),
            definitions = store.directory.len(),
            "opened writer"
        );
        Ok(Self {
            store,
            alloc,
            config,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Remap if the file has been extended past the current mapping.
    fn catch_up(&mut self) -> GrowResult<()> {
        if self.store.sync_mapping()? {
            debug!(
                path = %self.store.path().display(),
                len = self.store.region.len(),
                "remapped extended file"
            );
        }
        Ok(())
    }

    /// Define `name` with descriptor `desc`.
    ///
    /// Redefining with the same descriptor returns the existing handle
    /// unchanged; `count` is then ignored. A different descriptor is a
    /// `NameConflict`. `count` sets an array's initial capacity and defaults
    /// to `Config::default_array_capacity`; other kinds ignore it.
    pub fn define_raw(
        &mut self,
        name: &str,
        desc: &TypeDesc,
        count: Option<u64>,
    ) -> GrowResult<RawHandle> {
        check_name(name)?;
        desc.validate()?;
        self.catch_up()?;

        self.store.directory.refresh(&self.store.region)?;
        if let Some(existing) = self.store.directory.get(name) {
            if existing.desc == *desc {
                return Ok(RawHandle::from_entry(existing.clone()));
            }
            return Err(GrowError::NameConflict {
                name: name.to_string(),
                existing: existing.desc.to_string(),
                requested: desc.to_string(),
            });
        }

        let layout = desc.value_layout().ok_or_else(|| GrowError::InvalidType {
            desc: desc.to_string(),
            reason: "no fixed-size value type".into(),
        })?;

        let region = &mut self.store.region;
        let (offset, generation) = match desc.kind() {
            Kind::Scalar => {
                let generation = self.alloc.allocate(region, GENERATION_SIZE, 8)?;
                let slot = self.alloc.allocate(region, layout.size, layout.align)?;
                (slot, generation)
            }
            Kind::Array => {
                let count = count.unwrap_or(self.config.default_array_capacity);
                let cell = cell::allocate_dynamic(region, &self.alloc, layout, count)?;
                (cell, cell.add(CELL_GENERATION))
            }
            Kind::Ref => {
                let slot = self.alloc.allocate(region, REF_SIZE, 8)?;
                (slot, slot.add(REF_GENERATION))
            }
        };

        let entry = DirEntry {
            name: name.to_string(),
            kind: desc.kind(),
            desc: desc.clone(),
            offset,
            generation,
        };
        self.store
            .directory
            .append(&mut self.store.region, &self.alloc, entry.clone())?;
        debug!(name, ty = %desc, kind = entry.kind.name(), offset = %offset, "defined");
        Ok(RawHandle::from_entry(entry))
    }

    /// Resolve `name`, checking it was defined as `desc`.
    pub fn lookup_raw(&mut self, name: &str, desc: &TypeDesc) -> GrowResult<RawHandle> {
        self.store
            .with_remap(|store| store.resolve(name, desc))
            .map(RawHandle::from_entry)
    }

    pub fn define<T: Storable>(&mut self, name: &str) -> GrowResult<ScalarHandle<T>> {
        let desc = T::type_desc();
        check_storable::<T>(&desc)?;
        Ok(ScalarHandle::from_raw(&self.define_raw(name, &desc, None)?))
    }

    pub fn define_array<T: Storable>(
        &mut self,
        name: &str,
        capacity: u64,
    ) -> GrowResult<ArrayHandle<T>> {
        let elem = T::type_desc();
        check_storable::<T>(&elem)?;
        let raw = self.define_raw(name, &TypeDesc::array(elem), Some(capacity))?;
        Ok(ArrayHandle::from_raw(&raw))
    }

    pub fn define_ref<T: Storable>(&mut self, name: &str) -> GrowResult<RefHandle<T>> {
        let target = T::type_desc();
        check_storable::<T>(&target)?;
        let raw = self.define_raw(name, &TypeDesc::reference(target), None)?;
        Ok(RefHandle::from_raw(&raw))
    }

    pub fn lookup<T: Storable>(&mut self, name: &str) -> GrowResult<ScalarHandle<T>> {
        Ok(ScalarHandle::from_raw(&self.lookup_raw(name, &T::type_desc())?))
    }

    pub fn lookup_array<T: Storable>(&mut self, name: &str) -> GrowResult<ArrayHandle<T>> {
        let raw = self.lookup_raw(name, &TypeDesc::array(T::type_desc()))?;
        Ok(ArrayHandle::from_raw(&raw))
    }

    pub fn lookup_ref<T: Storable>(&mut self, name: &str) -> GrowResult<RefHandle<T>> {
        let raw = self.lookup_raw(name, &TypeDesc::reference(T::type_desc()))?;
        Ok(RefHandle::from_raw(&raw))
    }

    /// Every definition, in the order it was made.
    pub fn definitions(&mut self) -> GrowResult<Vec<RawHandle>> {
        let entries = self.store.with_remap(|store| store.entries())?;
        Ok(entries.into_iter().map(RawHandle::from_entry).collect())
    }

    // Scalars

    /// Scalar slots never move, so a handle obtained from this writer is
    /// always inside its mapping.
    pub fn get<T: Storable>(&self, handle: &ScalarHandle<T>) -> GrowResult<T> {
        let bytes = self.store.region.slice(handle.offset(), size_of::<T>() as u64)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn set<T: Storable>(&mut self, handle: &ScalarHandle<T>, value: T) -> GrowResult<()> {
        self.store.region.write(handle.offset(), bytemuck::bytes_of(&value))
    }

    // Arrays

    fn typed_state<T>(&self, cell: Offset) -> GrowResult<CellState> {
        let state = cell::dereference(&self.store.region, cell)?;
        if state.elem_size != size_of::<T>() as u64 {
            return Err(GrowError::corrupt(
                self.store.path(),
                state.target.as_u64(),
                format!(
                    "block holds {}-byte elements, handle expects {}",
                    state.elem_size,
                    size_of::<T>()
                ),
            ));
        }
        Ok(state)
    }

    /// Number of live elements.
    pub fn len<T>(&mut self, handle: &ArrayHandle<T>) -> GrowResult<u64> {
        self.catch_up()?;
        Ok(cell::dereference(&self.store.region, handle.offset())?.length)
    }

    pub fn capacity<T>(&mut self, handle: &ArrayHandle<T>) -> GrowResult<u64> {
        self.catch_up()?;
        Ok(cell::dereference(&self.store.region, handle.offset())?.capacity)
    }

    /// The live elements `[0, length)`.
    pub fn slice<T: Storable>(&mut self, handle: &ArrayHandle<T>) -> GrowResult<&[T]> {
        self.catch_up()?;
        let state = self.typed_state::<T>(handle.offset())?;
        let bytes = self.store.region.slice(state.data(), state.live_bytes())?;
        bytemuck::try_cast_slice(bytes).map_err(|e| {
            GrowError::corrupt(
                self.store.path(),
                state.data().as_u64(),
                format!("unaligned block: {:?}", e),
            )
        })
    }

    /// The whole block `[0, capacity)`, for filling before `set_length`.
    pub fn slice_mut<T: Storable>(&mut self, handle: &ArrayHandle<T>) -> GrowResult<&mut [T]> {
        self.catch_up()?;
        let state = self.typed_state::<T>(handle.offset())?;
        let path = self.store.path().to_path_buf();
        let bytes = self
            .store
            .region
            .slice_mut(state.data(), state.capacity * state.elem_size)?;
        bytemuck::try_cast_slice_mut(bytes).map_err(|e| {
            GrowError::corrupt(path, state.data().as_u64(), format!("unaligned block: {:?}", e))
        })
    }

    /// Grow to `new_capacity` elements. `Ok(false)` if it was already that big.
    pub fn grow<T: Storable>(
        &mut self,
        handle: &ArrayHandle<T>,
        new_capacity: u64,
    ) -> GrowResult<bool> {
        self.grow_cell(handle.offset(), layout_of::<T>(), new_capacity)
    }

    pub fn grow_raw(&mut self, handle: &RawHandle, new_capacity: u64) -> GrowResult<bool> {
        let layout = element_layout(handle)?;
        self.grow_cell(handle.offset(), layout, new_capacity)
    }

    fn grow_cell(&mut self, cell: Offset, layout: Layout, new_capacity: u64) -> GrowResult<bool> {
        self.catch_up()?;
        cell::grow(&mut self.store.region, &self.alloc, cell, layout, new_capacity)
    }

    pub fn set_length<T>(&mut self, handle: &ArrayHandle<T>, length: u64) -> GrowResult<()> {
        self.catch_up()?;
        cell::set_length(&self.store.region, handle.offset(), length)
    }

    pub fn set_length_raw(&mut self, handle: &RawHandle, length: u64) -> GrowResult<()> {
        handle.element_layout()?;
        self.catch_up()?;
        cell::set_length(&self.store.region, handle.offset(), length)
    }

    /// Append one element, doubling capacity when full. Returns the new length.
    pub fn push<T: Storable>(&mut self, handle: &ArrayHandle<T>, value: T) -> GrowResult<u64> {
        self.push_bytes(handle.offset(), layout_of::<T>(), bytemuck::bytes_of(&value), 1)
    }

    fn push_bytes(
        &mut self,
        cell: Offset,
        layout: Layout,
        bytes: &[u8],
        floor: u64,
    ) -> GrowResult<u64> {
        self.catch_up()?;
        let state = cell::dereference(&self.store.region, cell)?;
        if state.length == state.capacity {
            let new_capacity = state.capacity.saturating_mul(2).max(floor).max(state.length + 1);
            cell::grow(&mut self.store.region, &self.alloc, cell, layout, new_capacity)?;
        }
        let state = cell::dereference(&self.store.region, cell)?;
        self.store.region.write(state.data().add(state.length * layout.size), bytes)?;
        cell::set_length(&self.store.region, cell, state.length + 1)?;
        Ok(state.length + 1)
    }

    /// Append one record to an array definition, then mark the value and
    /// the file dirty. Capacity doubles, starting from
    /// `Config::series_initial_capacity`.
    pub fn append_record(&mut self, handle: &RawHandle, record: &[u8]) -> GrowResult<u64> {
        let layout = element_layout(handle)?;
        if record.len() as u64 != layout.size {
            return Err(GrowError::TypeMismatch {
                name: handle.name().to_string(),
                stored: handle.desc().value_type().to_string(),
                requested: format!("a {} byte record", record.len()),
            });
        }
        let floor = self.config.series_initial_capacity;
        let length = self.push_bytes(handle.offset(), layout, record, floor)?;
        self.mark_value_dirty(handle)?;
        self.mark_dirty()?;
        Ok(length)
    }

    /// Append many packed elements at once. Returns the new length.
    pub fn extend_raw(&mut self, handle: &RawHandle, elements: &[u8]) -> GrowResult<u64> {
        let layout = element_layout(handle)?;
        if elements.len() as u64 % layout.size != 0 {
            return Err(GrowError::TypeMismatch {
                name: handle.name().to_string(),
                stored: handle.desc().value_type().to_string(),
                requested: format!("{} bytes, not a whole number of elements", elements.len()),
            });
        }
        let count = elements.len() as u64 / layout.size;
        self.catch_up()?;
        let state = cell::dereference(&self.store.region, handle.offset())?;
        let needed = state.length + count;
        if needed > state.capacity {
            let new_capacity = needed.max(state.capacity.saturating_mul(2));
            cell::grow(
                &mut self.store.region,
                &self.alloc,
                handle.offset(),
                layout,
                new_capacity,
            )?;
        }
        let state = cell::dereference(&self.store.region, handle.offset())?;
        self.store.region.write(state.data().add(state.length * layout.size), elements)?;
        cell::set_length(&self.store.region, handle.offset(), needed)?;
        Ok(needed)
    }

    // References

    /// Point the reference at a fresh copy of `value`. The previous target
    /// is orphaned.
    pub fn store<T: Storable>(&mut self, handle: &RefHandle<T>, value: T) -> GrowResult<()> {
        self.catch_up()?;
        cell::store_ref(
            &mut self.store.region,
            &self.alloc,
            handle.offset(),
            layout_of::<T>(),
            bytemuck::bytes_of(&value),
        )
    }

    pub fn load<T: Storable>(&mut self, handle: &RefHandle<T>) -> GrowResult<Option<T>> {
        self.catch_up()?;
        let bytes = cell::load_ref(&self.store.region, handle.offset(), size_of::<T>() as u64)?;
        Ok(bytes.map(|b| bytemuck::pod_read_unaligned(&b)))
    }

    /// Overwrite a scalar in place or store a reference target from raw bytes.
    pub fn write_raw(&mut self, handle: &RawHandle, value: &[u8]) -> GrowResult<()> {
        let layout = handle.value_layout()?;
        if value.len() as u64 != layout.size {
            return Err(GrowError::TypeMismatch {
                name: handle.name().to_string(),
                stored: handle.desc().value_type().to_string(),
                requested: format!("a {} byte value", value.len()),
            });
        }
        self.catch_up()?;
        match handle.kind() {
            Kind::Scalar => self.store.region.write(handle.offset(), value),
            Kind::Ref => {
                let slot = handle.offset();
                cell::store_ref(&mut self.store.region, &self.alloc, slot, layout, value)
            }
            Kind::Array => Err(GrowError::TypeMismatch {
                name: handle.name().to_string(),
                stored: handle.desc().to_string(),
                requested: "a scalar or reference".into(),
            }),
        }
    }

    pub fn read_raw(&mut self, handle: &RawHandle) -> GrowResult<RawValue> {
        self.catch_up()?;
        self.store.read_raw(handle)
    }

    // Text

    /// Store `text` as a byte array and return a reference to it.
    pub fn store_text(&mut self, text: &str) -> GrowResult<TextRef> {
        let len = text.len() as u64;
        self.catch_up()?;
        let cell = cell::allocate_dynamic(&mut self.store.region, &self.alloc, BYTES, len)?;
        let state = cell::dereference(&self.store.region, cell)?;
        self.store.region.write(state.data(), text.as_bytes())?;
        cell::set_length(&self.store.region, cell, len)?;
        Ok(TextRef::from_cell(cell))
    }

    pub fn read_text(&mut self, text: TextRef) -> GrowResult<String> {
        self.catch_up()?;
        self.store.read_text(text)
    }

    // Change tracking

    /// Bump the file-level generation. Returns the new value.
    pub fn mark_dirty(&self) -> GrowResult<u64> {
        Ok(self.store.region.fetch_add(HDR_GENERATION, 1)? + 1)
    }

    /// Bump one definition's generation. Returns the new value.
    pub fn mark_value_dirty<H: Handle>(&self, handle: &H) -> GrowResult<u64> {
        Ok(self.store.region.fetch_add(handle.generation_offset(), 1)? + 1)
    }

    pub fn generation(&self) -> GrowResult<u64> {
        self.store.file_generation()
    }

    pub fn value_generation<H: Handle>(&self, handle: &H) -> GrowResult<Generation> {
        self.store.generation(handle.generation_offset())
    }

    // Misc

    pub fn stats(&mut self) -> GrowResult<StoreStats> {
        self.catch_up()?;
        self.store.stats()
    }

    /// Whether orphaned space has reached `Config::compaction_trigger_ratio`.
    pub fn needs_compaction(&mut self) -> GrowResult<bool> {
        let stats = self.stats()?;
        let ratio = self.config.compaction_trigger_ratio;
        Ok(stats.orphaned_bytes > 0 && stats.orphaned_ratio() >= ratio)
    }

    /// Address of the mapping. Changes whenever the file is remapped.
    pub fn base_address(&self) -> usize {
        self.store.region.base_address()
    }

    /// Current address of a definition's slot or cell.
    pub fn address<H: Handle>(&self, handle: &H) -> usize {
        self.base_address() + handle.offset().as_u64() as usize
    }

    /// Flush the mapping and durably sync the file.
    pub fn sync(&self) -> GrowResult<()> {
        self.store.region.flush()
    }

    /// Close the writer, syncing first when `Config::sync_on_close` is set.
    pub fn close(mut self) -> GrowResult<()> {
        self.closed = true;
        if self.config.sync_on_close {
            self.sync()?;
        }
        info!(path = %self.path().display(), "closed writer");
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if self.closed || !self.config.sync_on_close {
            return;
        }
        if let Err(e) = self.sync() {
            warn!(path = %self.path().display(), error = %e, "sync on drop failed");
        }
    }
}
