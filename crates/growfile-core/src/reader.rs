//! Read-only access with live views.
//!
//! A `Reader` maps the file read-only and never blocks the writer. Every
//! view it hands out re-resolves through the definition's cell on each call
//! and remaps first when the writer has grown the file past the mapping, so
//! a view taken before a grow sees the grown value afterwards.
//!
//! Views copy values out instead of lending slices: a slice into the mapping
//! would pin a mapping the next call may need to replace.

use std::fmt;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::cell;
use crate::error::{GrowError, GrowResult};
use crate::handle::{ArrayHandle, Handle, RawHandle, RawValue, RefHandle, ScalarHandle};
use crate::signal::Watchable;
use crate::store::{Generation, Store, StoreStats};
use crate::types::{decode_elements, Storable, TextRef, TypeDesc};

/// State shared by a reader and every view derived from it.
///
/// `None` once the reader is closed; views then fail with `Closed`.
struct Shared {
    store: RwLock<Option<Store>>,
    path: PathBuf,
}

impl Shared {
    fn closed(&self) -> GrowError {
        GrowError::Closed { path: self.path.clone() }
    }

    /// Run `op` under the read lock, falling back to a remap under the
    /// write lock when the mapping is behind the writer.
    fn read<R>(&self, op: impl Fn(&Store) -> GrowResult<R>) -> GrowResult<R> {
        {
            let guard = self.store.read();
            let store = guard.as_ref().ok_or_else(|| self.closed())?;
            if !store.needs_remap()? {
                match op(store) {
                    Ok(value) => return Ok(value),
                    Err(err) if !store.needs_remap()? => return Err(err),
                    Err(_) => {}
                }
            }
        }
        self.update(|store| op(store))
    }

    fn update<R>(&self, mut op: impl FnMut(&mut Store) -> GrowResult<R>) -> GrowResult<R> {
        let mut guard = self.store.write();
        let store = guard.as_mut().ok_or_else(|| self.closed())?;
        store.with_remap(|s| op(s))
    }
}

/// Read-only handle on a store file.
///
/// Dropping (or closing) the reader unmaps the file. Views obtained from it
/// stay alive but report `GrowError::Closed` from then on.
pub struct Reader {
    shared: Arc<Shared>,
}

impl Reader {
    pub fn open<P: AsRef<Path>>(path: P) -> GrowResult<Self> {
        let path = path.as_ref();
        let store = Store::open_read_only(path)?;
        debug!(path = %path.display(), definitions = store.directory.len(), "opened reader");
        Ok(Self {
            shared: Arc::new(Shared {
                store: RwLock::new(Some(store)),
                path: path.to_path_buf(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Resolve `name`, checking it was defined as `desc`.
    pub fn lookup_raw(&self, name: &str, desc: &TypeDesc) -> GrowResult<RawHandle> {
        self.shared.update(|s| s.resolve(name, desc)).map(RawHandle::from_entry)
    }

    pub fn lookup<T: Storable>(&self, name: &str) -> GrowResult<LiveScalar<T>> {
        let raw = self.lookup_raw(name, &T::type_desc())?;
        Ok(LiveScalar {
            shared: Arc::clone(&self.shared),
            handle: ScalarHandle::from_raw(&raw),
        })
    }

    pub fn lookup_array<T: Storable>(&self, name: &str) -> GrowResult<LiveArray<T>> {
        let raw = self.lookup_raw(name, &TypeDesc::array(T::type_desc()))?;
        Ok(LiveArray {
            shared: Arc::clone(&self.shared),
            handle: ArrayHandle::from_raw(&raw),
        })
    }

    pub fn lookup_ref<T: Storable>(&self, name: &str) -> GrowResult<LiveRef<T>> {
        let raw = self.lookup_raw(name, &TypeDesc::reference(T::type_desc()))?;
        Ok(LiveRef {
            shared: Arc::clone(&self.shared),
            handle: RefHandle::from_raw(&raw),
        })
    }

    /// Live untyped view over a handle from `lookup_raw` or `definitions`.
    pub fn live(&self, handle: &RawHandle) -> LiveRaw {
        LiveRaw {
            shared: Arc::clone(&self.shared),
            handle: handle.clone(),
        }
    }

    /// Every definition, in the order it was made.
    pub fn definitions(&self) -> GrowResult<Vec<RawHandle>> {
        let entries = self.shared.update(|s| s.entries())?;
        Ok(entries.into_iter().map(RawHandle::from_entry).collect())
    }

    pub fn read_raw(&self, handle: &RawHandle) -> GrowResult<RawValue> {
        self.shared.read(|s| s.read_raw(handle))
    }

    pub fn read_text(&self, text: TextRef) -> GrowResult<String> {
        self.shared.read(|s| s.read_text(text))
    }

    /// File-level generation.
    pub fn generation(&self) -> GrowResult<u64> {
        self.shared.read(|s| s.file_generation())
    }

    pub fn stats(&self) -> GrowResult<StoreStats> {
        self.shared.update(|s| s.stats())
    }

    /// Unmap the file. Same as dropping the reader.
    pub fn close(self) {}
}

impl Drop for Reader {
    fn drop(&mut self) {
        if self.shared.store.write().take().is_some() {
            debug!(path = %self.shared.path.display(), "closed reader");
        }
    }
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader").field("path", &self.shared.path).finish()
    }
}

fn check_elem_size<T>(store: &Store, state: &cell::CellState) -> GrowResult<()> {
    if state.elem_size != size_of::<T>() as u64 {
        return Err(GrowError::corrupt(
            store.path(),
            state.target.as_u64(),
            format!(
                "block holds {}-byte elements, view expects {}",
                state.elem_size,
                size_of::<T>()
            ),
        ));
    }
    Ok(())
}

macro_rules! live_view {
    ($(#[$doc:meta])* $name:ident, $handle:ident) => {
        $(#[$doc])*
        pub struct $name<T> {
            shared: Arc<Shared>,
            handle: $handle<T>,
        }

        impl<T> $name<T> {
            pub fn handle(&self) -> $handle<T> {
                self.handle
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self {
                    shared: Arc::clone(&self.shared),
                    handle: self.handle,
                }
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("path", &self.shared.path)
                    .field("handle", &self.handle)
                    .finish()
            }
        }

        impl<T> Watchable for $name<T> {
            fn generation(&self) -> GrowResult<Generation> {
                self.shared.read(|s| s.generation(self.handle.generation_offset()))
            }
        }
    };
}

live_view!(
    /// Live view of a scalar.
    LiveScalar,
    ScalarHandle
);

live_view!(
    /// Live view of a dynamic array.
    LiveArray,
    ArrayHandle
);

live_view!(
    /// Live view of a stored reference.
    LiveRef,
    RefHandle
);

impl<T: Storable> LiveScalar<T> {
    pub fn get(&self) -> GrowResult<T> {
        self.shared.read(|s| {
            let bytes = s.read_bytes(self.handle.offset(), size_of::<T>() as u64)?;
            Ok(bytemuck::pod_read_unaligned(&bytes))
        })
    }
}

impl<T: Storable> LiveArray<T> {
    pub fn len(&self) -> GrowResult<u64> {
        self.shared.read(|s| Ok(cell::dereference(&s.region, self.handle.offset())?.length))
    }

    pub fn is_empty(&self) -> GrowResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> GrowResult<u64> {
        self.shared.read(|s| Ok(cell::dereference(&s.region, self.handle.offset())?.capacity))
    }

    /// Element `index`, or `None` past the live length.
    pub fn get(&self, index: u64) -> GrowResult<Option<T>> {
        self.shared.read(|s| {
            let state = cell::dereference(&s.region, self.handle.offset())?;
            check_elem_size::<T>(s, &state)?;
            if index >= state.length {
                return Ok(None);
            }
            let size = size_of::<T>() as u64;
            let bytes = s.read_bytes(state.data().add(index * size), size)?;
            Ok(Some(bytemuck::pod_read_unaligned(&bytes)))
        })
    }

    /// Copy of the live elements.
    pub fn to_vec(&self) -> GrowResult<Vec<T>> {
        self.shared.read(|s| {
            let (_, bytes) = s.read_elements(self.handle.offset(), size_of::<T>() as u64)?;
            Ok(decode_elements(&bytes))
        })
    }

    /// Resolve a text field of one of the elements.
    pub fn read_text(&self, text: TextRef) -> GrowResult<String> {
        self.shared.read(|s| s.read_text(text))
    }
}

impl<T: Storable> LiveRef<T> {
    /// The current target, or `None` if nothing was stored yet.
    pub fn load(&self) -> GrowResult<Option<T>> {
        self.shared.read(|s| {
            let bytes = cell::load_ref(&s.region, self.handle.offset(), size_of::<T>() as u64)?;
            Ok(bytes.map(|b| bytemuck::pod_read_unaligned(&b)))
        })
    }
}

/// Live untyped view, for callers that only have a descriptor.
#[derive(Clone)]
pub struct LiveRaw {
    shared: Arc<Shared>,
    handle: RawHandle,
}

impl LiveRaw {
    pub fn handle(&self) -> &RawHandle {
        &self.handle
    }

    pub fn read(&self) -> GrowResult<RawValue> {
        self.shared.read(|s| s.read_raw(&self.handle))
    }
}

impl fmt::Debug for LiveRaw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveRaw")
            .field("path", &self.shared.path)
            .field("name", &self.handle.name())
            .finish()
    }
}

impl Watchable for LiveRaw {
    fn generation(&self) -> GrowResult<Generation> {
        self.shared.read(|s| s.generation(self.handle.generation_offset()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::writer::Writer;

    fn config() -> Config {
        let mut config = Config::embedded();
        config.initial_file_size = 8192;
        config.min_extend_bytes = 4096;
        config.directory_initial_bytes = 256;
        config
    }

    #[test]
    fn test_reader_sees_writer_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.db");
        let mut w = Writer::open(&path, config()).unwrap();
        let n = w.define::<i32>("n").unwrap();
        w.set(&n, 12).unwrap();

        let r = Reader::open(&path).unwrap();
        let live = r.lookup::<i32>("n").unwrap();
        assert_eq!(live.get().unwrap(), 12);
        w.set(&n, 13).unwrap();
        assert_eq!(live.get().unwrap(), 13);
    }

    #[test]
    fn test_reader_sees_definitions_made_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.db");
        let mut w = Writer::open(&path, config()).unwrap();
        let r = Reader::open(&path).unwrap();
        assert!(matches!(r.lookup::<u8>("later"), Err(GrowError::NotFound { .. })));

        // Enough definitions to grow the directory and extend the file
        for i in 0..200 {
            w.define_array::<u64>(&format!("a{}", i), 8).unwrap();
        }
        let h = w.define::<u8>("later").unwrap();
        w.set(&h, 1).unwrap();

        assert_eq!(r.lookup::<u8>("later").unwrap().get().unwrap(), 1);
        assert_eq!(r.definitions().unwrap().len(), 201);
        assert_eq!(r.stats().unwrap().definitions, 201);
    }

    #[test]
    fn test_views_fail_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.db");
        let mut w = Writer::open(&path, config()).unwrap();
        w.define_array::<i32>("vs", 4).unwrap();

        let r = Reader::open(&path).unwrap();
        let vs = r.lookup_array::<i32>("vs").unwrap();
        assert_eq!(vs.len().unwrap(), 0);
        r.close();
        assert!(matches!(vs.len(), Err(GrowError::Closed { .. })));
        assert!(matches!(vs.generation(), Err(GrowError::Closed { .. })));
    }

    #[test]
    fn test_array_get_and_refs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arr.db");
        let mut w = Writer::open(&path, config()).unwrap();
        let a = w.define_array::<f32>("fs", 2).unwrap();
        w.push(&a, 0.5).unwrap();
        w.push(&a, 1.5).unwrap();
        let p = w.define_ref::<u32>("p").unwrap();

        let r = Reader::open(&path).unwrap();
        let fs = r.lookup_array::<f32>("fs").unwrap();
        assert_eq!(fs.get(1).unwrap(), Some(1.5));
        assert_eq!(fs.get(2).unwrap(), None);

        let live_p = r.lookup_ref::<u32>("p").unwrap();
        assert_eq!(live_p.load().unwrap(), None);
        w.store(&p, 77).unwrap();
        assert_eq!(live_p.load().unwrap(), Some(77));
    }

    #[test]
    fn test_reader_type_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("types.db");
        let mut w = Writer::open(&path, config()).unwrap();
        w.define_array::<i32>("vs", 4).unwrap();
        let r = Reader::open(&path).unwrap();
        assert!(matches!(r.lookup_array::<i64>("vs"), Err(GrowError::TypeMismatch { .. })));
        assert!(matches!(r.lookup::<i32>("nope"), Err(GrowError::NotFound { .. })));
    }
}
