//! Handles naming definitions
//!
//! A handle is a resolved directory entry: the definition's offset and the
//! offset of its generation word. It holds no pointer, so it stays valid
//! across any number of remaps and relocations.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{GrowError, GrowResult};
use crate::format::{DirEntry, Kind, Offset};
use crate::types::{Layout, TypeDesc};

mod sealed {
    pub trait Sealed {}
}

/// Anything naming a definition in a store.
pub trait Handle: sealed::Sealed {
    /// Scalar slot, array cell or reference slot.
    fn offset(&self) -> Offset;

    /// The definition's generation word.
    fn generation_offset(&self) -> Offset;
}

/// Untyped handle carrying the stored descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHandle {
    entry: DirEntry,
}

impl RawHandle {
    pub(crate) fn from_entry(entry: DirEntry) -> Self {
        Self { entry }
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn desc(&self) -> &TypeDesc {
        &self.entry.desc
    }

    pub fn kind(&self) -> Kind {
        self.entry.kind
    }

    /// Layout of the fixed-size value the definition holds (element for
    /// arrays, target for references).
    pub fn value_layout(&self) -> GrowResult<Layout> {
        self.entry.desc.value_layout().ok_or_else(|| GrowError::InvalidType {
            desc: self.entry.desc.to_string(),
            reason: "no fixed-size value type".into(),
        })
    }

    /// Layout of an array's elements; `TypeMismatch` for other kinds.
    pub(crate) fn element_layout(&self) -> GrowResult<Layout> {
        if self.entry.kind != Kind::Array {
            return Err(GrowError::TypeMismatch {
                name: self.entry.name.clone(),
                stored: self.entry.desc.to_string(),
                requested: "an array".into(),
            });
        }
        self.value_layout()
    }
}

impl sealed::Sealed for RawHandle {}

impl Handle for RawHandle {
    fn offset(&self) -> Offset {
        self.entry.offset
    }

    fn generation_offset(&self) -> Offset {
        self.entry.generation
    }
}

macro_rules! typed_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<T> {
            offset: Offset,
            generation: Offset,
            _marker: PhantomData<fn() -> T>,
        }

        impl<T> $name<T> {
            pub(crate) fn from_raw(raw: &RawHandle) -> Self {
                Self {
                    offset: raw.entry.offset,
                    generation: raw.entry.generation,
                    _marker: PhantomData,
                }
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> Copy for $name<T> {}

        impl<T> PartialEq for $name<T> {
            fn eq(&self, other: &Self) -> bool {
                self.offset == other.offset
            }
        }

        impl<T> Eq for $name<T> {}

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("type", &std::any::type_name::<T>())
                    .field("offset", &self.offset)
                    .finish()
            }
        }

        impl<T> sealed::Sealed for $name<T> {}

        impl<T> Handle for $name<T> {
            fn offset(&self) -> Offset {
                self.offset
            }

            fn generation_offset(&self) -> Offset {
                self.generation
            }
        }
    };
}

typed_handle!(
    /// Fixed-size value stored in place.
    ScalarHandle
);

typed_handle!(
    /// Dynamic array behind an indirection cell.
    ArrayHandle
);

typed_handle!(
    /// Single stored reference.
    RefHandle
);

/// A definition's current value, copied out of the mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Scalar(Vec<u8>),
    /// Live elements only; `capacity` is in elements
    Array { capacity: u64, elements: Vec<u8> },
    /// `None` until the first store
    Ref(Option<Vec<u8>>),
}
