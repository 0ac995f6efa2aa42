//! Append-only record sequences.
//!
//! A `Series<T>` is a dynamic array definition plus the convention that
//! records are only ever appended. Each append marks both the series and
//! the file dirty, so a reader watching either one hears about it.
//!
//! Text fields are stored first with `Writer::store_text` and the returned
//! `TextRef` placed in the record before it is appended.

use std::marker::PhantomData;

use crate::error::GrowResult;
use crate::handle::{ArrayHandle, RawHandle};
use crate::types::{check_storable, Storable, TypeDesc};
use crate::writer::Writer;

pub struct Series<T> {
    handle: RawHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Storable> Series<T> {
    /// Create the series `name`, or reopen it if it already exists with the
    /// same record type.
    pub fn open(writer: &mut Writer, name: &str) -> GrowResult<Self> {
        let record = T::type_desc();
        check_storable::<T>(&record)?;
        let capacity = writer.config().series_initial_capacity;
        let handle = writer.define_raw(name, &TypeDesc::array(record), Some(capacity))?;
        Ok(Self { handle, _marker: PhantomData })
    }

    /// Append one record. Returns the new number of records.
    pub fn append(&self, writer: &mut Writer, record: &T) -> GrowResult<u64> {
        writer.append_record(&self.handle, bytemuck::bytes_of(record))
    }

    pub fn len(&self, writer: &mut Writer) -> GrowResult<u64> {
        writer.len(&self.array())
    }

    pub fn is_empty(&self, writer: &mut Writer) -> GrowResult<bool> {
        Ok(self.len(writer)? == 0)
    }

    /// All records appended so far.
    pub fn records<'w>(&self, writer: &'w mut Writer) -> GrowResult<&'w [T]> {
        writer.slice(&self.array())
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> &RawHandle {
        &self.handle
    }

    /// Typed handle over the same array definition.
    pub fn array(&self) -> ArrayHandle<T> {
        ArrayHandle::from_raw(&self.handle)
    }
}
