//! Growfile Core: growable memory-mapped store
//!
//! A single file that one writer and any number of readers map at the same
//! time. The writer may grow any dynamic value it has defined; readers keep
//! working through the growth without locks and without stale pointers.
//!
//! # Architecture
//!
//! - **Offsets, not pointers**: everything stored is addressed relative to
//!   the start of the mapping, so remapping at a new address changes nothing
//! - **Indirection cells**: a dynamic value is named by a fixed cell whose
//!   target is swung to a fresh block on growth; old blocks are orphaned,
//!   never reused
//! - **Live views**: readers re-resolve through the cell on every access and
//!   remap on their own when the file has grown past their mapping
//! - **Polling signals**: generation counters let readers detect changes
//!   from their own event loop
//!
//! # Example
//!
//! ```no_run
//! use growfile_core::{Config, Reader, Writer};
//!
//! # fn main() -> growfile_core::GrowResult<()> {
//! let mut writer = Writer::open("/tmp/points.gf", Config::desktop())?;
//! let xs = writer.define_array::<f64>("xs", 16)?;
//! writer.push(&xs, 1.5)?;
//!
//! let reader = Reader::open("/tmp/points.gf")?;
//! let live = reader.lookup_array::<f64>("xs")?;
//! writer.push(&xs, 2.5)?;
//! assert_eq!(live.to_vec()?, vec![1.5, 2.5]);
//! # Ok(())
//! # }
//! ```

mod alloc;
mod cell;
mod directory;
mod region;
mod store;

pub mod config;
pub mod error;
pub mod format;
pub mod handle;
pub mod platform;
pub mod publish;
pub mod reader;
pub mod series;
pub mod signal;
pub mod types;
pub mod writer;

// Re-export key types for convenience
pub use config::Config;
pub use error::{GrowError, GrowResult};
pub use format::{Kind, Offset};
pub use handle::{ArrayHandle, Handle, RawHandle, RawValue, RefHandle, ScalarHandle};
pub use publish::{create_unique, publish};
pub use reader::{LiveArray, LiveRaw, LiveRef, LiveScalar, Reader};
pub use series::Series;
pub use signal::{SignalRegistry, WatchId, Watchable};
pub use store::{Generation, StoreStats};
pub use types::{Field, Layout, Prim, Storable, TextRef, TypeDesc};
pub use writer::Writer;
