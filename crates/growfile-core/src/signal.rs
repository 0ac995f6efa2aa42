//! Change notification by polling.
//!
//! A `SignalRegistry` remembers the generation each watched view had when it
//! was last seen. `poll` re-reads every generation and fires the callbacks
//! whose value moved. There is no background thread: callers poll from
//! their own event loop.

use tracing::{debug, warn};

use crate::error::{GrowError, GrowResult};
use crate::store::Generation;

/// A view whose changes can be detected by comparing generations.
pub trait Watchable {
    fn generation(&self) -> GrowResult<Generation>;
}

/// Identifies one registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

type Check = Box<dyn FnMut(&mut Generation) -> GrowResult<bool>>;

struct Watch {
    id: WatchId,
    last_seen: Generation,
    check: Check,
}

/// Registered watches, polled on the caller's thread.
#[derive(Default)]
pub struct SignalRegistry {
    watches: Vec<Watch>,
    next_id: u64,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` with `handle` whenever its generation changes.
    ///
    /// The current generation is captured now, so the first `poll` only
    /// fires if something changed after this call.
    pub fn watch<H, F>(&mut self, handle: &H, mut callback: F) -> GrowResult<WatchId>
    where
        H: Watchable + Clone + 'static,
        F: FnMut(&H) + 'static,
    {
        let last_seen = handle.generation()?;
        let handle = handle.clone();
        let check: Check = Box::new(move |last_seen: &mut Generation| {
            let current = handle.generation()?;
            if current == *last_seen {
                return Ok(false);
            }
            *last_seen = current;
            callback(&handle);
            Ok(true)
        });

        let id = WatchId(self.next_id);
        self.next_id += 1;
        self.watches.push(Watch { id, last_seen, check });
        Ok(id)
    }

    /// Remove a watch. Returns false if it was already gone.
    pub fn unwatch(&mut self, id: WatchId) -> bool {
        let before = self.watches.len();
        self.watches.retain(|w| w.id != id);
        self.watches.len() != before
    }

    /// Check every watch once. Returns true if any callback fired.
    ///
    /// Watches on a closed reader are dropped. A watch failing with any
    /// other error keeps its last seen generation and is retried on the next
    /// poll; the pass still visits every other watch, and the first such
    /// error is returned once it is done. Callbacks that fired in a failed
    /// pass have run and will not fire again for the same change.
    pub fn poll(&mut self) -> GrowResult<bool> {
        let mut fired = false;
        let mut failure = None;
        let mut index = 0;
        while index < self.watches.len() {
            let watch = &mut self.watches[index];
            match (watch.check)(&mut watch.last_seen) {
                Ok(changed) => {
                    fired |= changed;
                    index += 1;
                }
                Err(GrowError::Closed { path }) => {
                    debug!(
                        id = watch.id.0,
                        path = %path.display(),
                        "dropping watch on closed store"
                    );
                    self.watches.remove(index);
                }
                Err(err) => {
                    warn!(id = watch.id.0, error = %err, "watch check failed");
                    if failure.is_none() {
                        failure = Some(err);
                    }
                    index += 1;
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(fired),
        }
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }
}
