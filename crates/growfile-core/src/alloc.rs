//! Bump allocator over the store file
//!
//! Space is handed out from the header's `end` word and never reclaimed.
//! The word is re-read on every call, so a second writer opened after the
//! first closed continues where the first stopped.

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{GrowError, GrowResult};
use crate::format::{Offset, HDR_END, HEADER_SIZE};
use crate::region::Region;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Allocator {
    min_extend: u64,
    max_file_size: u64,
}

impl Allocator {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            min_extend: config.min_extend_bytes,
            max_file_size: config.max_file_size,
        }
    }

    /// Reserve `size` zeroed bytes aligned to `align` (a power of two).
    ///
    /// May extend and remap the file. `end` is published only after the
    /// file is long enough to hold it, which is what readers remap on.
    pub(crate) fn allocate(
        &self,
        region: &mut Region,
        size: u64,
        align: u64,
    ) -> GrowResult<Offset> {
        debug_assert!(align.is_power_of_two());
        let end = region.load(HDR_END)?;
        if end < HEADER_SIZE {
            return Err(GrowError::corrupt(
                region.path(),
                HDR_END.as_u64(),
                format!("end {} inside header", end),
            ));
        }
        let start = Offset::new(end).align_up(align.max(1));
        let new_end = start
            .as_u64()
            .checked_add(size)
            .ok_or_else(|| self.exceeded(region, u64::MAX))?;

        if new_end > region.len() {
            self.extend(region, new_end)?;
        }

        region.fill_zero(start, size)?;
        region.store(HDR_END, new_end)?;
        Ok(start)
    }

    fn extend(&self, region: &mut Region, needed: u64) -> GrowResult<()> {
        if needed > self.max_file_size {
            return Err(self.exceeded(region, needed));
        }
        let current = region.len();
        let step = self.min_extend.max(current / 2);
        let target = needed.max(current.saturating_add(step)).min(self.max_file_size);

        if let Err(e) = region.extend_file(target) {
            warn!(path = %region.path().display(), target, error = %e, "failed to extend store");
            return Err(GrowError::CapacityExceeded {
                path: region.path().to_path_buf(),
                requested_bytes: target,
                limit_bytes: current,
            });
        }
        region.remap()?;
        debug!(path = %region.path().display(), from = current, to = target, "extended store");
        Ok(())
    }

    fn exceeded(&self, region: &Region, requested: u64) -> GrowError {
        GrowError::CapacityExceeded {
            path: region.path().to_path_buf(),
            requested_bytes: requested,
            limit_bytes: self.max_file_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn fresh(dir: &tempfile::TempDir, len: u64) -> Region {
        let path = dir.path().join("alloc.db");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(len).unwrap();
        let region = Region::from_file(file, &path, true).unwrap();
        region.store(HDR_END, HEADER_SIZE).unwrap();
        region
    }

    fn small_config() -> Config {
        let mut config = Config::embedded();
        config.min_extend_bytes = 4096;
        config.max_file_size = 64 * 1024;
        config
    }

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = fresh(&dir, 4096);
        let alloc = Allocator::new(&small_config());

        let a = alloc.allocate(&mut region, 3, 1).unwrap();
        let b = alloc.allocate(&mut region, 8, 8).unwrap();
        let c = alloc.allocate(&mut region, 2, 2).unwrap();
        assert_eq!(a.as_u64(), HEADER_SIZE);
        assert_eq!(b.as_u64() % 8, 0);
        assert!(b.as_u64() >= a.as_u64() + 3);
        assert!(c.as_u64() >= b.as_u64() + 8);
        assert_eq!(region.load(HDR_END).unwrap(), c.as_u64() + 2);
    }

    #[test]
    fn test_extends_file_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = fresh(&dir, 4096);
        let alloc = Allocator::new(&small_config());

        let big = alloc.allocate(&mut region, 10_000, 8).unwrap();
        assert!(region.len() >= big.as_u64() + 10_000);
        assert_eq!(region.slice(big, 10_000).unwrap().iter().filter(|b| **b != 0).count(), 0);
    }

    #[test]
    fn test_capacity_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = fresh(&dir, 4096);
        let alloc = Allocator::new(&small_config());

        let err = alloc.allocate(&mut region, 128 * 1024, 8).unwrap_err();
        assert!(matches!(err, GrowError::CapacityExceeded { .. }));
        // Nothing was published
        assert_eq!(region.load(HDR_END).unwrap(), HEADER_SIZE);
    }
}
