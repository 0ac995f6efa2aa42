//! Indirection cells and reference slots
//!
//! A dynamic value never moves its cell. Growing allocates a new block,
//! copies the live elements across and then swings the cell's target:
//!
//! 1. allocate the new block and write its header (capacity, element size)
//! 2. copy `length` elements; the rest of the block is already zero
//! 3. store the cell's capacity
//! 4. store the cell's target (Release), which publishes the block
//! 5. count the old block as orphaned; it is never reused
//!
//! Readers load `length` first and `target` second, and take capacity from
//! the block header. Any target they can observe is a complete block at
//! least as long as the length they saw.

use tracing::debug;

use crate::alloc::Allocator;
use crate::error::{GrowError, GrowResult};
use crate::format::{
    Offset, BLOCK_CAPACITY, BLOCK_ELEM_SIZE, BLOCK_HEADER_SIZE, CELL_CAPACITY, CELL_LENGTH,
    CELL_SIZE, CELL_TARGET, HDR_ORPHANED, REF_TARGET,
};
use crate::region::Region;
use crate::types::Layout;

/// Element layout of byte arrays (text, the directory).
pub(crate) const BYTES: Layout = Layout { size: 1, align: 1 };

/// A consistent snapshot of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CellState {
    pub target: Offset,
    pub capacity: u64,
    pub length: u64,
    pub elem_size: u64,
}

impl CellState {
    /// First element of the block.
    pub(crate) fn data(&self) -> Offset {
        self.target.add(BLOCK_HEADER_SIZE)
    }

    pub(crate) fn live_bytes(&self) -> u64 {
        self.length * self.elem_size
    }
}

fn block_bytes(region: &Region, elem: Layout, count: u64) -> GrowResult<u64> {
    count
        .checked_mul(elem.size)
        .and_then(|b| b.checked_add(BLOCK_HEADER_SIZE))
        .ok_or_else(|| GrowError::CapacityExceeded {
            path: region.path().to_path_buf(),
            requested_bytes: u64::MAX,
            limit_bytes: region.len(),
        })
}

fn allocate_block(
    region: &mut Region,
    alloc: &Allocator,
    elem: Layout,
    count: u64,
) -> GrowResult<Offset> {
    let bytes = block_bytes(region, elem, count)?;
    // The header is two words; elements follow at +16, so 8-byte block
    // alignment also aligns every element type we accept.
    let block = alloc.allocate(region, bytes, elem.align.max(8))?;
    region.store(block.add(BLOCK_CAPACITY), count)?;
    region.store(block.add(BLOCK_ELEM_SIZE), elem.size)?;
    Ok(block)
}

/// Allocate a cell and an initial block of `count` elements.
pub(crate) fn allocate_dynamic(
    region: &mut Region,
    alloc: &Allocator,
    elem: Layout,
    count: u64,
) -> GrowResult<Offset> {
    let block = allocate_block(region, alloc, elem, count)?;
    let cell = alloc.allocate(region, CELL_SIZE, 8)?;
    region.store(cell.add(CELL_CAPACITY), count)?;
    region.store(cell.add(CELL_LENGTH), 0)?;
    region.store(cell.add(CELL_TARGET), block.as_u64())?;
    Ok(cell)
}

/// Relocate the cell's contents into a block of `new_capacity` elements.
///
/// Returns `false` without touching anything when the cell already holds
/// that many. Length and contents are preserved.
pub(crate) fn grow(
    region: &mut Region,
    alloc: &Allocator,
    cell: Offset,
    elem: Layout,
    new_capacity: u64,
) -> GrowResult<bool> {
    let capacity = region.load(cell.add(CELL_CAPACITY))?;
    if new_capacity <= capacity {
        return Ok(false);
    }
    let length = region.load(cell.add(CELL_LENGTH))?;
    let old = Offset::new(region.load(cell.add(CELL_TARGET))?);
    if length > capacity {
        return Err(GrowError::corrupt(
            region.path(),
            cell.as_u64(),
            format!("length {} exceeds capacity {}", length, capacity),
        ));
    }

    let block = allocate_block(region, alloc, elem, new_capacity)?;
    region.copy_within(
        old.add(BLOCK_HEADER_SIZE),
        block.add(BLOCK_HEADER_SIZE),
        length * elem.size,
    )?;
    region.store(cell.add(CELL_CAPACITY), new_capacity)?;
    region.store(cell.add(CELL_TARGET), block.as_u64())?;
    region.fetch_add(HDR_ORPHANED, BLOCK_HEADER_SIZE + capacity * elem.size)?;

    debug!(cell = %cell, from = capacity, to = new_capacity, length, block = %block, "grew cell");
    Ok(true)
}

/// Publish a new length. Fails without change when it exceeds capacity.
pub(crate) fn set_length(region: &Region, cell: Offset, length: u64) -> GrowResult<()> {
    let capacity = region.load(cell.add(CELL_CAPACITY))?;
    if length > capacity {
        return Err(GrowError::LengthOutOfBounds { length, capacity });
    }
    region.store(cell.add(CELL_LENGTH), length)
}

/// Snapshot a cell the way a concurrent reader must: length, then target,
/// then capacity from the block the target names.
pub(crate) fn dereference(region: &Region, cell: Offset) -> GrowResult<CellState> {
    let length = region.load(cell.add(CELL_LENGTH))?;
    let target = Offset::new(region.load(cell.add(CELL_TARGET))?);
    if target.is_null() {
        return Err(GrowError::corrupt(region.path(), cell.as_u64(), "cell has no target"));
    }
    let capacity = region.load(target.add(BLOCK_CAPACITY))?;
    let elem_size = region.load(target.add(BLOCK_ELEM_SIZE))?;
    if length > capacity {
        return Err(GrowError::corrupt(
            region.path(),
            cell.as_u64(),
            format!("length {} exceeds capacity {}", length, capacity),
        ));
    }
    let data_bytes = capacity.checked_mul(elem_size);
    let in_bounds = data_bytes
        .and_then(|b| target.as_u64().checked_add(BLOCK_HEADER_SIZE + b))
        .map(|end| end <= region.len())
        .unwrap_or(false);
    if !in_bounds {
        return Err(GrowError::corrupt(
            region.path(),
            target.as_u64(),
            format!("block of {} x {} bytes overruns mapping", capacity, elem_size),
        ));
    }
    Ok(CellState { target, capacity, length, elem_size })
}

/// Point a reference slot at a fresh copy of `value`.
pub(crate) fn store_ref(
    region: &mut Region,
    alloc: &Allocator,
    slot: Offset,
    layout: Layout,
    value: &[u8],
) -> GrowResult<()> {
    debug_assert_eq!(value.len() as u64, layout.size);
    let target = alloc.allocate(region, layout.size, layout.align)?;
    region.write(target, value)?;
    let previous = region.load(slot.add(REF_TARGET))?;
    region.store(slot.add(REF_TARGET), target.as_u64())?;
    if previous != 0 {
        region.fetch_add(HDR_ORPHANED, layout.size)?;
    }
    Ok(())
}

/// Copy out the value a reference slot points at, if any.
pub(crate) fn load_ref(region: &Region, slot: Offset, size: u64) -> GrowResult<Option<Vec<u8>>> {
    let target = Offset::new(region.load(slot.add(REF_TARGET))?);
    if target.is_null() {
        return Ok(None);
    }
    let mut out = vec![0u8; size as usize];
    region.read(target, &mut out)?;
    Ok(Some(out))
}
