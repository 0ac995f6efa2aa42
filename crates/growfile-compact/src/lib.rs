//! Growfile Compact: reclaim orphaned space in store files
//!
//! Growth never reuses space: every relocated array block and replaced
//! reference target stays in the file as orphaned bytes. Compaction reads
//! every definition through a `Reader`, rewrites the live values into a
//! fresh store, and swaps the fresh store in:
//! 1. Create a unique staging file next to the destination
//! 2. Rewrite every definition, deep-copying text and reference targets
//! 3. durable_sync the staging file
//! 4. Rename it into place (over the original, or under a new unique name)
//! 5. durable_sync the directory
//!
//! Compaction must not run while a writer has the source file open. Readers
//! of the old file keep their mapping of the old inode and are unaffected.

use std::fs;
use std::path::{Path, PathBuf};

use growfile_core::platform::sync_dir;
use growfile_core::{
    create_unique, publish, Config, GrowError, GrowResult, RawHandle, RawValue, Reader, TextRef,
    Writer,
};
use tracing::{debug, info};

/// Suffix of staging files while a rewrite is in progress.
const STAGING_SUFFIX: &str = ".compact-staging";

/// Headroom added to the live size of a store being rewritten.
const REWRITE_SLACK: u64 = 64 * 1024;

/// Result of a compaction operation.
#[derive(Debug)]
pub struct CompactionResult {
    /// Path of the compacted store
    pub file_path: PathBuf,
    /// Number of definitions carried over
    pub definitions: usize,
    /// Original file size in bytes
    pub original_bytes: u64,
    /// Compacted file size in bytes
    pub compacted_bytes: u64,
    /// Orphaned bytes in the original file
    pub orphaned_bytes: u64,
}

impl CompactionResult {
    /// Share of the original file that was orphaned (0.0 = no waste).
    pub fn dead_space_ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        self.orphaned_bytes as f64 / self.original_bytes as f64
    }

    /// Space saved in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

/// Compact `file_path` in place.
///
/// If the process dies before the rename the original is intact and only a
/// staging file is left behind; after the rename the compacted store is in
/// place.
pub fn compact_file(file_path: &Path) -> GrowResult<CompactionResult> {
    let dir = parent_dir(file_path);
    let staging = create_unique(dir, STAGING_SUFFIX)?;
    let mut result = rewrite_or_discard(file_path, &staging)?;

    replace(&staging, file_path)?;
    sync_dir(dir)
        .map_err(|e| GrowError::io_at(dir, e, "Failed to sync directory after compaction"))?;

    result.file_path = file_path.to_path_buf();
    info!(
        path = %file_path.display(),
        definitions = result.definitions,
        saved = result.bytes_saved(),
        "compacted"
    );
    Ok(result)
}

/// Compact `file_path` into a new store published under a unique name in
/// `dest_dir`. The original is left untouched.
pub fn compact_to(
    file_path: &Path,
    dest_dir: &Path,
    suffix: &str,
) -> GrowResult<CompactionResult> {
    let staging = create_unique(dest_dir, STAGING_SUFFIX)?;
    let mut result = rewrite_or_discard(file_path, &staging)?;

    result.file_path = publish(&staging, dest_dir, suffix)?;
    info!(
        from = %file_path.display(),
        to = %result.file_path.display(),
        definitions = result.definitions,
        saved = result.bytes_saved(),
        "compacted"
    );
    Ok(result)
}

/// Check whether the orphaned share of allocated space has reached `threshold`.
pub fn needs_compaction(file_path: &Path, threshold: f64) -> GrowResult<bool> {
    let stats = Reader::open(file_path)?.stats()?;
    Ok(stats.orphaned_bytes > 0 && stats.orphaned_ratio() >= threshold)
}

/// Compact every store in `dir` whose name ends with `suffix` and whose
/// orphaned ratio has reached `threshold`.
pub fn compact_directory(
    dir: &Path,
    suffix: &str,
    threshold: f64,
) -> GrowResult<Vec<CompactionResult>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| GrowError::io_at(dir, e, "Failed to read store directory"))?;

    let mut stores: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(suffix) && !name.ends_with(STAGING_SUFFIX))
        })
        .map(|entry| entry.path())
        .collect();
    stores.sort();

    let mut results = Vec::new();
    for path in stores {
        if needs_compaction(&path, threshold)? {
            results.push(compact_file(&path)?);
        } else {
            debug!(path = %path.display(), "below compaction threshold");
        }
    }
    Ok(results)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn rewrite_or_discard(source: &Path, staging: &Path) -> GrowResult<CompactionResult> {
    rewrite(source, staging).inspect_err(|_| {
        let _ = fs::remove_file(staging);
    })
}

/// Rename the finished staging file over `target`. The staging file is
/// removed if the rename fails.
fn replace(staging: &Path, target: &Path) -> GrowResult<()> {
    fs::rename(staging, target).map_err(|e| {
        let _ = fs::remove_file(staging);
        GrowError::io_at(target, e, "Failed to rename compacted file")
    })
}

/// Copy every live definition of `source` into the empty store at `staging`.
fn rewrite(source: &Path, staging: &Path) -> GrowResult<CompactionResult> {
    let reader = Reader::open(source)?;
    let stats = reader.stats()?;

    // Size the new file for the live data so it is not padded out by a
    // coarse extension step.
    let live = stats.allocated_bytes.saturating_sub(stats.orphaned_bytes);
    let mut config = Config::embedded();
    config.initial_file_size = (live + REWRITE_SLACK).next_multiple_of(4096);
    config.min_extend_bytes = REWRITE_SLACK;
    config.max_file_size = config.max_file_size.max(stats.file_bytes.saturating_mul(2));
    let mut writer = Writer::open(staging, config)?;

    let definitions = reader.definitions()?;
    for handle in &definitions {
        copy_definition(&reader, &mut writer, handle)?;
    }

    writer.sync()?;
    let compacted_bytes = writer.stats()?.file_bytes;
    writer.close()?;

    Ok(CompactionResult {
        file_path: staging.to_path_buf(),
        definitions: definitions.len(),
        original_bytes: stats.file_bytes,
        compacted_bytes,
        orphaned_bytes: stats.orphaned_bytes,
    })
}

fn copy_definition(reader: &Reader, writer: &mut Writer, handle: &RawHandle) -> GrowResult<()> {
    let desc = handle.desc();
    let size = handle.value_layout()?.size as usize;
    let text_offsets = desc.value_type().text_offsets();

    match reader.read_raw(handle)? {
        RawValue::Scalar(mut value) => {
            let target = writer.define_raw(handle.name(), desc, None)?;
            copy_text(reader, writer, &mut value, size, &text_offsets)?;
            writer.write_raw(&target, &value)?;
        }
        RawValue::Array { capacity, mut elements } => {
            let target = writer.define_raw(handle.name(), desc, Some(capacity))?;
            copy_text(reader, writer, &mut elements, size, &text_offsets)?;
            writer.extend_raw(&target, &elements)?;
        }
        RawValue::Ref(value) => {
            let target = writer.define_raw(handle.name(), desc, None)?;
            if let Some(mut value) = value {
                copy_text(reader, writer, &mut value, size, &text_offsets)?;
                writer.write_raw(&target, &value)?;
            }
        }
    }
    debug!(name = handle.name(), kind = handle.kind().name(), "copied definition");
    Ok(())
}

/// Re-store every text field in `values` (packed values of `size` bytes)
/// into the new store and patch the references in place.
fn copy_text(
    reader: &Reader,
    writer: &mut Writer,
    values: &mut [u8],
    size: usize,
    text_offsets: &[u64],
) -> GrowResult<()> {
    if text_offsets.is_empty() || size == 0 {
        return Ok(());
    }
    let width = std::mem::size_of::<TextRef>();
    for value in values.chunks_exact_mut(size) {
        for &offset in text_offsets {
            let field = &mut value[offset as usize..offset as usize + width];
            let old: TextRef = bytemuck::pod_read_unaligned(field);
            if old.is_null() {
                continue;
            }
            let text = reader.read_text(old)?;
            let new = writer.store_text(&text)?;
            field.copy_from_slice(bytemuck::bytes_of(&new));
        }
    }
    Ok(())
}
