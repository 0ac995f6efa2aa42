//! Configuration management for Growfile writers
//!
//! Provides sizing presets for different hardware classes
//! and validation for custom configurations.

/// Writer configuration with sizing presets
#[derive(Debug, Clone)]
pub struct Config {
    /// File size reserved when a store is created (bytes)
    pub initial_file_size: u64,
    /// Minimum amount the file grows by when the allocator runs out of room (bytes)
    pub min_extend_bytes: u64,
    /// Hard ceiling on the file size; allocations beyond it fail with CapacityExceeded
    pub max_file_size: u64,
    /// Capacity given to arrays defined without an explicit count (elements)
    pub default_array_capacity: u64,
    /// Capacity a new series starts with (elements)
    pub series_initial_capacity: u64,
    /// Initial byte capacity of the root directory
    pub directory_initial_bytes: u64,
    /// Compaction trigger: compact when orphaned space ratio exceeds this
    pub compaction_trigger_ratio: f64,
    /// Flush the mapping and durably sync the file when the writer closes
    pub sync_on_close: bool,
}

impl Config {
    /// Server-class: large files, coarse extension steps
    pub fn server() -> Self {
        Self {
            initial_file_size: 16 * 1024 * 1024,
            min_extend_bytes: 64 * 1024 * 1024,
            max_file_size: 1024 * 1024 * 1024 * 1024,
            default_array_capacity: 1024,
            series_initial_capacity: 4096,
            directory_initial_bytes: 64 * 1024,
            compaction_trigger_ratio: 0.5,
            sync_on_close: true,
        }
    }

    /// Desktop-class: moderate files
    pub fn desktop() -> Self {
        Self {
            initial_file_size: 1024 * 1024,
            min_extend_bytes: 4 * 1024 * 1024,
            max_file_size: 64 * 1024 * 1024 * 1024,
            default_array_capacity: 256,
            series_initial_capacity: 512,
            directory_initial_bytes: 16 * 1024,
            compaction_trigger_ratio: 0.4,
            sync_on_close: true,
        }
    }

    /// Embedded-class: small files, fine-grained extension
    pub fn embedded() -> Self {
        Self {
            initial_file_size: 64 * 1024,
            min_extend_bytes: 256 * 1024,
            max_file_size: 1024 * 1024 * 1024,
            default_array_capacity: 16,
            series_initial_capacity: 32,
            directory_initial_bytes: 4 * 1024,
            compaction_trigger_ratio: 0.3,
            sync_on_close: false,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_file_size < 4096 {
            return Err("initial_file_size must be >= 4KB".into());
        }
        if self.min_extend_bytes < 4096 {
            return Err("min_extend_bytes must be >= 4KB".into());
        }
        if self.max_file_size < self.initial_file_size {
            return Err("max_file_size must be >= initial_file_size".into());
        }
        if self.default_array_capacity == 0 {
            return Err("default_array_capacity must be > 0".into());
        }
        if self.series_initial_capacity == 0 {
            return Err("series_initial_capacity must be > 0".into());
        }
        if self.directory_initial_bytes < 256 {
            return Err("directory_initial_bytes must be >= 256".into());
        }
        if self.directory_initial_bytes >= self.initial_file_size {
            return Err("directory_initial_bytes must be < initial_file_size".into());
        }
        if self.compaction_trigger_ratio <= 0.0 || self.compaction_trigger_ratio >= 1.0 {
            return Err("compaction_trigger_ratio must be in (0.0, 1.0)".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}
