//! Engine configuration and environment tuning

/// Default download buffer size for object-store reads (8 MiB).
pub const DEFAULT_DOWNLOAD_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Default upload block size for object-store writes (100 MiB, the backend
/// block limit).
pub const DEFAULT_UPLOAD_BUFFER_SIZE: usize = 100 * 1024 * 1024;

/// Default byte budget of the decoded tile cache (1 GiB).
pub const DEFAULT_TILE_CACHE_BUDGET: usize = 1024 * 1024 * 1024;

/// Default in-memory budget for sorting unordered writes (128 MiB); larger
/// write sets spill to an external merge sort.
pub const DEFAULT_SORT_MEMORY_BUDGET: usize = 128 * 1024 * 1024;

/// Engine configuration.
///
/// Every knob has a production default; `from_env` layers the supported
/// environment variables on top. Values are fixed once a [`crate::Context`]
/// is built from the config.
#[derive(Debug, Clone)]
pub struct Config {
    /// Read grain for object stores; reads larger than this are split into
    /// parallel range requests.
    pub download_buffer_size: usize,
    /// Upload block size for object stores; one block per upload request.
    pub upload_buffer_size: usize,
    /// Concurrent range requests per large object-store read or write.
    pub max_parallel_ops: usize,
    /// Concurrent tile compressions during fragment finalize.
    pub codec_parallelism: usize,
    /// Byte budget of the decoded tile cache.
    pub tile_cache_budget: usize,
    /// In-memory sort budget for unordered writes before spilling.
    pub sort_memory_budget: usize,
    /// Skip POSIX advisory locks entirely.
    pub disable_file_locking: bool,
    /// Reuse POSIX read handles across positional reads.
    pub keep_file_handles_open: bool,
}

impl Default for Config {
    fn default() -> Self {
        let hw = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            download_buffer_size: DEFAULT_DOWNLOAD_BUFFER_SIZE,
            upload_buffer_size: DEFAULT_UPLOAD_BUFFER_SIZE,
            max_parallel_ops: (hw / 2).max(1),
            codec_parallelism: hw,
            tile_cache_budget: DEFAULT_TILE_CACHE_BUDGET,
            sort_memory_budget: DEFAULT_SORT_MEMORY_BUDGET,
            disable_file_locking: false,
            keep_file_handles_open: false,
        }
    }
}

impl Config {
    /// Defaults overlaid with the `TILEDB_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_usize("TILEDB_DOWNLOAD_BUFFER_SIZE") {
            config.download_buffer_size = v;
        }
        if let Some(v) = env_usize("TILEDB_UPLOAD_BUFFER_SIZE") {
            config.upload_buffer_size = v.min(DEFAULT_UPLOAD_BUFFER_SIZE);
        }
        if env_flag("TILEDB_DISABLE_FILE_LOCKING") {
            config.disable_file_locking = true;
        }
        if env_flag("TILEDB_KEEP_FILE_HANDLES_OPEN") {
            config.keep_file_handles_open = true;
        }
        config
    }

    /// Set the decoded tile cache budget.
    pub fn with_tile_cache_budget(mut self, bytes: usize) -> Self {
        self.tile_cache_budget = bytes;
        self
    }

    /// Set the in-memory sort budget for unordered writes.
    pub fn with_sort_memory_budget(mut self, bytes: usize) -> Self {
        self.sort_memory_budget = bytes;
        self
    }

    /// Set the parallel request bound for object-store range operations.
    pub fn with_max_parallel_ops(mut self, ops: usize) -> Self {
        self.max_parallel_ops = ops.max(1);
        self
    }

    /// Disable POSIX advisory locking.
    pub fn with_file_locking_disabled(mut self, disabled: bool) -> Self {
        self.disable_file_locking = disabled;
        self
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).ok().as_deref(), Some("1"))
}
