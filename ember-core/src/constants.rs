//! Default values shared across the workspace.

/// Blacklist scope that applies to every group.
pub const GLOBAL_SCOPE: &str = "GLOBAL";

// Batch writer
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 3_000;
pub const MESSAGE_LOG_BATCH_SIZE: usize = 100;

// Archive tool
pub const DEFAULT_ARCHIVE_TOOL: &str = "7z";
pub const DEFAULT_ARCHIVE_FORMAT: &str = "7z";
pub const DEFAULT_ARCHIVE_METHOD: &str = "lzma2";
pub const DEFAULT_DECOMPRESS_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_COMPRESS_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_ARCHIVE_INTERVAL_SECS: u64 = 24 * 60 * 60;

// Shards
pub const DEFAULT_SHARD_KEY_FORMAT: &str = "%Y_%m";
pub const COMPACT_SHARD_KEY_FORMAT: &str = "%Y%m";
pub const DEFAULT_ACTIVE_WINDOW: u32 = 2;
pub const DEFAULT_MAX_MAP_REDUCE_SPAN: u32 = 6;
pub const DB_EXTENSION: &str = "db";
pub const ARCHIVE_EXTENSION: &str = "7z";

// Connection tuning
pub const DEFAULT_MMAP_SIZE: i64 = 268_435_456;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POOL_MAX_SIZE: u32 = 8;

// Layout
pub const DEFAULT_DATA_ROOT: &str = "./data/db";
pub const MAX_UTC_OFFSET_HOURS: i32 = 23;
