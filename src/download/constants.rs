//! Constants for the download module (part sizing, timeouts, buffers).

use std::time::Duration;

/// Sentinel hash identifying the aggregate completion event of an item.
pub const MAIN_HASH: &str = "main";

/// Extension used for part staging files.
pub const PART_FILE_EXT: &str = "warp";

/// Fixed chunk buffer size for streaming copies (64 KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default idle read timeout between chunks (60 seconds).
pub const READ_TIMEOUT_SECS: u64 = 60;

/// FTP/SSH connect timeout (30 seconds).
pub const REMOTE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Default number of concurrently running part connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// Default upper bound on the number of planned parts.
pub const DEFAULT_MAX_PARTS: usize = 32;

/// Minimum part size for files under 100 MiB (512 KiB).
pub const MIN_PART_SIZE_SMALL: i64 = 512 * 1024;

/// Minimum part size for files between 100 MiB and 1 GiB (1 MiB).
pub const MIN_PART_SIZE_MEDIUM: i64 = 1024 * 1024;

/// Minimum part size for files between 1 GiB and 10 GiB (2 MiB).
pub const MIN_PART_SIZE_LARGE: i64 = 2 * 1024 * 1024;

/// Minimum part size for files of 10 GiB and above (4 MiB).
pub const MIN_PART_SIZE_HUGE: i64 = 4 * 1024 * 1024;

/// 100 MiB boundary.
pub const SIZE_100_MIB: i64 = 100 * 1024 * 1024;

/// 1 GiB boundary.
pub const SIZE_1_GIB: i64 = 1024 * 1024 * 1024;

/// 10 GiB boundary.
pub const SIZE_10_GIB: i64 = 10 * SIZE_1_GIB;

/// Picks the minimum part size for a total file size; unknown sizes use
/// the smallest tier.
#[must_use]
pub fn min_part_size_for(total_size: i64) -> i64 {
    if total_size < 0 {
        MIN_PART_SIZE_SMALL
    } else if total_size < SIZE_100_MIB {
        MIN_PART_SIZE_SMALL
    } else if total_size < SIZE_1_GIB {
        MIN_PART_SIZE_MEDIUM
    } else if total_size < SIZE_10_GIB {
        MIN_PART_SIZE_LARGE
    } else {
        MIN_PART_SIZE_HUGE
    }
}
