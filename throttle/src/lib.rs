//! Resource throttling for parallel transfers
//!
//! Every file a worker transfers goes through up to three gates, all process-wide:
//!
//! 1. **Open files** - a cap on the number of files open at once. Permits are held for the
//!    duration of one transfer and released on drop.
//! 2. **Operations** - a cap on the number of transfers started per interval.
//! 3. **I/O operations** - a cap on I/O per interval, where a file of `size` bytes costs
//!    `⌈size / chunk_size⌉` tokens.
//!
//! Gates that were never configured (or configured with 0) are open and cost nothing.
//! Rate gates are refilled by a background task started with [`run_ops_replenish_thread`] /
//! [`run_iops_replenish_thread`].
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! throttle::set_max_open_files(512);
//! throttle::init_ops_tokens(10);
//! tokio::spawn(throttle::run_ops_replenish_thread(10, Duration::from_millis(100)));
//!
//! // inside a worker, before touching the file:
//! throttle::get_ops_token().await;
//! throttle::get_file_iops_tokens(64 * 1024, 1024 * 1024).await;
//! let _open_file = throttle::open_file_permit().await;
//! # }
//! ```

mod semaphore;

use semaphore::TokenBucket;

static OPEN_FILES_LIMIT: TokenBucket = TokenBucket::new();
static OPS_THROTTLE: TokenBucket = TokenBucket::new();
static IOPS_THROTTLE: TokenBucket = TokenBucket::new();

pub fn set_max_open_files(max_open_files: usize) {
    OPEN_FILES_LIMIT.setup(max_open_files);
}

/// Keeps one open-file slot reserved while alive.
pub struct OpenFileGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn open_file_permit() -> OpenFileGuard {
    OpenFileGuard {
        _permit: OPEN_FILES_LIMIT.acquire().await,
    }
}

pub fn init_ops_tokens(ops_tokens: usize) {
    OPS_THROTTLE.setup(ops_tokens);
}

pub fn init_iops_tokens(iops_tokens: usize) {
    IOPS_THROTTLE.setup(iops_tokens);
}

pub async fn get_ops_token() {
    OPS_THROTTLE.consume(1).await;
}

/// Number of I/O tokens a file of `file_size` bytes costs; empty files still cost one.
pub fn iops_tokens_for(chunk_size: u64, file_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    1 + (std::cmp::max(1, file_size) - 1) / chunk_size
}

pub async fn get_file_iops_tokens(chunk_size: u64, file_size: u64) {
    let tokens = iops_tokens_for(chunk_size, file_size);
    if tokens == 0 {
        return;
    }
    match u32::try_from(tokens) {
        Ok(tokens) => IOPS_THROTTLE.consume(tokens).await,
        Err(_) => tracing::error!(
            "chunk size: {} is too small to limit throughput for files this big, size: {}",
            chunk_size,
            file_size,
        ),
    }
}

pub async fn run_ops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    OPS_THROTTLE.replenish_forever(replenish, interval).await;
}

pub async fn run_iops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    IOPS_THROTTLE.replenish_forever(replenish, interval).await;
}
