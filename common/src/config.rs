//! Settings handed to [`crate::run`], built once from the command line.

/// Sizing of the tokio runtime the batch runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Runtime worker threads, 0 uses one per CPU core
    pub max_workers: usize,
    /// Threads for blocking calls (owner/timestamp updates), 0 keeps tokio's default
    pub max_blocking_threads: usize,
}

/// Process-wide limits applied to every transfer, see the `throttle` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Files open at once: `None` picks 80% of RLIMIT_NOFILE, `Some(0)` disables the limit
    pub max_open_files: Option<usize>,
    /// Transfers started per second, 0 disables
    pub ops_throttle: usize,
    /// I/O operations per second, 0 disables
    pub iops_throttle: usize,
    /// Bytes per I/O operation when counting against `iops_throttle`
    pub chunk_size: u64,
}

impl ThrottleConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.iops_throttle > 0 && self.chunk_size == 0 {
            return Err(anyhow::anyhow!(
                "--chunk-size must be set to a non-zero value when --iops-throttle is used"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Don't log errors
    pub quiet: bool,
    /// 0 logs errors only, then INFO, DEBUG and TRACE
    pub verbose: u8,
    /// Print the batch summary to stdout once done
    pub print_summary: bool,
}
