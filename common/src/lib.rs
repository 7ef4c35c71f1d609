//! Core library for `rcm`, a tool that copies or moves files using a bounded pool of workers.
//!
//! # Batches
//!
//! One invocation transfers one batch. The shape of the batch is decided by the sources:
//!
//! - a single regular file is transferred directly, unless a file of the same name already exists
//!   in the current working directory
//! - a single directory becomes a folder of the same name inside the destination; every file
//!   directly under it is handed to the worker pool and, for a move, the emptied source directory
//!   is removed once all workers are done
//! - several paths are all handed to the worker pool and land directly in the destination
//!
//! Nested directories are never recursed into. See [`classify`] for the exact rules.
//!
//! # Worker pool
//!
//! The coordinator ([`transfer::execute`]) fills a bounded queue ([`queue::TransferQueue`]) with
//! one token per file. At most `worker_limit` [`worker::Worker`]s pull from it, so no more than
//! `worker_limit` transfers are ever in flight, and the queue itself never holds more than
//! `worker_limit` tokens. The coordinator joins every worker before it reports completion of a
//! directory move and before it returns.
//!
//! # Throttling
//!
//! Transfers also go through the process-wide gates of the `throttle` crate (open files,
//! operations per second and I/O operations per second), configured by [`run`] from a
//! [`ThrottleConfig`].
//!
//! # Metadata
//!
//! A copy always carries the permission bits over; owner and timestamps follow the
//! [`preserve::Settings`]. A move that has to fall back to copy-and-delete keeps the full mode and
//! timestamps.

pub mod classify;
pub mod config;
pub mod preserve;
pub mod progress;
pub mod queue;
pub mod transfer;
pub mod worker;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig};
pub use transfer::{Operation, Report, Settings, Summary, TransferRequest, UnknownOperation};

pub static PROGRESS: progress::Progress = progress::Progress::new();

/// Runs one batch, counting into the process-wide [`PROGRESS`].
pub async fn transfer(
    request: &TransferRequest,
    settings: &Settings,
    on_report: impl FnOnce(&Report),
) -> Result<Summary, transfer::Error> {
    transfer::execute(&PROGRESS, request, settings, on_report).await
}

fn init_tracing(output: &OutputConfig) {
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    // RUST_LOG takes precedence over the command line
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("failed to initialize logging: {error}");
    }
}

/// 80% of the soft RLIMIT_NOFILE, or 0 (no limit) if that can't be determined.
fn default_max_open_files() -> usize {
    use nix::sys::resource::{Resource, getrlimit};
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) if soft != libc::RLIM_INFINITY => {
            usize::try_from(soft / 10 * 8).unwrap_or(0)
        }
        Ok(_) => 0,
        Err(error) => {
            tracing::warn!("failed to read the open files limit: {}", error);
            0
        }
    }
}

/// Splits a per-second rate into `(tokens, interval)` so that tokens arrive in small portions.
fn replenish_interval(per_second: usize) -> (usize, std::time::Duration) {
    if per_second >= 10 {
        (per_second / 10, std::time::Duration::from_millis(100))
    } else {
        (
            1,
            std::time::Duration::from_millis(1000 / per_second.max(1) as u64),
        )
    }
}

fn setup_throttles(throttle_config: &ThrottleConfig) {
    let max_open_files = throttle_config
        .max_open_files
        .unwrap_or_else(default_max_open_files);
    if max_open_files > 0 {
        tracing::debug!("limiting open files to {}", max_open_files);
        throttle::set_max_open_files(max_open_files);
    }
    if throttle_config.ops_throttle > 0 {
        let (replenish, interval) = replenish_interval(throttle_config.ops_throttle);
        throttle::init_ops_tokens(replenish);
        tokio::spawn(throttle::run_ops_replenish_thread(replenish, interval));
    }
    if throttle_config.iops_throttle > 0 {
        let (replenish, interval) = replenish_interval(throttle_config.iops_throttle);
        throttle::init_iops_tokens(replenish);
        tokio::spawn(throttle::run_iops_replenish_thread(replenish, interval));
    }
}

/// Sets up logging, the tokio runtime and the throttles, then runs `func` to completion.
///
/// Errors are logged (unless `quiet`), the summary is printed to stdout when asked for.
/// Returns `None` if anything failed.
pub fn run<Fut>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Fut: std::future::Future<Output = Result<Summary, transfer::Error>>,
{
    init_tracing(&output);
    if let Err(error) = throttle_config.validate() {
        tracing::error!("{}", error);
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to start the tokio runtime: {:#}", error);
            return None;
        }
    };
    let res = tokio_runtime.block_on(async {
        setup_throttles(&throttle_config);
        func().await
    });
    let status = PROGRESS.transfers.get();
    tracing::info!(
        "transfers started: {}, finished: {}, most in flight: {}",
        status.started,
        status.finished,
        status.peak_in_flight
    );
    // replenish tasks never finish on their own
    tokio_runtime.shutdown_background();
    let print_summary = output.print_summary || output.verbose > 0;
    match res {
        Ok(summary) => {
            if print_summary {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{}", &error);
            if print_summary {
                println!("{}", &error.summary);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replenish_interval_splits_rates() {
        assert_eq!(
            replenish_interval(100),
            (10, std::time::Duration::from_millis(100))
        );
        assert_eq!(
            replenish_interval(10),
            (1, std::time::Duration::from_millis(100))
        );
        assert_eq!(
            replenish_interval(4),
            (1, std::time::Duration::from_millis(250))
        );
        assert_eq!(replenish_interval(1), (1, std::time::Duration::from_secs(1)));
    }

    #[test]
    fn run_reports_failure() {
        let summary = run(
            OutputConfig {
                quiet: true,
                ..Default::default()
            },
            RuntimeConfig {
                max_workers: 1,
                ..Default::default()
            },
            ThrottleConfig {
                max_open_files: Some(0),
                ..Default::default()
            },
            || async {
                Err(transfer::Error::new(
                    anyhow::anyhow!("boom"),
                    Summary::default(),
                ))
            },
        );
        assert!(summary.is_none());
    }

    #[test]
    fn run_rejects_invalid_throttle() {
        let summary = run(
            OutputConfig {
                quiet: true,
                ..Default::default()
            },
            RuntimeConfig::default(),
            ThrottleConfig {
                max_open_files: Some(0),
                iops_throttle: 10,
                ..Default::default()
            },
            || async { Ok(Summary::default()) },
        );
        assert!(summary.is_none());
    }
}
