use anyhow::Context;
use clap::Parser;
use tracing::instrument;

mod access;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rcm",
    version,
    about = "Copy or move files using a bounded pool of workers",
    long_about = "`rcm` copies or moves a file, a folder or a list of files into a destination directory.

A single folder is re-created inside the destination and every file directly inside it is
transferred by a pool of at most --threads workers. Sub-folders are not transferred. When a folder
is moved, it is removed only after all of its files were moved successfully.

A list of paths is transferred directly into the destination; entries must be files with distinct
names.

EXAMPLES:
    # Copy a folder using 8 workers
    rcm -o copy -f /data/photos -t /backup --threads 8

    # Move a few files
    rcm -o move -f a.txt b.txt c.txt -t /archive"
)]
struct Args {
    // Transfer
    /// Operation to perform: `copy` or `move`
    #[arg(short = 'o', long = "operation", value_name = "OPERATION", help_heading = "Transfer")]
    operation: String,

    /// Source path(s): one file, one folder, or several files
    #[arg(
        short = 'f',
        long = "from",
        value_name = "PATH",
        num_args = 1..,
        required = true,
        help_heading = "Transfer"
    )]
    from: Vec<std::path::PathBuf>,

    /// Destination directory
    #[arg(short = 't', long = "to", value_name = "PATH", help_heading = "Transfer")]
    to: std::path::PathBuf,

    /// Maximum number of files transferred at the same time
    #[arg(
        long,
        default_value = "1",
        value_name = "N",
        help_heading = "Transfer"
    )]
    threads: std::num::NonZeroUsize,

    /// Preserve owner (user and group) and timestamps on copied files, and all mode bits
    ///
    /// Without this option a copy keeps only the permission bits.
    #[arg(long, help_heading = "Transfer")]
    preserve: bool,

    /// Exit on first error
    #[arg(short = 'e', long = "fail-early", help_heading = "Transfer")]
    fail_early: bool,

    /// Print the completion line as soon as every file is queued
    ///
    /// Applies to copies and to lists of files. The transfers still finish before `rcm` exits.
    #[arg(long, help_heading = "Transfer")]
    report_early: bool,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of open files, 0 means no limit, leaving unspecified means using 80% of max open files system limit
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Throttle the number of transfers started per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    /// Throttle the number of I/O operations per second, 0 means no throttle
    ///
    /// I/O is calculated based on provided chunk size -- number of I/O operations for a file is calculated as:
    /// ((file size - 1) / chunk size) + 1
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    /// Chunk size used to calculate number of I/O per file
    ///
    /// Modifying this setting to a value > 0 is REQUIRED when using --iops-throttle.
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    chunk_size: u64,

    // Advanced settings
    /// Number of runtime worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

fn fail(error: anyhow::Error) -> common::transfer::Error {
    common::transfer::Error::new(error, Default::default())
}

#[instrument]
async fn async_main(args: Args) -> Result<common::Summary, common::transfer::Error> {
    let operation: common::Operation = args
        .operation
        .parse()
        .map_err(|error: common::UnknownOperation| fail(error.into()))?;
    access::check_sources(operation, &args.from)
        .await
        .map_err(fail)?;
    access::check_destination(&args.to).await.map_err(fail)?;
    let conflict_dir = std::env::current_dir()
        .context("failed reading the current working directory")
        .map_err(fail)?;
    let request = common::TransferRequest::new(operation, args.from, args.to, args.threads.get())
        .map_err(fail)?
        .with_conflict_dir(conflict_dir);
    let settings = common::Settings {
        fail_early: args.fail_early,
        report_early: args.report_early,
        preserve: if args.preserve {
            common::preserve::preserve_all()
        } else {
            common::preserve::preserve_default()
        },
        chunk_size: args.chunk_size,
    };
    common::transfer(&request, &settings, |report| println!("{}", report)).await
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        ops_throttle: args.ops_throttle,
        iops_throttle: args.iops_throttle,
        chunk_size: args.chunk_size,
    };
    let res = common::run(output, runtime, throttle, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
