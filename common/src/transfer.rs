//! Runs one copy or move batch.
//!
//! The sources are classified first (see [`crate::classify`]). A single file is transferred
//! directly. Everything else goes through a pool of at most `worker_limit` workers that pull file
//! names from a bounded [`TransferQueue`] filled by [`execute`]. Workers are always joined before
//! `execute` returns; the source folder of a directory move is removed only after every worker
//! has finished and every file made it across.
//!
//! With [`Settings::report_early`] the completion line of copy and multi-path batches is emitted
//! as soon as the last file name is queued, before the transfers necessarily finished.

use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::instrument;

use crate::classify::{self, SourceShape, TransferToken};
use crate::preserve;
use crate::progress;
use crate::queue::TransferQueue;
use crate::worker::{self, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Copy,
    Move,
}

#[derive(Debug, thiserror::Error)]
#[error("operation {0:?} not found, expected \"copy\" or \"move\"")]
pub struct UnknownOperation(pub String);

impl std::str::FromStr for Operation {
    type Err = UnknownOperation;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(Operation::Copy),
            "move" => Ok(Operation::Move),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}

impl Operation {
    fn done(&self) -> &'static str {
        match self {
            Operation::Copy => "copied",
            Operation::Move => "moved",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Operation::Copy => write!(f, "copy"),
            Operation::Move => write!(f, "move"),
        }
    }
}

/// Validated input of a batch.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    operation: Operation,
    sources: Vec<PathBuf>,
    destination: PathBuf,
    worker_limit: NonZeroUsize,
    conflict_dir: PathBuf,
}

impl TransferRequest {
    /// The "already exists" check of a single-file batch looks in the current working directory
    /// unless [`TransferRequest::with_conflict_dir`] says otherwise.
    pub fn new(
        operation: Operation,
        sources: Vec<PathBuf>,
        destination: PathBuf,
        worker_limit: usize,
    ) -> anyhow::Result<Self> {
        if sources.is_empty() {
            return Err(anyhow!("at least one source path is required"));
        }
        let worker_limit = NonZeroUsize::new(worker_limit)
            .ok_or_else(|| anyhow!("the number of workers must be at least 1"))?;
        Ok(Self {
            operation,
            sources,
            destination,
            worker_limit,
            conflict_dir: PathBuf::from("."),
        })
    }

    pub fn with_conflict_dir(self, conflict_dir: PathBuf) -> Self {
        Self {
            conflict_dir,
            ..self
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn worker_limit(&self) -> NonZeroUsize {
        self.worker_limit
    }

    pub fn conflict_dir(&self) -> &Path {
        &self.conflict_dir
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    /// Each worker stops at its first failed transfer and no more files are queued.
    pub fail_early: bool,
    /// Report copy and multi-path batches once everything is queued instead of once it is done.
    pub report_early: bool,
    pub preserve: preserve::Settings,
    /// Chunk size used for I/O throttling.
    pub chunk_size: u64,
}

/// Completion line of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Files(Operation),
    Folder(Operation),
    File { operation: Operation, name: String },
    AlreadyExists { name: String },
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Report::Files(operation) => write!(f, "Files have been {}.", operation.done()),
            Report::Folder(operation) => write!(f, "Folder has been {}.", operation.done()),
            Report::File { operation, name } => {
                write!(f, "File {} has been {}.", name, operation.done())
            }
            Report::AlreadyExists { name } => write!(f, "File {} already exists", name),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_transferred: u64,
    pub files_copied: usize,
    pub files_moved: usize,
    pub directories_created: usize,
    pub directories_removed: usize,
    pub files_skipped: usize,
    pub entries_rejected: usize,
    pub files_failed: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_transferred: self.bytes_transferred + other.bytes_transferred,
            files_copied: self.files_copied + other.files_copied,
            files_moved: self.files_moved + other.files_moved,
            directories_created: self.directories_created + other.directories_created,
            directories_removed: self.directories_removed + other.directories_removed,
            files_skipped: self.files_skipped + other.files_skipped,
            entries_rejected: self.entries_rejected + other.entries_rejected,
            files_failed: self.files_failed + other.files_failed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes transferred: {}\n\
            files copied: {}\n\
            files moved: {}\n\
            directories created: {}\n\
            directories removed: {}\n\
            files skipped: {}\n\
            entries rejected: {}\n\
            files failed: {}",
            bytesize::ByteSize(self.bytes_transferred),
            self.files_copied,
            self.files_moved,
            self.directories_created,
            self.directories_removed,
            self.files_skipped,
            self.entries_rejected,
            self.files_failed,
        )
    }
}

/// Error type for a batch that preserves what was done before it failed.
///
/// The Display implementation shows the full error chain.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

fn batch_error(errors: Vec<anyhow::Error>, summary: Summary) -> Error {
    let count = errors.len();
    let source = match errors.into_iter().next() {
        Some(first) => first.context(format!("{} transfer(s) failed, first failure", count)),
        None => anyhow!("transfer failed"),
    };
    Error::new(source, summary)
}

/// Workers of one batch plus the queue feeding them.
struct Pool {
    queue: TransferQueue,
    workers: tokio::task::JoinSet<worker::Outcome>,
}

impl Pool {
    /// Starts `min(worker_limit, token_count)` workers, all bound to the same pair of directories.
    fn start(
        prog_track: &'static progress::Progress,
        operation: Operation,
        from_dir: PathBuf,
        to_dir: PathBuf,
        settings: &Settings,
        worker_limit: NonZeroUsize,
        token_count: usize,
    ) -> Self {
        let (queue, receiver) = TransferQueue::bounded(worker_limit);
        let from_dir = Arc::new(from_dir);
        let to_dir = Arc::new(to_dir);
        let mut workers = tokio::task::JoinSet::new();
        for id in 0..std::cmp::min(worker_limit.get(), token_count) {
            let worker = Worker {
                id,
                operation,
                from_dir: from_dir.clone(),
                to_dir: to_dir.clone(),
                settings: *settings,
                receiver: receiver.clone(),
            };
            workers.spawn(worker.run(prog_track));
        }
        tracing::debug!("started {} worker(s)", workers.len());
        Self { queue, workers }
    }

    /// Queues every token, waiting whenever the queue is full. Returns `false` if the workers
    /// stopped accepting tokens before all of them were queued.
    async fn feed(&self, tokens: Vec<TransferToken>) -> bool {
        for token in tokens {
            if let Err(error) = self.queue.enqueue(token).await {
                tracing::debug!("{:#}", &error);
                return false;
            }
        }
        self.queue.close();
        true
    }

    /// Join barrier: waits for every worker and merges what they did.
    async fn join(self) -> worker::Outcome {
        let Pool { queue, mut workers } = self;
        // no more tokens are coming, idle workers can leave
        drop(queue);
        let mut total = worker::Outcome::default();
        while let Some(res) = workers.join_next().await {
            match res {
                Ok(outcome) => {
                    total.summary = total.summary + outcome.summary;
                    total.errors.extend(outcome.errors);
                }
                Err(error) => total.errors.push(anyhow!(error).context("worker task failed")),
            }
        }
        total
    }
}

/// Runs a pool over `tokens` and returns what the workers did. `on_queued` is called once every
/// token has been handed to the queue.
#[allow(clippy::too_many_arguments)]
async fn run_pool(
    prog_track: &'static progress::Progress,
    operation: Operation,
    from_dir: PathBuf,
    to_dir: PathBuf,
    tokens: Vec<TransferToken>,
    worker_limit: NonZeroUsize,
    settings: &Settings,
    on_queued: impl FnOnce(),
) -> Result<Summary, Error> {
    let token_count = tokens.len();
    let pool = Pool::start(
        prog_track,
        operation,
        from_dir,
        to_dir,
        settings,
        worker_limit,
        token_count,
    );
    let all_queued = pool.feed(tokens).await;
    if all_queued {
        tracing::debug!("queued {} file(s)", token_count);
        on_queued();
    }
    let mut outcome = pool.join().await;
    if !all_queued && outcome.errors.is_empty() {
        outcome
            .errors
            .push(anyhow!("workers stopped before all files were queued"));
    }
    if !outcome.errors.is_empty() {
        return Err(batch_error(outcome.errors, outcome.summary));
    }
    Ok(outcome.summary)
}

/// Transfers a single file without the pool.
///
/// The "already exists" check is made against `conflict_dir`, not the destination.
async fn transfer_single_file(
    prog_track: &'static progress::Progress,
    request: &TransferRequest,
    settings: &Settings,
    path: &Path,
    name: &OsString,
) -> Result<(Report, Summary), Error> {
    let display_name = name.to_string_lossy().into_owned();
    let conflict = request.conflict_dir.join(name);
    if tokio::fs::try_exists(&conflict)
        .await
        .with_context(|| format!("failed checking whether {:?} exists", &conflict))
        .map_err(|err| Error::new(err, Default::default()))?
    {
        tracing::info!("{:?} already exists, skipping", &conflict);
        return Ok((
            Report::AlreadyExists { name: display_name },
            Summary {
                files_skipped: 1,
                ..Default::default()
            },
        ));
    }
    let into_dir = tokio::fs::metadata(&request.destination)
        .await
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false);
    let target = if into_dir {
        request.destination.join(name)
    } else {
        request.destination.clone()
    };
    let summary = worker::transfer_file(prog_track, request.operation, path, &target, settings)
        .await
        .map_err(|err| {
            Error::new(
                err,
                Summary {
                    files_failed: 1,
                    ..Default::default()
                },
            )
        })?;
    Ok((
        Report::File {
            operation: request.operation,
            name: display_name,
        },
        summary,
    ))
}

async fn create_destination_folder(
    prog_track: &'static progress::Progress,
    path: &Path,
) -> anyhow::Result<Summary> {
    match tokio::fs::create_dir(path).await {
        Ok(()) => {
            prog_track.directories_created.inc();
            Ok(Summary {
                directories_created: 1,
                ..Default::default()
            })
        }
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
            let metadata = tokio::fs::metadata(path)
                .await
                .with_context(|| format!("failed reading metadata from {:?}", &path))?;
            if !metadata.is_dir() {
                return Err(anyhow!("destination {:?} exists and is not a directory", path));
            }
            tracing::debug!("destination folder {:?} already exists, reusing it", path);
            Ok(Summary::default())
        }
        Err(error) => Err(error).with_context(|| format!("cannot create directory {:?}", &path)),
    }
}

async fn transfer_directory(
    prog_track: &'static progress::Progress,
    request: &TransferRequest,
    settings: &Settings,
    dir: &Path,
    folder_name: &OsString,
    on_queued: impl FnOnce(),
) -> Result<Summary, Error> {
    let operation = request.operation;
    let to_dir = request.destination.join(folder_name);
    if let Ok(to_metadata) = tokio::fs::metadata(&to_dir).await {
        let from_metadata = tokio::fs::metadata(dir)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", &dir))
            .map_err(|err| Error::new(err, Default::default()))?;
        if worker::is_same_file(&from_metadata, &to_metadata) {
            return Err(Error::new(
                anyhow!(
                    "cannot {} {:?} into itself, destination folder {:?} is the source folder",
                    operation,
                    dir,
                    &to_dir
                ),
                Default::default(),
            ));
        }
    }
    let mut summary = create_destination_folder(prog_track, &to_dir)
        .await
        .map_err(|err| Error::new(err, Default::default()))?;
    let listing = classify::list_children(dir)
        .await
        .map_err(|err| Error::new(err, summary))?;
    summary.entries_rejected = listing.rejected.len();
    let pool_summary = run_pool(
        prog_track,
        operation,
        dir.to_owned(),
        to_dir,
        listing.tokens,
        request.worker_limit,
        settings,
        on_queued,
    )
    .await
    .map_err(|err| Error::new(err.source, summary + err.summary))?;
    summary = summary + pool_summary;
    if operation == Operation::Move {
        if !listing.rejected.is_empty() {
            return Err(Error::new(
                anyhow!(
                    "not removing {:?}, it still holds nested directories: {:?}",
                    dir,
                    &listing.rejected
                ),
                summary,
            ));
        }
        tracing::debug!("all workers done, removing {:?}", dir);
        tokio::fs::remove_dir(dir)
            .await
            .with_context(|| format!("failed removing directory {:?}", &dir))
            .map_err(|err| Error::new(err, summary))?;
        prog_track.directories_removed.inc();
        summary.directories_removed += 1;
    } else if !listing.rejected.is_empty() {
        tracing::warn!(
            "{} nested director(ies) of {:?} were not copied",
            listing.rejected.len(),
            dir
        );
    }
    Ok(summary)
}

/// Executes one batch and calls `on_report` with its completion line.
///
/// `on_report` is called at most once: on success, or (with `report_early`) as soon as every file
/// of a copy or multi-path batch is queued, in which case the batch may still fail afterwards.
#[instrument(skip(prog_track, on_report))]
pub async fn execute(
    prog_track: &'static progress::Progress,
    request: &TransferRequest,
    settings: &Settings,
    on_report: impl FnOnce(&Report),
) -> Result<Summary, Error> {
    let operation = request.operation;
    let shape = classify::classify(&request.sources)
        .await
        .map_err(|err| Error::new(err.into(), Default::default()))?;
    tracing::debug!("sources classified as: {:?}", &shape);
    let mut on_report = Some(on_report);
    let mut report_now = |report: &Report| {
        if let Some(on_report) = on_report.take() {
            on_report(report);
        }
    };
    let (report, summary) = match shape {
        SourceShape::SingleFile { path, name } => {
            transfer_single_file(prog_track, request, settings, &path, &name).await?
        }
        SourceShape::MultiPath {
            common_parent,
            tokens,
        } => {
            let report = Report::Files(operation);
            let summary = run_pool(
                prog_track,
                operation,
                common_parent,
                request.destination.clone(),
                tokens,
                request.worker_limit,
                settings,
                || {
                    if settings.report_early {
                        report_now(&report);
                    }
                },
            )
            .await?;
            (report, summary)
        }
        SourceShape::SingleDirectory { dir, folder_name } => {
            let report = Report::Folder(operation);
            // a directory move always reports after the source folder is gone
            let early = settings.report_early && operation == Operation::Copy;
            let summary =
                transfer_directory(prog_track, request, settings, &dir, &folder_name, || {
                    if early {
                        report_now(&report);
                    }
                })
                .await?;
            (report, summary)
        }
    };
    report_now(&report);
    Ok(summary)
}
