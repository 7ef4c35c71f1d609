use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::instrument;

use crate::preserve;
use crate::progress;
use crate::queue::TokenReceiver;
use crate::transfer::{Operation, Settings, Summary};

/// Copies `src` to `dst`, overwriting whatever `dst` was, then applies the preserve settings.
#[instrument(skip(prog_track))]
async fn copy_file(
    prog_track: &'static progress::Progress,
    src: &Path,
    dst: &Path,
    src_metadata: &std::fs::Metadata,
    preserve: &preserve::Settings,
) -> anyhow::Result<Summary> {
    tracing::debug!("copying data");
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("failed copying {:?} to {:?}", &src, &dst))?;
    tracing::debug!("setting permissions");
    preserve::set_file_metadata(preserve, src_metadata, dst).await?;
    prog_track.bytes_transferred.add(src_metadata.len());
    Ok(Summary {
        bytes_transferred: src_metadata.len(),
        ..Default::default()
    })
}

#[instrument(skip(prog_track))]
async fn move_file(
    prog_track: &'static progress::Progress,
    src: &Path,
    dst: &Path,
    src_metadata: &std::fs::Metadata,
) -> anyhow::Result<Summary> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => {
            prog_track.bytes_transferred.add(src_metadata.len());
            Ok(Summary {
                bytes_transferred: src_metadata.len(),
                ..Default::default()
            })
        }
        Err(error) if error.raw_os_error() == Some(libc::EXDEV) => {
            tracing::debug!("{:?} and {:?} are on different filesystems, copying", src, dst);
            // a moved file keeps its full mode and timestamps
            let keep = preserve::Settings {
                user_and_time: preserve::UserAndTimeSettings {
                    time: true,
                    ..Default::default()
                },
                mode_mask: 0o7777,
            };
            let summary = copy_file(prog_track, src, dst, src_metadata, &keep).await?;
            tokio::fs::remove_file(src)
                .await
                .with_context(|| format!("failed removing {:?} after copying it", &src))?;
            Ok(summary)
        }
        Err(error) => {
            Err(error).with_context(|| format!("failed moving {:?} to {:?}", &src, &dst))
        }
    }
}

/// Both metadata describe the same inode on the same device.
pub fn is_same_file(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

async fn check_not_same_file(
    src: &Path,
    src_metadata: &std::fs::Metadata,
    dst: &Path,
) -> anyhow::Result<()> {
    match tokio::fs::metadata(dst).await {
        Ok(dst_metadata) if is_same_file(src_metadata, &dst_metadata) => Err(anyhow!(
            "{:?} and {:?} are the same file",
            src,
            dst
        )),
        _ => Ok(()),
    }
}

/// Transfers a single file from `src` to `dst`.
///
/// Waits for the throttle permits first, then copies or moves. An existing `dst` is overwritten
/// by a copy and replaced by a move, unless it is `src` itself, which fails the transfer.
#[instrument(skip(prog_track))]
pub async fn transfer_file(
    prog_track: &'static progress::Progress,
    operation: Operation,
    src: &Path,
    dst: &Path,
    settings: &Settings,
) -> anyhow::Result<Summary> {
    throttle::get_ops_token().await;
    let _open_file_guard = throttle::open_file_permit().await;
    let _ops_guard = prog_track.transfers.guard();
    let src_metadata = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", &src))?;
    check_not_same_file(src, &src_metadata, dst).await?;
    throttle::get_file_iops_tokens(settings.chunk_size, src_metadata.len()).await;
    let summary = match operation {
        Operation::Copy => {
            let summary =
                copy_file(prog_track, src, dst, &src_metadata, &settings.preserve).await?;
            prog_track.files_copied.inc();
            Summary {
                files_copied: 1,
                ..summary
            }
        }
        Operation::Move => {
            let summary = move_file(prog_track, src, dst, &src_metadata).await?;
            prog_track.files_moved.inc();
            Summary {
                files_moved: 1,
                ..summary
            }
        }
    };
    Ok(summary)
}

/// What a worker did before the queue ran dry (or it gave up).
#[derive(Debug, Default)]
pub struct Outcome {
    pub summary: Summary,
    pub errors: Vec<anyhow::Error>,
}

/// One member of the pool: pulls tokens until the queue is closed and drained, transferring each
/// from `from_dir` to `to_dir`.
#[derive(Debug)]
pub struct Worker {
    pub id: usize,
    pub operation: Operation,
    pub from_dir: Arc<PathBuf>,
    pub to_dir: Arc<PathBuf>,
    pub settings: Settings,
    pub receiver: TokenReceiver,
}

impl Worker {
    #[instrument(skip(self, prog_track), fields(worker = self.id))]
    pub async fn run(self, prog_track: &'static progress::Progress) -> Outcome {
        let mut outcome = Outcome::default();
        while let Some(token) = self.receiver.dequeue().await {
            let src = self.from_dir.join(&token.source);
            let dst = self.to_dir.join(&token.name);
            match transfer_file(prog_track, self.operation, &src, &dst, &self.settings).await {
                Ok(summary) => outcome.summary = outcome.summary + summary,
                Err(error) => {
                    tracing::error!("{:#}", &error);
                    outcome.summary.files_failed += 1;
                    outcome.errors.push(error);
                    if self.settings.fail_early {
                        // stop the producer too, nobody is going to pick up the rest
                        self.receiver.close();
                        break;
                    }
                }
            }
        }
        tracing::debug!("worker done: {:?}", &outcome.summary);
        outcome
    }
}
