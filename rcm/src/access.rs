//! Permission checks made before a batch touches anything.

use std::path::Path;

use anyhow::{Context, anyhow};
use nix::unistd::{AccessFlags, access};

fn check(path: &Path, mode: AccessFlags, what: &str) -> anyhow::Result<()> {
    access(path, mode).with_context(|| format!("insufficient permissions on {} {:?}", what, path))
}

/// Every existing source must be readable, directories also searchable. A move also needs to
/// unlink from the source's parent. Missing sources are left for the batch to report.
pub async fn check_sources(
    operation: common::Operation,
    sources: &[std::path::PathBuf],
) -> anyhow::Result<()> {
    for source in sources {
        let metadata = match tokio::fs::metadata(source).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
            Err(error) => {
                return Err(error).with_context(|| format!("cannot access source {:?}", source));
            }
        };
        let mode = if metadata.is_dir() {
            AccessFlags::R_OK | AccessFlags::X_OK
        } else {
            AccessFlags::R_OK
        };
        check(source, mode, "source")?;
        if operation == common::Operation::Move {
            let parent = match source.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            check(
                parent,
                AccessFlags::W_OK | AccessFlags::X_OK,
                "parent directory",
            )?;
        }
    }
    Ok(())
}

pub async fn check_destination(destination: &Path) -> anyhow::Result<()> {
    let metadata = tokio::fs::metadata(destination)
        .await
        .with_context(|| format!("cannot access destination {:?}", destination))?;
    if !metadata.is_dir() {
        return Err(anyhow!("destination {:?} is not a directory", destination));
    }
    check(
        destination,
        AccessFlags::W_OK | AccessFlags::X_OK,
        "destination",
    )
}
