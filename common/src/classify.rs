//! Decides what a list of source paths means for a transfer.
//!
//! A batch is one of three shapes:
//!
//! - several explicit paths (typically a shell glob), transferred from their deepest common
//!   parent straight into the destination,
//! - a single directory, whose immediate children are transferred into a folder of the same
//!   name under the destination,
//! - a single file, transferred directly without the worker pool.
//!
//! Only one directory level is handled: directories found where files are expected are rejected,
//! never descended into.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::instrument;

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("no sources were given")]
    NoSources,
    #[error("no such file or directory: {0:?}")]
    NotFound(PathBuf),
    #[error("{0:?} is a directory, nested directories are not supported")]
    NestedDirectory(PathBuf),
    #[error("more than one source is named {0:?}")]
    DuplicateName(OsString),
    #[error("{0:?} is neither a regular file nor a directory")]
    Unsupported(PathBuf),
    #[error("cannot determine the name of {0:?}")]
    NoFileName(PathBuf),
    #[error("failed reading metadata from {path:?}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One file to transfer: `source` is relative to the batch's source directory, `name` is what
/// the file is called under the destination directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferToken {
    pub source: PathBuf,
    pub name: OsString,
}

impl TransferToken {
    pub fn from_name(name: OsString) -> Self {
        Self {
            source: PathBuf::from(&name),
            name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceShape {
    MultiPath {
        common_parent: PathBuf,
        tokens: Vec<TransferToken>,
    },
    SingleDirectory {
        dir: PathBuf,
        folder_name: OsString,
    },
    SingleFile {
        path: PathBuf,
        name: OsString,
    },
}

async fn probe(path: &Path) -> Result<Option<std::fs::Metadata>, ClassifyError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ClassifyError::Metadata {
            path: path.to_owned(),
            source,
        }),
    }
}

fn absolute(path: &Path) -> Result<PathBuf, ClassifyError> {
    std::path::absolute(path).map_err(|source| ClassifyError::Metadata {
        path: path.to_owned(),
        source,
    })
}

/// Deepest directory that contains every one of `paths`.
///
/// Paths are expected to be absolute; `None` when there is nothing in common (e.g. mixing
/// absolute and relative paths) or when `paths` is empty.
pub fn common_parent(paths: &[PathBuf]) -> Option<PathBuf> {
    let mut parents = paths.iter().map(|path| path.parent().unwrap_or(path));
    let mut common: Vec<_> = parents.next()?.components().collect();
    for parent in parents {
        let shared = common
            .iter()
            .zip(parent.components())
            .take_while(|(a, b)| *a == b)
            .count();
        common.truncate(shared);
    }
    if common.is_empty() {
        return None;
    }
    Some(common.iter().collect())
}

#[instrument]
pub async fn classify(sources: &[PathBuf]) -> Result<SourceShape, ClassifyError> {
    match sources {
        [] => Err(ClassifyError::NoSources),
        [single] => classify_single(single).await,
        _ => classify_multi(sources).await,
    }
}

async fn classify_single(path: &Path) -> Result<SourceShape, ClassifyError> {
    let Some(metadata) = probe(path).await? else {
        return Err(ClassifyError::NotFound(path.to_owned()));
    };
    if metadata.is_dir() {
        // "." and friends have no name of their own
        let folder_name = match path.file_name() {
            Some(name) => name.to_owned(),
            None => tokio::fs::canonicalize(path)
                .await
                .map_err(|source| ClassifyError::Metadata {
                    path: path.to_owned(),
                    source,
                })?
                .file_name()
                .ok_or_else(|| ClassifyError::NoFileName(path.to_owned()))?
                .to_owned(),
        };
        return Ok(SourceShape::SingleDirectory {
            dir: path.to_owned(),
            folder_name,
        });
    }
    if metadata.is_file() {
        let name = path
            .file_name()
            .ok_or_else(|| ClassifyError::NoFileName(path.to_owned()))?
            .to_owned();
        return Ok(SourceShape::SingleFile {
            path: path.to_owned(),
            name,
        });
    }
    Err(ClassifyError::Unsupported(path.to_owned()))
}

async fn classify_multi(sources: &[PathBuf]) -> Result<SourceShape, ClassifyError> {
    let mut absolute_sources = Vec::with_capacity(sources.len());
    let mut names = std::collections::HashSet::with_capacity(sources.len());
    for source in sources {
        let Some(metadata) = probe(source).await? else {
            return Err(ClassifyError::NotFound(source.to_owned()));
        };
        if metadata.is_dir() {
            return Err(ClassifyError::NestedDirectory(source.to_owned()));
        }
        let name = source
            .file_name()
            .ok_or_else(|| ClassifyError::NoFileName(source.to_owned()))?;
        if !names.insert(name.to_owned()) {
            return Err(ClassifyError::DuplicateName(name.to_owned()));
        }
        absolute_sources.push(absolute(source)?);
    }
    // absolute paths always share at least the root
    let common_parent = common_parent(&absolute_sources).unwrap_or_else(|| PathBuf::from("/"));
    let tokens = absolute_sources
        .iter()
        .filter_map(|source| {
            let name = source.file_name()?.to_owned();
            let relative = match source.strip_prefix(&common_parent) {
                Ok(relative) => relative.to_owned(),
                Err(_) => PathBuf::from(&name),
            };
            Some(TransferToken {
                source: relative,
                name,
            })
        })
        .collect();
    Ok(SourceShape::MultiPath {
        common_parent,
        tokens,
    })
}

/// Children of a directory as seen once, at the start of a batch.
#[derive(Debug, Default)]
pub struct Listing {
    pub tokens: Vec<TransferToken>,
    /// Subdirectories, which are not transferred.
    pub rejected: Vec<PathBuf>,
}

#[instrument]
pub async fn list_children(dir: &Path) -> anyhow::Result<Listing> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", &dir))?;
    let mut listing = Listing::default();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &dir))?
    {
        let entry_path = entry.path();
        // follow symlinks the same way the copy does
        let is_dir = match tokio::fs::metadata(&entry_path).await {
            Ok(metadata) => metadata.is_dir(),
            Err(error) => {
                // the worker reports the failure when it gets to this entry
                tracing::warn!(
                    "failed reading metadata from {:?}, queueing it as a file: {}",
                    &entry_path,
                    error
                );
                false
            }
        };
        if is_dir {
            tracing::warn!("skipping nested directory {:?}", &entry_path);
            listing.rejected.push(entry_path);
            continue;
        }
        listing.tokens.push(TransferToken::from_name(entry.file_name()));
    }
    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn common_parent_of_siblings() {
        let paths = vec![PathBuf::from("/src/a"), PathBuf::from("/src/b")];
        assert_eq!(common_parent(&paths), Some(PathBuf::from("/src")));
    }

    #[test]
    fn common_parent_of_cousins() {
        let paths = vec![
            PathBuf::from("/src/x/a"),
            PathBuf::from("/src/y/b"),
            PathBuf::from("/src/x/c"),
        ];
        assert_eq!(common_parent(&paths), Some(PathBuf::from("/src")));
    }

    #[test]
    fn common_parent_of_same_path_is_its_parent() {
        let paths = vec![PathBuf::from("/src/a"), PathBuf::from("/src/a")];
        assert_eq!(common_parent(&paths), Some(PathBuf::from("/src")));
    }

    #[test]
    fn no_common_parent_for_mixed_paths() {
        let paths = vec![PathBuf::from("/src/a"), PathBuf::from("rel/b")];
        assert_eq!(common_parent(&paths), None);
        assert_eq!(common_parent(&[]), None);
    }

    fn absolute_path() -> impl Strategy<Value = PathBuf> {
        prop::collection::vec("[a-c]{1,2}", 1..5).prop_map(|parts| {
            let mut path = PathBuf::from("/");
            path.extend(parts);
            path
        })
    }

    proptest! {
        #[test]
        fn common_parent_is_deepest_shared_ancestor(
            paths in prop::collection::vec(absolute_path(), 2..6)
        ) {
            let common = common_parent(&paths).expect("absolute paths share the root");
            let depth = common.components().count();
            for path in &paths {
                prop_assert!(path.parent().unwrap().starts_with(&common));
            }
            // one component deeper is no longer shared by everyone
            let next: Vec<_> = paths
                .iter()
                .map(|path| path.parent().unwrap().components().nth(depth))
                .collect();
            let all_same = next[0].is_some() && next.iter().all(|c| *c == next[0]);
            prop_assert!(!all_same);
        }
    }

    #[tokio::test]
    async fn single_file_and_directory() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let file = tmp_dir.path().join("0.txt");
        tokio::fs::write(&file, "0").await?;
        assert_eq!(
            classify(std::slice::from_ref(&file)).await?,
            SourceShape::SingleFile {
                path: file.clone(),
                name: "0.txt".into(),
            }
        );
        let dir = tmp_dir.path().join("foo");
        tokio::fs::create_dir(&dir).await?;
        assert_eq!(
            classify(std::slice::from_ref(&dir)).await?,
            SourceShape::SingleDirectory {
                dir: dir.clone(),
                folder_name: "foo".into(),
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_is_not_found() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let missing = tmp_dir.path().join("missing");
        let error = classify(std::slice::from_ref(&missing)).await.unwrap_err();
        assert!(matches!(error, ClassifyError::NotFound(path) if path == missing));
        let present = tmp_dir.path().join("present");
        tokio::fs::write(&present, "x").await?;
        let error = classify(&[present, missing.clone()]).await.unwrap_err();
        assert!(matches!(error, ClassifyError::NotFound(path) if path == missing));
        Ok(())
    }

    #[tokio::test]
    async fn multi_path_tokens() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src");
        tokio::fs::create_dir_all(src.join("x")).await?;
        tokio::fs::write(src.join("a"), "a").await?;
        tokio::fs::write(src.join("x").join("b"), "b").await?;
        let shape = classify(&[src.join("a"), src.join("x").join("b")]).await?;
        assert_eq!(
            shape,
            SourceShape::MultiPath {
                common_parent: src.clone(),
                tokens: vec![
                    TransferToken::from_name("a".into()),
                    TransferToken {
                        source: PathBuf::from("x/b"),
                        name: "b".into(),
                    },
                ],
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn multi_path_rejects_directories_and_duplicates() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let root = tmp_dir.path();
        tokio::fs::create_dir_all(root.join("x")).await?;
        tokio::fs::create_dir_all(root.join("y")).await?;
        tokio::fs::write(root.join("a"), "a").await?;
        tokio::fs::write(root.join("x").join("a"), "a").await?;
        let error = classify(&[root.join("a"), root.join("y")]).await.unwrap_err();
        assert!(matches!(error, ClassifyError::NestedDirectory(_)));
        let error = classify(&[root.join("a"), root.join("x").join("a")])
            .await
            .unwrap_err();
        assert!(matches!(error, ClassifyError::DuplicateName(name) if name == "a"));
        Ok(())
    }

    #[tokio::test]
    async fn listing_is_one_level() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let dir = tmp_dir.path();
        tokio::fs::write(dir.join("0.txt"), "0").await?;
        tokio::fs::write(dir.join("1.txt"), "1").await?;
        tokio::fs::create_dir(dir.join("bar")).await?;
        tokio::fs::write(dir.join("bar").join("2.txt"), "2").await?;
        let listing = list_children(dir).await?;
        let mut names: Vec<_> = listing.tokens.iter().map(|t| t.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec![OsString::from("0.txt"), OsString::from("1.txt")]);
        assert_eq!(listing.rejected, vec![dir.join("bar")]);
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_entry_is_queued_not_rejected() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let dir = tmp_dir.path();
        tokio::fs::write(dir.join("0.txt"), "0").await?;
        tokio::fs::symlink(dir.join("missing"), dir.join("dangling")).await?;
        let listing = list_children(dir).await?;
        let mut names: Vec<_> = listing.tokens.iter().map(|t| t.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec![OsString::from("0.txt"), OsString::from("dangling")]);
        assert!(listing.rejected.is_empty());
        Ok(())
    }
}
