use crate::progress::Progress;

/// Fresh counters for a single test, so concurrently running tests don't see each other.
pub fn progress() -> &'static Progress {
    Box::leak(Box::new(Progress::new()))
}

/// Creates a source folder with `count` files:
///
/// ```text
/// <tmp>/src/foo
///   |- 0.txt
///   |- 1.txt
///   |- ...
/// <tmp>/dst
/// ```
///
/// File `i.txt` contains the string `i` repeated `i + 1` times.
pub async fn setup_test_dir(count: usize) -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::tempdir()?;
    let foo_path = tmp_dir.path().join("src").join("foo");
    tokio::fs::create_dir_all(&foo_path).await?;
    tokio::fs::create_dir(tmp_dir.path().join("dst")).await?;
    for i in 0..count {
        tokio::fs::write(foo_path.join(format!("{i}.txt")), i.to_string().repeat(i + 1)).await?;
    }
    Ok(tmp_dir)
}

/// Asserts every file named in `names` has the same content in `dst` as in `src`.
pub async fn check_files_identical(
    src: &std::path::Path,
    dst: &std::path::Path,
    names: &[String],
) -> anyhow::Result<()> {
    use anyhow::Context;
    for name in names {
        let src_contents = tokio::fs::read(src.join(name))
            .await
            .with_context(|| format!("Source file {:?} is missing!", src.join(name)))?;
        let dst_contents = tokio::fs::read(dst.join(name))
            .await
            .with_context(|| format!("Destination file {:?} is missing!", dst.join(name)))?;
        assert_eq!(src_contents, dst_contents, "{name} differs");
    }
    Ok(())
}

/// Names of the entries directly under `dir`, sorted.
pub async fn entry_names(dir: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = vec![];
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
