//! Fetches a job's inputs into local caches before execution: source files from the coordinator,
//! dependency artifacts peer-to-peer from whichever worker the coordinator's heartbeat response
//! pointed us at. Already-cached IDs are skipped, which is the common case once a worker has
//! built up a working set.

use anyhow::{Context as _, Result};
use distbuild_base::Id;
use distbuild_cache::{tar, ArtifactCache, FileCache};
use distbuild_util::config::CoordinatorAddr;
use distbuild_util::fs::Fs;
use std::path::Path;

/// Download a coordinator-held source file into `cache`, unless it's already committed.
pub async fn ensure_source_file(
    client: &reqwest::Client,
    coordinator: &CoordinatorAddr,
    cache: &FileCache,
    id: Id,
) -> Result<()> {
    if cache.contains(&id) {
        return Ok(());
    }
    let url = coordinator
        .url()
        .join(&format!("/coordinator/file?id={id}"))
        .context("building source-file URL")?;
    let bytes = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("downloading source file {id}"))?
        .bytes()
        .await
        .with_context(|| format!("reading source file body {id}"))?;

    let mut handle = cache
        .write(id)
        .await
        .with_context(|| format!("staging source file {id}"))?;
    handle.write_all(&bytes).await?;
    handle.commit().await.with_context(|| format!("committing source file {id}"))?;
    Ok(())
}

/// Download a peer-built artifact directory into `cache`, unless it's already committed.
pub async fn ensure_artifact(
    client: &reqwest::Client,
    worker_endpoint: &str,
    cache: &ArtifactCache,
    id: Id,
) -> Result<()> {
    if cache.contains(&id) {
        return Ok(());
    }
    let url = format!("{worker_endpoint}/worker/artifact?id={id}");
    let bytes = client
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("downloading artifact {id} from {worker_endpoint}"))?
        .bytes()
        .await
        .with_context(|| format!("reading artifact body {id}"))?;

    let handle = cache
        .create(id)
        .await
        .with_context(|| format!("staging artifact {id}"))?;
    tar::receive(bytes.to_vec(), handle.path().to_path_buf())
        .await
        .with_context(|| format!("unpacking artifact {id}"))?;
    handle.commit().await.with_context(|| format!("committing artifact {id}"))?;
    Ok(())
}

/// Ensure `id` is present in `cache` (downloading it from the coordinator if not), then hard-link
/// it into `source_dir` at `logical_path`. Used to materialize a job's declared `Inputs` into its
/// fresh source working directory just before execution. Dependency artifact directories are
/// deliberately NOT merged into the source tree the same way; the job executor read-locks and
/// references them directly by path via the render context instead (see `render::RenderContext`).
pub async fn link_source_file(
    client: &reqwest::Client,
    coordinator: &CoordinatorAddr,
    cache: &FileCache,
    source_dir: &Path,
    id: Id,
    logical_path: &Path,
) -> Result<()> {
    ensure_source_file(client, coordinator, cache, id).await?;
    let handle = cache.get(id).await.with_context(|| format!("reading cached source file {id}"))?;
    let dest = source_dir.join(logical_path);
    let fs = Fs::new();
    if let Some(parent) = dest.parent() {
        fs.create_dir_all(parent).await?;
    }
    fs.hard_link(handle.path(), &dest).await?;
    handle.release();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn link_source_file_skips_redownload_when_cached() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(cache_dir.path()).await.unwrap();
        let id = Id([9; 16]);

        let mut handle = cache.write(id).await.unwrap();
        handle.write_all(b"hello").await.unwrap();
        handle.commit().await.unwrap();

        let source_dir = tempfile::tempdir().unwrap();
        let coordinator: distbuild_util::config::CoordinatorAddr = "http://127.0.0.1:1".parse().unwrap();
        let client = reqwest::Client::new();

        link_source_file(&client, &coordinator, &cache, source_dir.path(), id, Path::new("nested/x.txt"))
            .await
            .unwrap();

        let contents = tokio::fs::read(source_dir.path().join("nested/x.txt")).await.unwrap();
        assert_eq!(contents, b"hello");
    }
}
