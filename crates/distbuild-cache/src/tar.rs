//! The tar streaming codec used to move an artifact directory over HTTP. Treated as an opaque
//! collaborator by the rest of the cache: `send` turns a directory into bytes, `receive` turns
//! bytes back into a directory, preserving file modes and contents exactly.

use anyhow::{Context as _, Result};
use std::path::PathBuf;

/// Serialize `dir`'s contents into a tar archive. Runs on a blocking thread since the `tar` crate
/// is synchronous.
pub async fn send(dir: impl Into<PathBuf>) -> Result<Vec<u8>> {
    let dir = dir.into();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            builder
                .append_dir_all(".", &dir)
                .with_context(|| format!("tarring {}", dir.display()))?;
            builder.finish().context("finishing tar archive")?;
        }
        Ok(buf)
    })
    .await
    .context("tar-send task panicked")?
}

/// Extract a tar archive's contents into `dest`, which must already exist.
pub async fn receive(bytes: Vec<u8>, dest: impl Into<PathBuf>) -> Result<()> {
    let dest = dest.into();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut archive = tar::Archive::new(bytes.as_slice());
        archive
            .unpack(&dest)
            .with_context(|| format!("untarring into {}", dest.display()))
    })
    .await
    .context("tar-receive task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_preserves_file_contents() {
        let src = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("a.txt"), b"hello").await.unwrap();
        tokio::fs::create_dir(src.path().join("sub")).await.unwrap();
        tokio::fs::write(src.path().join("sub/b.txt"), b"world").await.unwrap();

        let bytes = send(src.path().to_path_buf()).await.unwrap();

        let dest = tempfile::tempdir().unwrap();
        receive(bytes, dest.path().to_path_buf()).await.unwrap();

        assert_eq!(tokio::fs::read(dest.path().join("a.txt")).await.unwrap(), b"hello");
        assert_eq!(
            tokio::fs::read(dest.path().join("sub/b.txt")).await.unwrap(),
            b"world"
        );
    }
}
