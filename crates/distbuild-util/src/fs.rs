//! A thin wrapper around [`tokio::fs`] that reports errors with the offending path attached, the
//! way every component in this workspace expects to handle I/O.

use anyhow::{Context as _, Result};
use std::path::Path;
use tokio::fs::File;

#[derive(Clone, Copy, Default)]
pub struct Fs;

impl Fs {
    pub fn new() -> Self {
        Self
    }

    pub async fn open_file(&self, path: impl AsRef<Path>) -> Result<File> {
        let path = path.as_ref();
        File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))
    }

    pub async fn create_file(&self, path: impl AsRef<Path>) -> Result<File> {
        let path = path.as_ref();
        File::create(path)
            .await
            .with_context(|| format!("creating {}", path.display()))
    }

    pub async fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("creating directory {}", path.display()))
    }

    pub async fn remove_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("removing directory {}", path.display()))
    }

    pub async fn remove_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("removing file {}", path.display()))
    }

    pub async fn hard_link(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let (from, to) = (from.as_ref(), to.as_ref());
        tokio::fs::hard_link(from, to)
            .await
            .with_context(|| format!("hard-linking {} to {}", from.display(), to.display()))
    }

    pub async fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let (from, to) = (from.as_ref(), to.as_ref());
        tokio::fs::rename(from, to)
            .await
            .with_context(|| format!("renaming {} to {}", from.display(), to.display()))
    }

    pub async fn exists(&self, path: impl AsRef<Path>) -> bool {
        tokio::fs::try_exists(path.as_ref()).await.unwrap_or(false)
    }

    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    pub async fn write(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}
