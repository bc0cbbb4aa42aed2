//! Video blobs on the local filesystem.

use std::{
    fs,
    io::{self, SeekFrom},
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, Take},
};
use tokio_util::io::ReaderStream;

/// Bytes of a blob restricted to an inclusive window.
pub type BlobStream = ReaderStream<Take<File>>;

/// Blobs live flat inside one directory and are addressed by filename only.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `filename` below the root. Names that are not a single plain
    /// path segment resolve to nothing.
    pub fn resolve(&self, filename: &str) -> Option<PathBuf> {
        is_plain_segment(filename).then(|| self.root.join(filename))
    }

    /// Actual size of a stored blob, or `None` when it is absent.
    pub async fn stat_size(&self, filename: &str) -> Result<Option<u64>> {
        let Some(path) = self.resolve(filename) else {
            return Ok(None);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
        }
    }

    /// Opens a stream over bytes `start..=end` of a blob. Dropping the stream
    /// closes the file.
    pub async fn open_byte_range(&self, filename: &str, start: u64, end: u64) -> Result<BlobStream> {
        let path = self
            .resolve(filename)
            .with_context(|| format!("invalid blob name {filename:?}"))?;
        if end < start {
            bail!("empty byte range {start}-{end} for {}", path.display());
        }
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        if start > 0 {
            file.seek(SeekFrom::Start(start))
                .await
                .with_context(|| format!("seeking {} to {start}", path.display()))?;
        }
        Ok(ReaderStream::new(file.take(end - start + 1)))
    }

    /// Copies `source` into the store under `filename`, atomically.
    pub fn import(&self, source: &Path, filename: &str) -> Result<u64> {
        let target = self
            .resolve(filename)
            .with_context(|| format!("invalid blob name {filename:?}"))?;
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;
        let mut input =
            fs::File::open(source).with_context(|| format!("opening {}", source.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .with_context(|| format!("creating temp file in {}", self.root.display()))?;
        let copied = io::copy(&mut input, &mut tmp)
            .with_context(|| format!("copying {}", source.display()))?;
        tmp.persist(&target)
            .with_context(|| format!("persisting {}", target.display()))?;
        Ok(copied)
    }

    /// Deletes a blob. Missing blobs are not an error.
    pub fn remove(&self, filename: &str) -> Result<bool> {
        let Some(path) = self.resolve(filename) else {
            return Ok(false);
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

/// Content-addressed blob name for `source`: the first 32 hex characters of
/// its BLAKE3 hash plus the lowercased original extension.
pub fn content_filename(source: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut input =
        fs::File::open(source).with_context(|| format!("opening {}", source.display()))?;
    io::copy(&mut input, &mut hasher).with_context(|| format!("hashing {}", source.display()))?;
    let digest = hasher.finalize().to_hex();
    let ext = source
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "bin".to_string());
    Ok(format!("{}.{ext}", &digest[..32]))
}

fn is_plain_segment(value: &str) -> bool {
    let mut components = Path::new(value).components();
    !value.is_empty()
        && matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
}
