use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{RelayError, Result};

/// Content type recorded for uploads unless the caller says otherwise.
pub const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

/// Readable handle to a stored blob.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Storage seam consumed by the media pipeline and the gateway.
///
/// The in-tree implementation is filesystem-backed; an object-store client
/// plugs in behind the same trait.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create the backing bucket/directory if it does not exist yet.
    async fn ensure_bucket(&self) -> Result<()>;

    /// Open a blob for reading.
    async fn get(&self, name: &str) -> Result<BlobReader>;

    /// Store a blob, replacing any previous content under the same name.
    /// Returns the number of bytes written.
    async fn put(&self, name: &str, reader: BlobReader, content_type: &str) -> Result<u64>;

    /// Names of all stored blobs, sorted.
    async fn list(&self) -> Result<Vec<String>>;

    async fn remove(&self, name: &str) -> Result<()>;
}

/// Filesystem-backed blob store rooted at a single directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(sanitize_name(name)?))
    }
}

/// Blob names must be bare file names: no separators, no traversal, no
/// hidden-file prefix. Anything else is rejected before it touches the disk.
fn sanitize_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.len() > 255 {
        return Err(RelayError::BadRequest(format!(
            "invalid video name length: {}",
            name.len()
        )));
    }
    if name.starts_with('.')
        || name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
    {
        return Err(RelayError::BadRequest(format!(
            "invalid video name: {name:?}"
        )));
    }
    Ok(name)
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn ensure_bucket(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<BlobReader> {
        let path = self.blob_path(name)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RelayError::NotFound(format!("no such video: {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    // content_type is part of the trait contract for object-store backends;
    // the filesystem keeps no metadata.
    async fn put(&self, name: &str, mut reader: BlobReader, _content_type: &str) -> Result<u64> {
        let name = sanitize_name(name)?;
        let path = self.root.join(name);
        let tmp_path = self.root.join(format!("{name}.tmp-upload"));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let written = match tokio::io::copy(&mut reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }
        };
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::debug!(name, written, "blob stored");
        Ok(written)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // skip interrupted uploads
            if name.ends_with(".tmp-upload") {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let path = self.blob_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RelayError::NotFound(format!("no such video: {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}
