//! Local content storage.
//!
//! The pull-through services wrap a [`ManifestService`] and a [`BlobService`]
//! for the repository being served. [`FileStore`] is the on-disk
//! implementation the gateway ships with.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use sha2::Digest as _;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::digest::Digest;
use crate::error::{Error, Result};

/// Manifests stored locally for one repository.
///
/// `get` must fail with [`Error::ContentUnknown`] when the manifest is absent
/// so that callers can tell a miss from a storage fault.
#[async_trait]
pub trait ManifestService: Send + Sync {
    /// Whether a manifest with this digest is stored.
    async fn exists(&self, digest: &Digest) -> Result<bool>;
    /// The stored manifest bytes.
    async fn get(&self, digest: &Digest) -> Result<Vec<u8>>;
    /// Store a manifest and return its digest.
    async fn put(&self, content: Vec<u8>) -> Result<Digest>;
    /// Remove a stored manifest.
    async fn delete(&self, digest: &Digest) -> Result<()>;
}

/// The bytes of a blob, produced as they are read.
pub type BlobStream = BoxStream<'static, Result<Bytes>>;

/// Blobs stored locally for one repository.
#[async_trait]
pub trait BlobService: Send + Sync {
    /// The size of a stored blob, or [`Error::ContentUnknown`].
    async fn stat(&self, digest: &Digest) -> Result<u64>;
    /// The stored blob bytes, or [`Error::ContentUnknown`].
    async fn get(&self, digest: &Digest) -> Result<BlobStream>;
    /// Store a blob and return its digest.
    async fn put(&self, content: Vec<u8>) -> Result<Digest>;
}

#[async_trait]
impl<T: ManifestService + ?Sized> ManifestService for Arc<T> {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        self.as_ref().exists(digest).await
    }

    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        ManifestService::get(self.as_ref(), digest).await
    }

    async fn put(&self, content: Vec<u8>) -> Result<Digest> {
        ManifestService::put(self.as_ref(), content).await
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        self.as_ref().delete(digest).await
    }
}

#[async_trait]
impl<T: BlobService + ?Sized> BlobService for Arc<T> {
    async fn stat(&self, digest: &Digest) -> Result<u64> {
        self.as_ref().stat(digest).await
    }

    async fn get(&self, digest: &Digest) -> Result<BlobStream> {
        BlobService::get(self.as_ref(), digest).await
    }

    async fn put(&self, content: Vec<u8>) -> Result<Digest> {
        BlobService::put(self.as_ref(), content).await
    }
}

/// Content addressed storage on the local file system.
///
/// Content lives under
/// `<root>/repositories/<namespace>/<name>/{manifests,blobs}/<algorithm>/<hex>`.
#[derive(Clone, Debug)]
pub struct FileStore {
    root_dir: PathBuf,
}

impl FileStore {
    /// Create a new `FileStore`
    pub fn new<T: AsRef<Path>>(root_dir: T) -> Self {
        Self {
            root_dir: root_dir.as_ref().into(),
        }
    }

    /// Storage scoped to a single repository.
    pub fn repository(&self, namespace: &str, name: &str) -> FileRepository {
        let mut path = self.root_dir.join("repositories");
        path.push(namespace);
        path.push(name);
        FileRepository { root_dir: path }
    }
}

/// One repository's slice of a [`FileStore`].
#[derive(Clone, Debug)]
pub struct FileRepository {
    root_dir: PathBuf,
}

impl FileRepository {
    fn content_path(&self, kind: &str, digest: &Digest) -> Option<PathBuf> {
        let (algorithm, hex) = digest.split()?;
        let mut path = self.root_dir.join(kind);
        path.push(algorithm);
        path.push(hex);
        Some(path)
    }

    async fn read(&self, kind: &str, digest: &Digest) -> Result<Vec<u8>> {
        let path = self
            .content_path(kind, digest)
            .ok_or_else(|| Error::ContentUnknown(digest.clone()))?;
        match tokio::fs::read(&path).await {
            Ok(content) => {
                debug!(?path, "Read content from disk");
                Ok(content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ContentUnknown(digest.clone()))
            }
            Err(e) => Err(Error::Other(e.into())),
        }
    }

    async fn write(&self, kind: &str, content: Vec<u8>) -> Result<Digest> {
        let digest = Digest::new_unchecked(format!("sha256:{:x}", sha2::Sha256::digest(&content)));
        let path = self
            .content_path(kind, &digest)
            .ok_or_else(|| anyhow::anyhow!("computed digest {} has no algorithm", digest))?;
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("content path {:?} has no parent", path))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(anyhow::Error::from)?;
        // Readers must never observe a partially written file.
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, &content)
            .await
            .map_err(anyhow::Error::from)?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(anyhow::Error::from)?;
        debug!(?path, %digest, "Stored content");
        Ok(digest)
    }
}

#[async_trait]
impl ManifestService for FileRepository {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(match self.content_path("manifests", digest) {
            Some(path) => tokio::fs::metadata(path).await.is_ok(),
            None => false,
        })
    }

    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.read("manifests", digest).await
    }

    async fn put(&self, content: Vec<u8>) -> Result<Digest> {
        self.write("manifests", content).await
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        let path = self
            .content_path("manifests", digest)
            .ok_or_else(|| Error::ContentUnknown(digest.clone()))?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ContentUnknown(digest.clone()))
            }
            Err(e) => Err(Error::Other(e.into())),
        }
    }
}

#[async_trait]
impl BlobService for FileRepository {
    async fn stat(&self, digest: &Digest) -> Result<u64> {
        let path = self
            .content_path("blobs", digest)
            .ok_or_else(|| Error::ContentUnknown(digest.clone()))?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ContentUnknown(digest.clone()))
            }
            Err(e) => Err(Error::Other(e.into())),
        }
    }

    async fn get(&self, digest: &Digest) -> Result<BlobStream> {
        let path = self
            .content_path("blobs", digest)
            .ok_or_else(|| Error::ContentUnknown(digest.clone()))?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                debug!(?path, "Streaming blob from disk");
                Ok(ReaderStream::new(file)
                    .map(|chunk| chunk.map_err(|e| Error::Other(e.into())))
                    .boxed())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ContentUnknown(digest.clone()))
            }
            Err(e) => Err(Error::Other(e.into())),
        }
    }

    async fn put(&self, content: Vec<u8>) -> Result<Digest> {
        self.write("blobs", content).await
    }
}
