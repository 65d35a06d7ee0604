//! Fake collaborators shared by the unit tests.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use oci_distribution::Reference;

use crate::cache::{DigestRepositoryCache, RepositoryLocation};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::local::{BlobService, BlobStream, ManifestService};
use crate::metadata::{ImageMetadata, ImageMetadataResolver};
use crate::remote::{RemoteRepository, RemoteRepositoryFactory};
use crate::repository::Repository;

pub(crate) const NAMESPACE: &str = "user";
pub(crate) const NAME: &str = "app";
pub(crate) const ORIGIN_REGISTRY: &str = "127.0.0.1:5000";

pub(crate) fn digest(n: u8) -> Digest {
    Digest::new_unchecked(format!("sha256:{}", format!("{:02x}", n).repeat(32)))
}

/// Serve `content` as a stream of two chunks.
pub(crate) fn chunked(content: Vec<u8>) -> BlobStream {
    let mut head = Bytes::from(content);
    let tail = head.split_off(head.len() / 2);
    stream::iter(vec![Ok(head), Ok(tail)]).boxed()
}

pub(crate) async fn read_all(mut chunks: BlobStream) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    while let Some(chunk) = chunks.next().await {
        content.extend_from_slice(&chunk?);
    }
    Ok(content)
}

#[derive(Default)]
pub(crate) struct Calls(Mutex<HashMap<&'static str, usize>>);

impl Calls {
    pub(crate) fn record(&self, name: &'static str) {
        *self.0.lock().unwrap().entry(name).or_insert(0) += 1;
    }

    pub(crate) fn get(&self, name: &str) -> usize {
        self.0.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub(crate) fn total(&self) -> usize {
        self.0.lock().unwrap().values().sum()
    }
}

/// Local storage holding a fixed set of manifests and blobs.
#[derive(Default)]
pub(crate) struct FakeLocal {
    pub(crate) content: HashMap<Digest, Vec<u8>>,
    pub(crate) calls: Calls,
}

impl FakeLocal {
    pub(crate) fn with(entries: Vec<(Digest, &[u8])>) -> Self {
        FakeLocal {
            content: entries.into_iter().map(|(d, c)| (d, c.to_vec())).collect(),
            calls: Calls::default(),
        }
    }

    fn lookup(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.content
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::ContentUnknown(digest.clone()))
    }
}

#[async_trait]
impl ManifestService for FakeLocal {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        self.calls.record("Exists");
        Ok(self.content.contains_key(digest))
    }

    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.calls.record("Get");
        self.lookup(digest)
    }

    async fn put(&self, _content: Vec<u8>) -> Result<Digest> {
        self.calls.record("Put");
        Err(Error::Other(anyhow::anyhow!("fake local storage is read only")))
    }

    async fn delete(&self, _digest: &Digest) -> Result<()> {
        self.calls.record("Delete");
        Err(Error::Other(anyhow::anyhow!("fake local storage is read only")))
    }
}

#[async_trait]
impl BlobService for FakeLocal {
    async fn stat(&self, digest: &Digest) -> Result<u64> {
        self.calls.record("Stat");
        self.lookup(digest).map(|c| c.len() as u64)
    }

    async fn get(&self, digest: &Digest) -> Result<BlobStream> {
        self.calls.record("Get");
        self.lookup(digest).map(chunked)
    }

    async fn put(&self, _content: Vec<u8>) -> Result<Digest> {
        self.calls.record("Put");
        Err(Error::Other(anyhow::anyhow!("fake local storage is read only")))
    }
}

/// What the fake catalog answers for a digest it knows about.
pub(crate) enum Resolution {
    Found(ImageMetadata),
    Malformed(&'static str),
    Unavailable,
    Cancelled,
}

#[derive(Default)]
pub(crate) struct FakeCatalog {
    pub(crate) entries: HashMap<Digest, Resolution>,
    pub(crate) calls: Calls,
}

impl FakeCatalog {
    pub(crate) fn with(entries: Vec<(Digest, Resolution)>) -> Self {
        FakeCatalog {
            entries: entries.into_iter().collect(),
            calls: Calls::default(),
        }
    }
}

#[async_trait]
impl ImageMetadataResolver for FakeCatalog {
    async fn resolve(
        &self,
        namespace: &str,
        name: &str,
        digest: &Digest,
    ) -> Result<ImageMetadata> {
        self.calls.record("Resolve");
        assert_eq!((NAMESPACE, NAME), (namespace, name));
        match self.entries.get(digest) {
            Some(Resolution::Found(metadata)) => Ok(metadata.clone()),
            Some(Resolution::Malformed(origin)) => Err(Error::InvalidOrigin(origin.to_string())),
            Some(Resolution::Unavailable) => Err(Error::CatalogUnavailable(anyhow::anyhow!(
                "connection refused"
            ))),
            Some(Resolution::Cancelled) => Err(Error::Cancelled),
            None => Err(Error::ContentUnknown(digest.clone())),
        }
    }
}

/// Metadata pointing at the fake origin registry.
pub(crate) fn origin(digest: &Digest, raw_content: Option<&[u8]>, insecure: bool) -> ImageMetadata {
    ImageMetadata {
        origin: Reference::with_digest(ORIGIN_REGISTRY, "user/app", digest.as_str()),
        raw_content: raw_content.map(|c| c.to_vec()),
        insecure_allowed: insecure,
    }
}

/// How the fake upstream behaves for content it does not hold.
#[derive(Clone, Copy)]
pub(crate) enum Failure {
    NotFound,
    Broken,
    Cancelled,
}

pub(crate) struct FakeRemotes {
    pub(crate) content: HashMap<Digest, Vec<u8>>,
    pub(crate) failure: Failure,
    pub(crate) calls: Arc<Calls>,
    pub(crate) locations: Mutex<Vec<RepositoryLocation>>,
}

impl FakeRemotes {
    pub(crate) fn with(entries: Vec<(Digest, &[u8])>, failure: Failure) -> Self {
        FakeRemotes {
            content: entries.into_iter().map(|(d, c)| (d, c.to_vec())).collect(),
            failure,
            calls: Arc::new(Calls::default()),
            locations: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn empty() -> Self {
        Self::with(Vec::new(), Failure::NotFound)
    }
}

impl RemoteRepositoryFactory for FakeRemotes {
    fn repository(&self, location: &RepositoryLocation) -> Result<Arc<dyn RemoteRepository>> {
        self.calls.record("Repository");
        self.locations.lock().unwrap().push(location.clone());
        Ok(Arc::new(FakeRemote {
            content: self.content.clone(),
            failure: self.failure,
            calls: self.calls.clone(),
        }))
    }
}

struct FakeRemote {
    content: HashMap<Digest, Vec<u8>>,
    failure: Failure,
    calls: Arc<Calls>,
}

impl FakeRemote {
    fn lookup(&self, digest: &Digest) -> Result<Vec<u8>> {
        match (self.content.get(digest), self.failure) {
            (Some(content), _) => Ok(content.clone()),
            (None, Failure::NotFound) => Err(Error::ContentUnknown(digest.clone())),
            (None, Failure::Broken) => Err(Error::Other(anyhow::anyhow!(
                "connection reset by peer"
            ))),
            (None, Failure::Cancelled) => Err(Error::Cancelled),
        }
    }
}

#[async_trait]
impl RemoteRepository for FakeRemote {
    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.calls.record("GetManifest");
        self.lookup(digest)
    }

    async fn get_blob(&self, digest: &Digest) -> Result<BlobStream> {
        self.calls.record("GetBlob");
        self.lookup(digest).map(chunked)
    }
}

pub(crate) fn repository(
    pullthrough: bool,
    cache: Arc<DigestRepositoryCache>,
    catalog: Arc<FakeCatalog>,
    remotes: Arc<FakeRemotes>,
) -> Repository {
    Repository::new(NAMESPACE, NAME, pullthrough, cache, catalog, remotes)
}
