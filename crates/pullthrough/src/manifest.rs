//! Serving manifests that may only exist upstream.
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::cache::RepositoryLocation;
use crate::digest::Digest;
use crate::error::{Error, MissCause, Result};
use crate::local::ManifestService;
use crate::repository::Repository;

/// A [`ManifestService`] that falls back to the manifest's origin registry
/// when local storage does not have it.
///
/// A `get` performs at most one local lookup, one catalog resolution and one
/// upstream fetch, in that order. Any dead end after the local miss is
/// reported as [`Error::ManifestUnknownRevision`]; only catalog outages and
/// cancellation are reported as themselves. A successful resolution
/// remembers the origin of the manifest and of every blob it references in
/// the repository's digest cache.
pub struct PullthroughManifestService<M> {
    local: M,
    repository: Repository,
}

impl<M: ManifestService> PullthroughManifestService<M> {
    /// Wrap the local manifest storage of `repository`.
    pub fn new(local: M, repository: Repository) -> Self {
        PullthroughManifestService { local, repository }
    }

    fn unknown(&self, digest: &Digest, cause: MissCause) -> Error {
        info!(%digest, %cause, "Manifest unknown");
        Error::ManifestUnknownRevision {
            name: self.repository.full_name(),
            digest: digest.clone(),
            cause,
        }
    }

    async fn fetch(&self, location: &RepositoryLocation, digest: &Digest) -> Result<Vec<u8>> {
        let remote = match self.repository.remotes().repository(location) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(%location, error = %e, "Unable to create upstream client");
                return Err(self.unknown(digest, MissCause::RemoteFailed));
            }
        };
        debug!(%location, "Fetching manifest from origin");
        match remote.get_manifest(digest).await {
            Ok(content) => Ok(content),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(Error::ContentUnknown(_)) => Err(self.unknown(digest, MissCause::RemoteNotFound)),
            Err(e) => {
                warn!(%location, error = %e, "Fetching manifest from origin failed");
                Err(self.unknown(digest, MissCause::RemoteFailed))
            }
        }
    }

    fn remember(&self, digest: &Digest, location: &RepositoryLocation, content: &[u8]) {
        let cache = self.repository.cache();
        cache.put(digest.clone(), location.clone());
        match oci_distribution::manifest::referenced_digests(content) {
            Ok(references) => {
                debug!(%location, count = references.len(), "Remembering referenced content");
                for reference in references {
                    cache.put(Digest::new_unchecked(reference), location.clone());
                }
            }
            Err(e) => debug!(%digest, error = %e, "Not remembering references of unparseable manifest"),
        }
    }
}

#[async_trait]
impl<M: ManifestService> ManifestService for PullthroughManifestService<M> {
    /// Existence is answered from local storage only.
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        self.local.exists(digest).await
    }

    #[instrument(level = "info", skip(self), fields(repository = %self.repository.full_name()))]
    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        match self.local.get(digest).await {
            Ok(content) => return Ok(content),
            Err(e) if e.is_content_unknown() && self.repository.pullthrough_enabled() => {
                debug!("Manifest not stored locally, resolving its origin")
            }
            Err(e) => return Err(e),
        }

        let metadata = match self
            .repository
            .catalog()
            .resolve(self.repository.namespace(), self.repository.name(), digest)
            .await
        {
            Ok(metadata) => metadata,
            Err(Error::ContentUnknown(_)) => return Err(self.unknown(digest, MissCause::Unresolved)),
            Err(Error::InvalidOrigin(origin)) => {
                warn!(%origin, "Catalog recorded an unusable origin");
                return Err(self.unknown(digest, MissCause::MalformedOrigin));
            }
            Err(e) => return Err(e),
        };

        let location =
            RepositoryLocation::from_reference(&metadata.origin, metadata.insecure_allowed);
        let content = match metadata.raw_content {
            Some(content) => {
                debug!(%location, "Catalog holds the manifest");
                content
            }
            None => self.fetch(&location, digest).await?,
        };
        self.remember(digest, &location, &content);
        Ok(content)
    }

    async fn put(&self, _content: Vec<u8>) -> Result<Digest> {
        Err(Error::UnsupportedOperation("manifest put"))
    }

    async fn delete(&self, _digest: &Digest) -> Result<()> {
        Err(Error::UnsupportedOperation("manifest delete"))
    }
}
