//! Serving blobs from the origin their manifest was pulled from.
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::local::{BlobService, BlobStream};
use crate::repository::Repository;

/// A [`BlobService`] that serves local misses from the location remembered
/// in the digest cache.
///
/// Blobs are never resolved through the catalog. Their origin is only known
/// once a manifest referencing them has been pulled through.
pub struct PullthroughBlobService<B> {
    local: B,
    repository: Repository,
}

impl<B: BlobService> PullthroughBlobService<B> {
    /// Wrap the local blob storage of `repository`.
    pub fn new(local: B, repository: Repository) -> Self {
        PullthroughBlobService { local, repository }
    }

    fn unknown(&self, digest: &Digest) -> Error {
        Error::BlobUnknown {
            name: self.repository.full_name(),
            digest: digest.clone(),
        }
    }
}

#[async_trait]
impl<B: BlobService> BlobService for PullthroughBlobService<B> {
    async fn stat(&self, digest: &Digest) -> Result<u64> {
        self.local.stat(digest).await
    }

    #[instrument(level = "info", skip(self), fields(repository = %self.repository.full_name()))]
    async fn get(&self, digest: &Digest) -> Result<BlobStream> {
        match self.local.get(digest).await {
            Ok(content) => return Ok(content),
            Err(e) if e.is_content_unknown() && self.repository.pullthrough_enabled() => (),
            Err(e) => return Err(e),
        }

        let location = match self.repository.cache().get(digest) {
            Some(location) => location,
            None => {
                info!("Blob not stored locally and its origin is unknown");
                return Err(self.unknown(digest));
            }
        };
        let remote = self.repository.remotes().repository(&location).map_err(|e| {
            warn!(%location, error = %e, "Unable to create upstream client");
            self.unknown(digest)
        })?;

        debug!(%location, "Fetching blob from origin");
        match remote.get_blob(digest).await {
            Ok(content) => Ok(content),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                info!(%location, error = %e, "Fetching blob from origin failed");
                Err(self.unknown(digest))
            }
        }
    }

    async fn put(&self, _content: Vec<u8>) -> Result<Digest> {
        Err(Error::UnsupportedOperation("blob put"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::{DigestRepositoryCache, RepositoryLocation};
    use crate::testing::*;
    use std::sync::Arc;

    fn location() -> RepositoryLocation {
        RepositoryLocation {
            registry: ORIGIN_REGISTRY.to_owned(),
            repository: "user/app".to_owned(),
            insecure: true,
        }
    }

    fn service(
        pullthrough: bool,
        local: Arc<FakeLocal>,
        remotes: Arc<FakeRemotes>,
        cache: Arc<DigestRepositoryCache>,
    ) -> PullthroughBlobService<Arc<FakeLocal>> {
        let repo = repository(
            pullthrough,
            cache,
            Arc::new(FakeCatalog::default()),
            remotes,
        );
        PullthroughBlobService::new(local, repo)
    }

    #[tokio::test]
    async fn local_blobs_are_served_locally() -> anyhow::Result<()> {
        let layer = digest(1);
        let local = Arc::new(FakeLocal::with(vec![(layer.clone(), b"layer")]));
        let remotes = Arc::new(FakeRemotes::empty());
        let cache = Arc::new(DigestRepositoryCache::new(4)?);
        cache.put(layer.clone(), location());
        let svc = service(true, local.clone(), remotes.clone(), cache);

        assert_eq!(b"layer".to_vec(), read_all(svc.get(&layer).await?).await?);
        assert_eq!(5, svc.stat(&layer).await?);
        assert_eq!(0, remotes.calls.total());
        Ok(())
    }

    #[tokio::test]
    async fn remembered_blobs_come_from_their_origin() -> anyhow::Result<()> {
        let layer = digest(2);
        let remotes = Arc::new(FakeRemotes::with(
            vec![(layer.clone(), b"remote layer")],
            Failure::NotFound,
        ));
        let cache = Arc::new(DigestRepositoryCache::new(4)?);
        cache.put(layer.clone(), location());
        let svc = service(true, Arc::new(FakeLocal::default()), remotes.clone(), cache);

        assert_eq!(
            b"remote layer".to_vec(),
            read_all(svc.get(&layer).await?).await?
        );
        assert_eq!(1, remotes.calls.get("GetBlob"));
        assert_eq!(vec![location()], *remotes.locations.lock().unwrap());
        // stat stays local.
        assert!(svc.stat(&layer).await.unwrap_err().is_content_unknown());
        Ok(())
    }

    #[tokio::test]
    async fn unremembered_blobs_are_unknown() -> anyhow::Result<()> {
        let layer = digest(3);
        let remotes = Arc::new(FakeRemotes::with(
            vec![(layer.clone(), b"remote layer")],
            Failure::NotFound,
        ));
        let cache = Arc::new(DigestRepositoryCache::new(4)?);
        let svc = service(true, Arc::new(FakeLocal::default()), remotes.clone(), cache);

        assert!(matches!(
            svc.get(&layer).await,
            Err(Error::BlobUnknown { digest, .. }) if digest == layer
        ));
        assert_eq!(0, remotes.calls.total());
        Ok(())
    }

    #[tokio::test]
    async fn origin_failures_are_unknown_but_cancellation_is_not() -> anyhow::Result<()> {
        let layer = digest(4);
        for (failure, cancelled) in &[
            (Failure::NotFound, false),
            (Failure::Broken, false),
            (Failure::Cancelled, true),
        ] {
            let cache = Arc::new(DigestRepositoryCache::new(4)?);
            cache.put(layer.clone(), location());
            let remotes = Arc::new(FakeRemotes::with(Vec::new(), *failure));
            let svc = service(true, Arc::new(FakeLocal::default()), remotes, cache);

            match svc.get(&layer).await {
                Err(Error::Cancelled) => assert!(*cancelled),
                Err(Error::BlobUnknown { .. }) => assert!(!*cancelled),
                Err(e) => panic!("unexpected error {:?}", e),
                Ok(_) => panic!("unexpected content"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn disabled_pullthrough_ignores_the_cache() -> anyhow::Result<()> {
        let layer = digest(5);
        let remotes = Arc::new(FakeRemotes::with(
            vec![(layer.clone(), b"remote layer")],
            Failure::NotFound,
        ));
        let cache = Arc::new(DigestRepositoryCache::new(4)?);
        cache.put(layer.clone(), location());
        let svc = service(false, Arc::new(FakeLocal::default()), remotes.clone(), cache);

        assert!(matches!(svc.get(&layer).await, Err(e) if e.is_content_unknown()));
        assert!(matches!(
            svc.put(b"layer".to_vec()).await,
            Err(Error::UnsupportedOperation(_))
        ));
        assert_eq!(0, remotes.calls.total());
        Ok(())
    }
}
