//! Resolving a digest to the upstream it was mirrored from.
use async_trait::async_trait;
use oci_distribution::Reference;

use crate::digest::Digest;
use crate::error::Result;

/// What the image catalog knows about a digest within a repository.
#[derive(Clone, Debug)]
pub struct ImageMetadata {
    /// Upstream host, repository path and digest the content came from.
    pub origin: Reference,
    /// The manifest bytes if the catalog already holds them.
    pub raw_content: Option<Vec<u8>>,
    /// Whether transport security may be skipped when contacting the origin.
    pub insecure_allowed: bool,
}

/// Looks up where content tagged into a repository originally came from.
///
/// Implementations fail with [`Error::ContentUnknown`] when the catalog has
/// no record tying the digest to `namespace/name`, and with
/// [`Error::CatalogUnavailable`] when the catalog itself cannot be reached.
///
/// [`Error::ContentUnknown`]: crate::Error::ContentUnknown
/// [`Error::CatalogUnavailable`]: crate::Error::CatalogUnavailable
#[async_trait]
pub trait ImageMetadataResolver: Send + Sync {
    /// Resolve `digest` as seen from the repository `namespace/name`.
    async fn resolve(&self, namespace: &str, name: &str, digest: &Digest)
        -> Result<ImageMetadata>;
}
