//! The per-request view of one image repository.
use std::sync::Arc;

use crate::cache::DigestRepositoryCache;
use crate::metadata::ImageMetadataResolver;
use crate::remote::RemoteRepositoryFactory;

/// Identity and collaborators of one logical image repository.
///
/// Built for each request from gateway-wide state. Everything in it is
/// either immutable or internally synchronized, so clones are cheap and can
/// be handed to as many tasks as needed.
#[derive(Clone)]
pub struct Repository {
    namespace: String,
    name: String,
    pullthrough: bool,
    cache: Arc<DigestRepositoryCache>,
    catalog: Arc<dyn ImageMetadataResolver>,
    remotes: Arc<dyn RemoteRepositoryFactory>,
}

impl Repository {
    /// Create a repository context.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        pullthrough: bool,
        cache: Arc<DigestRepositoryCache>,
        catalog: Arc<dyn ImageMetadataResolver>,
        remotes: Arc<dyn RemoteRepositoryFactory>,
    ) -> Self {
        Repository {
            namespace: namespace.into(),
            name: name.into(),
            pullthrough,
            cache,
            catalog,
            remotes,
        }
    }

    /// Namespace the repository belongs to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the repository within its namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<namespace>/<name>`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether local misses may be served from upstream.
    pub fn pullthrough_enabled(&self) -> bool {
        self.pullthrough
    }

    /// The gateway-wide digest cache.
    pub fn cache(&self) -> &DigestRepositoryCache {
        &self.cache
    }

    /// The image catalog.
    pub fn catalog(&self) -> &dyn ImageMetadataResolver {
        self.catalog.as_ref()
    }

    /// The upstream client factory.
    pub fn remotes(&self) -> &dyn RemoteRepositoryFactory {
        self.remotes.as_ref()
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("pullthrough", &self.pullthrough)
            .finish()
    }
}
