//! The gateway ties configuration, storage and upstream access together.
use std::sync::Arc;

use oci_distribution::secrets::RegistryAuth;
use tokio::signal::ctrl_c;
use tracing::{error, info};

use crate::blob::PullthroughBlobService;
use crate::cache::DigestRepositoryCache;
use crate::catalog::KubeImageCatalog;
use crate::config::Config;
use crate::error::Result;
use crate::local::{FileRepository, FileStore};
use crate::manifest::PullthroughManifestService;
use crate::metadata::ImageMetadataResolver;
use crate::remote::{OciRemoteFactory, RemoteRepositoryFactory};
use crate::repository::Repository;
use crate::webserver::start as start_webserver;

/// A registry gateway serving images that may only exist upstream.
///
/// The gateway owns everything shared between requests: the digest cache,
/// the image catalog, the upstream client factory and local storage. Each
/// request gets its own [`Repository`] built from them.
pub struct Gateway {
    config: Config,
    cache: Arc<DigestRepositoryCache>,
    catalog: Arc<dyn ImageMetadataResolver>,
    remotes: Arc<dyn RemoteRepositoryFactory>,
    store: FileStore,
}

impl Gateway {
    /// Create a gateway resolving origins through the cluster's image API.
    ///
    /// Fails if the configured cache capacity is invalid.
    pub fn new(config: Config, client: kube::Client) -> Result<Self> {
        let credentials = config
            .upstream_auth
            .iter()
            .map(|(registry, (username, password))| {
                (
                    registry.clone(),
                    RegistryAuth::Basic(username.clone(), password.clone()),
                )
            })
            .collect();
        Self::with_collaborators(
            config,
            Arc::new(KubeImageCatalog::new(client)),
            Arc::new(OciRemoteFactory::with_credentials(credentials)),
        )
    }

    /// Create a gateway with explicit collaborators.
    pub fn with_collaborators(
        config: Config,
        catalog: Arc<dyn ImageMetadataResolver>,
        remotes: Arc<dyn RemoteRepositoryFactory>,
    ) -> Result<Self> {
        let cache = Arc::new(DigestRepositoryCache::new(config.cache_size)?);
        let store = FileStore::new(&config.data_dir);
        Ok(Gateway {
            config,
            cache,
            catalog,
            remotes,
            store,
        })
    }

    /// The context for one repository.
    pub fn repository(&self, namespace: &str, name: &str) -> Repository {
        Repository::new(
            namespace,
            name,
            self.config.pullthrough,
            self.cache.clone(),
            self.catalog.clone(),
            self.remotes.clone(),
        )
    }

    /// Manifest access for one repository.
    pub fn manifests(
        &self,
        namespace: &str,
        name: &str,
    ) -> PullthroughManifestService<FileRepository> {
        PullthroughManifestService::new(
            self.store.repository(namespace, name),
            self.repository(namespace, name),
        )
    }

    /// Blob access for one repository.
    pub fn blobs(&self, namespace: &str, name: &str) -> PullthroughBlobService<FileRepository> {
        PullthroughBlobService::new(
            self.store.repository(namespace, name),
            self.repository(namespace, name),
        )
    }

    /// The local storage backing every repository.
    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// The gateway-wide digest cache.
    pub fn cache(&self) -> &DigestRepositoryCache {
        &self.cache
    }

    /// Serve requests until interrupted.
    pub async fn start(self) -> anyhow::Result<()> {
        let server_config = self.config.server_config.clone();
        info!(
            addr = %server_config.addr,
            port = server_config.port,
            pullthrough = self.config.pullthrough,
            cache_size = self.cache.capacity(),
            "Starting gateway"
        );
        let webserver = start_webserver(Arc::new(self), &server_config);

        tokio::select! {
            res = webserver => if let Err(e) = &res {
                error!("Webserver task completed with error {:?}", e);
                return res;
            },
            res = ctrl_c() => {
                res?;
                info!("Received interrupt, shutting down");
            }
        };
        Ok(())
    }
}
