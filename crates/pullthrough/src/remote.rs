//! Access to upstream registries.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use oci_distribution::client::ClientConfig;
use oci_distribution::errors::OciError;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Client;
use tracing::{debug, instrument};

use crate::cache::RepositoryLocation;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::local::BlobStream;

/// One repository on an upstream registry.
///
/// Both operations fail with [`Error::ContentUnknown`] when the upstream
/// reports the content as missing, the same shape local storage uses.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Fetch a manifest by digest.
    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>>;
    /// Stream a blob by digest.
    async fn get_blob(&self, digest: &Digest) -> Result<BlobStream>;
}

/// Hands out clients for upstream repositories.
pub trait RemoteRepositoryFactory: Send + Sync {
    /// A client for `location`, honouring its insecure flag.
    fn repository(&self, location: &RepositoryLocation) -> Result<Arc<dyn RemoteRepository>>;
}

/// A [`RemoteRepositoryFactory`] speaking the OCI distribution protocol.
///
/// One [`Client`] is kept per registry and transport policy, so tokens
/// obtained for one request are reused by the next. Requests through a
/// shared client run concurrently.
///
/// Credentials are only ever presented to the registry they were configured
/// for. Every other origin is accessed anonymously.
pub struct OciRemoteFactory {
    credentials: HashMap<String, RegistryAuth>,
    clients: parking_lot::Mutex<HashMap<(String, bool), Arc<Client>>>,
}

impl OciRemoteFactory {
    /// Create a factory that accesses upstreams anonymously.
    pub fn new() -> Self {
        Self::with_credentials(HashMap::new())
    }

    /// Create a factory that presents credentials to the registries they
    /// are keyed by.
    pub fn with_credentials(credentials: HashMap<String, RegistryAuth>) -> Self {
        OciRemoteFactory {
            credentials,
            clients: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn auth_for(&self, registry: &str) -> RegistryAuth {
        self.credentials
            .get(registry)
            .cloned()
            .unwrap_or(RegistryAuth::Anonymous)
    }

    fn client(&self, registry: &str, insecure: bool) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&(registry.to_owned(), insecure)) {
            return Ok(client.clone());
        }
        let config = if insecure {
            ClientConfig::insecure(registry)
        } else {
            ClientConfig::default()
        };
        debug!(%registry, insecure, "Creating upstream client");
        let client = Arc::new(Client::try_from(config)?);
        clients.insert((registry.to_owned(), insecure), client.clone());
        Ok(client)
    }
}

impl Default for OciRemoteFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteRepositoryFactory for OciRemoteFactory {
    fn repository(&self, location: &RepositoryLocation) -> Result<Arc<dyn RemoteRepository>> {
        let client = self.client(&location.registry, location.insecure)?;
        Ok(Arc::new(OciRemoteRepository {
            client,
            auth: self.auth_for(&location.registry),
            location: location.clone(),
        }))
    }
}

struct OciRemoteRepository {
    client: Arc<Client>,
    auth: RegistryAuth,
    location: RepositoryLocation,
}

#[async_trait]
impl RemoteRepository for OciRemoteRepository {
    #[instrument(level = "debug", skip(self), fields(location = %self.location))]
    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        let reference = self.location.reference(digest);
        self.client
            .pull_manifest_raw(&reference, &self.auth)
            .await
            .map(|manifest| manifest.content)
            .map_err(|e| classify(e, digest))
    }

    #[instrument(level = "debug", skip(self), fields(location = %self.location))]
    async fn get_blob(&self, digest: &Digest) -> Result<BlobStream> {
        let reference = self.location.reference(digest);
        let chunks = self
            .client
            .pull_blob_stream(&reference, digest.as_str(), &self.auth)
            .await
            .map_err(|e| classify(e, digest))?;
        Ok(chunks.map(|chunk| chunk.map_err(Error::Other)).boxed())
    }
}

fn classify(error: anyhow::Error, digest: &Digest) -> Error {
    match error.downcast_ref::<OciError>() {
        Some(oci) if oci.is_not_found() => Error::ContentUnknown(digest.clone()),
        _ => Error::Other(error),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use oci_distribution::errors::OciErrorCode;

    fn location(insecure: bool) -> RepositoryLocation {
        RepositoryLocation {
            registry: "127.0.0.1:5000".to_owned(),
            repository: "user/app".to_owned(),
            insecure,
        }
    }

    #[test]
    fn clients_are_shared_per_registry_and_policy() {
        let factory = OciRemoteFactory::new();
        let a = factory.client("127.0.0.1:5000", true).unwrap();
        let b = factory.client("127.0.0.1:5000", true).unwrap();
        let c = factory.client("127.0.0.1:5000", false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(factory.repository(&location(true)).is_ok());
        assert_eq!(2, factory.clients.lock().len());
    }

    #[test]
    fn credentials_stay_with_their_registry() {
        let factory = OciRemoteFactory::with_credentials(
            vec![(
                "127.0.0.1:5000".to_owned(),
                RegistryAuth::Basic("robot".to_owned(), "secret".to_owned()),
            )]
            .into_iter()
            .collect(),
        );
        assert_eq!(
            RegistryAuth::Basic("robot".to_owned(), "secret".to_owned()),
            factory.auth_for("127.0.0.1:5000")
        );
        assert_eq!(RegistryAuth::Anonymous, factory.auth_for("attacker.example.com"));
        assert_eq!(RegistryAuth::Anonymous, factory.auth_for("127.0.0.1:5001"));
        assert_eq!(RegistryAuth::Anonymous, OciRemoteFactory::new().auth_for("quay.io"));
    }

    #[test]
    fn upstream_not_found_becomes_unknown_content() {
        let digest = Digest::new_unchecked("sha256:abcd");
        let missing = anyhow::Error::new(OciError::new(
            OciErrorCode::ManifestUnknown,
            "manifest unknown",
        ))
        .context("not found at http://127.0.0.1:5000/v2/user/app/manifests/sha256:abcd");
        assert!(classify(missing, &digest).is_content_unknown());

        let denied = anyhow::Error::new(OciError::new(OciErrorCode::Denied, "denied"));
        assert!(matches!(classify(denied, &digest), Error::Other(_)));

        let broken = anyhow::anyhow!("connection refused");
        assert!(matches!(classify(broken, &digest), Error::Other(_)));
    }
}
