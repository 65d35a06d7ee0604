//! OCI distribution client
//!
//! A read-only client: it authenticates against an upstream registry and
//! pulls raw manifests and blobs by digest, verifying what it receives.

use crate::errors::*;
use crate::manifest::{self, MANIFEST_MEDIA_TYPES};
use crate::secrets::*;
use crate::reference::resolve_registry_name;
use crate::Reference;

use crate::token_cache::{RegistryToken, RegistryTokenType, TokenCache};
use anyhow::{anyhow, Context};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use hyperx::header::Header;
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::RequestBuilder;
use sha2::Digest;
use std::convert::TryFrom;
use tracing::{debug, trace, warn};
use www_authenticate::{Challenge, ChallengeFields, RawChallenge, WwwAuthenticate};

/// A manifest exactly as the registry served it.
#[derive(Clone, Debug)]
pub struct ManifestData {
    /// The raw manifest bytes
    pub content: Vec<u8>,
    /// The content digest reported by the registry, or computed from the body
    pub digest: String,
    /// The media type announced by the registry
    pub media_type: String,
}

/// The bytes of a blob as they arrive from the registry.
///
/// The stream ends with an error instead of `None` when the content does not
/// hash to the requested digest.
pub type BlobStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// The OCI client connects to an OCI registry and fetches manifests and blobs.
///
/// Authentication happens lazily: the first request against a repository
/// performs the token handshake and the resulting credentials are reused
/// until they expire. All operations take `&self`; the token cache is the
/// only state shared between requests and its lock is never held across a
/// request.
#[derive(Default)]
pub struct Client {
    config: ClientConfig,
    tokens: RwLock<TokenCache>,
    client: reqwest::Client,
}

impl TryFrom<ClientConfig> for Client {
    type Error = anyhow::Error;

    fn try_from(config: ClientConfig) -> Result<Self, Self::Error> {
        let mut client_builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certificates);

        client_builder = match () {
            #[cfg(feature = "native-tls")]
            () => client_builder.danger_accept_invalid_hostnames(config.accept_invalid_hostnames),
            #[cfg(not(feature = "native-tls"))]
            () => {
                if config.accept_invalid_hostnames {
                    warn!("Cannot change value of `accept_invalid_hostnames`: missing 'native-tls' feature");
                }
                client_builder
            }
        };

        Ok(Self {
            config,
            tokens: RwLock::new(TokenCache::new()),
            client: client_builder.build()?,
        })
    }
}

impl Client {
    /// Create a new client with the supplied config
    pub fn new(config: ClientConfig) -> Self {
        Client::try_from(config.clone()).unwrap_or_else(|err| {
            warn!("Cannot create OCI client from config: {:?}", err);
            warn!("Creating client with default configuration");
            Self {
                config,
                tokens: RwLock::new(TokenCache::new()),
                client: reqwest::Client::new(),
            }
        })
    }

    /// Pull a manifest without interpreting it.
    ///
    /// When the reference names a sha256 digest the body is hashed and must
    /// match it, so a misbehaving upstream cannot hand out different content
    /// under a known digest.
    pub async fn pull_manifest_raw(
        &self,
        image: &Reference,
        auth: &RegistryAuth,
    ) -> anyhow::Result<ManifestData> {
        self.ensure_auth(image, auth).await?;

        let url = self.to_v2_manifest_url(image);
        debug!(%url, "Pulling image manifest");

        let res = RequestBuilderWrapper::from_client(self, |client| client.get(&url))
            .apply_accept(MANIFEST_MEDIA_TYPES)?
            .apply_auth(image)?
            .into_request_builder()
            .send()
            .await?;

        let status = res.status();
        if status != reqwest::StatusCode::OK {
            return Err(error_from_response(res, &url, OciErrorCode::ManifestUnknown).await);
        }

        let headers = res.headers().clone();
        trace!(?headers, "Got Headers");
        let content = res.bytes().await?.to_vec();
        let digest = digest_header_value(&headers, &content);

        if let Some(expected) = image.digest() {
            verify_digest(expected, &content)
                .with_context(|| format!("manifest for '{:?}' failed verification", image))?;
        }

        let media_type = match headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            Some(ct) if MANIFEST_MEDIA_TYPES.contains(&ct) => ct.to_owned(),
            _ => manifest::versioned(&content)
                .with_context(|| format!("unable to determine media type of '{:?}'", image))?
                .effective_media_type()
                .to_owned(),
        };

        Ok(ManifestData {
            content,
            digest,
            media_type,
        })
    }

    /// Stream a single blob.
    ///
    /// The image reference only locates the registry and repository; any
    /// tag or digest it carries is ignored in favour of `digest`. Failures
    /// before the first byte, such as missing content, are returned directly.
    pub async fn pull_blob_stream(
        &self,
        image: &Reference,
        digest: &str,
        auth: &RegistryAuth,
    ) -> anyhow::Result<BlobStream> {
        self.ensure_auth(image, auth).await?;

        let url = self.to_v2_blob_url(image.resolve_registry(), image.repository(), digest);
        debug!(%url, "Pulling blob");
        let res = RequestBuilderWrapper::from_client(self, |client| client.get(&url))
            .apply_auth(image)?
            .into_request_builder()
            .send()
            .await?;

        if res.status() != reqwest::StatusCode::OK {
            return Err(error_from_response(res, &url, OciErrorCode::BlobUnknown).await);
        }

        Ok(verified(res.bytes_stream(), digest.to_owned()).boxed())
    }

    async fn ensure_auth(&self, image: &Reference, auth: &RegistryAuth) -> anyhow::Result<()> {
        let authorized = self.tokens.read().contains_key(image);
        if !authorized {
            self.auth(image, auth).await?;
        }
        Ok(())
    }

    /// Perform an OAuth v2 auth request if necessary.
    ///
    /// This performs authorization and then stores the token internally to be used
    /// on other requests.
    async fn auth(&self, image: &Reference, authentication: &RegistryAuth) -> anyhow::Result<()> {
        debug!("Authorizing for image: {:?}", image);
        // The version request will tell us where to go.
        let url = format!(
            "{}://{}/v2/",
            self.config.protocol.scheme_for(image.resolve_registry()),
            image.resolve_registry()
        );
        debug!(?url);
        let res = self.client.get(&url).send().await?;
        let dist_hdr = match res.headers().get(reqwest::header::WWW_AUTHENTICATE) {
            Some(h) => h,
            None => return Ok(()),
        };

        let auth = WwwAuthenticate::parse_header(&dist_hdr.as_bytes().into())?;
        let challenge_opt = match auth.get::<BearerChallenge>() {
            Some(co) => co,
            None => {
                // Fall back to HTTP Basic Auth
                if let RegistryAuth::Basic(username, password) = authentication {
                    self.tokens.write().insert(
                        image,
                        RegistryTokenType::Basic(username.to_string(), password.to_string()),
                    );
                }
                return Ok(());
            }
        };

        let scope = format!("repository:{}:pull", image.repository());
        let challenge = &challenge_opt[0];
        let realm = challenge
            .realm
            .as_ref()
            .ok_or_else(|| anyhow!("bearer challenge from {} has no realm", url))?;
        let service = challenge.service.as_ref();
        let mut query = vec![("scope", &scope)];

        if let Some(s) = service {
            query.push(("service", s))
        }

        debug!(?realm, ?service, ?scope, "Making authentication call");

        let auth_res = self
            .client
            .get(realm)
            .query(&query)
            .apply_authentication(authentication)
            .send()
            .await?;

        match auth_res.status() {
            reqwest::StatusCode::OK => {
                let text = auth_res.text().await?;
                let token: RegistryToken = serde_json::from_str(&text)
                    .context("Failed to decode registry token from auth request")?;
                debug!("Succesfully authorized for image '{:?}'", image);
                self.tokens
                    .write()
                    .insert(image, RegistryTokenType::Bearer(token));
                Ok(())
            }
            _ => {
                let reason = auth_res.text().await?;
                debug!("Failed to authenticate for image '{:?}': {}", image, reason);
                Err(anyhow::anyhow!("failed to authenticate: {}", reason))
            }
        }
    }

    /// Convert a Reference to a v2 manifest URL.
    fn to_v2_manifest_url(&self, reference: &Reference) -> String {
        let revision = reference
            .digest()
            .or_else(|| reference.tag())
            .unwrap_or("latest");
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.config
                .protocol
                .scheme_for(reference.resolve_registry()),
            reference.resolve_registry(),
            reference.repository(),
            revision,
        )
    }

    /// Convert a Reference to a v2 blob (layer) URL.
    fn to_v2_blob_url(&self, registry: &str, repository: &str, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            self.config.protocol.scheme_for(registry),
            registry,
            repository,
            digest,
        )
    }
}

/// Turn a non-200 registry response into an error.
///
/// The OCI spec technically does not allow any codes but 200, 500, 401, and 404.
/// Obviously, HTTP servers are going to send other codes. A 404 always ends up
/// as an [`OciError`] that reports itself as not found, even when the body is
/// not a proper error envelope, so callers can tell missing content apart from
/// a broken upstream with `downcast_ref::<OciError>()`.
async fn error_from_response(
    res: reqwest::Response,
    url: &str,
    not_found: OciErrorCode,
) -> anyhow::Error {
    let status = res.status();
    let text = match res.text().await {
        Ok(text) => text,
        Err(e) => return anyhow::Error::new(e).context(format!("reading error body from {}", url)),
    };
    let envelope = serde_json::from_str::<OciEnvelope>(&text)
        .ok()
        .and_then(|mut e| if e.errors.is_empty() { None } else { Some(e.errors.remove(0)) });

    match (status, envelope) {
        (reqwest::StatusCode::NOT_FOUND, Some(err)) if err.is_not_found() => {
            anyhow::Error::new(err).context(format!("not found at {}", url))
        }
        (reqwest::StatusCode::NOT_FOUND, _) => {
            anyhow::Error::new(OciError::new(not_found, text)).context(format!("not found at {}", url))
        }
        (reqwest::StatusCode::UNAUTHORIZED, _) => anyhow!("Not Authorized at {}", url),
        (s, Some(err)) if s.is_client_error() => anyhow::Error::new(err).context(format!("on {}", url)),
        (s, _) if s.is_server_error() => anyhow!("Server error at {}", url),
        (s, _) => anyhow!(
            "An unexpected error occured: code={}, message='{}'",
            s,
            text
        ),
    }
}

/// The request builder wrapper allows to be instantiated from a
/// `Client` and allows composable operations on the request builder,
/// to produce a `RequestBuilder` object that can be executed.
struct RequestBuilderWrapper<'a> {
    client: &'a Client,
    request_builder: RequestBuilder,
}

// RequestBuilderWrapper type management
impl<'a> RequestBuilderWrapper<'a> {
    /// Create a `RequestBuilderWrapper` from a `Client` instance, by
    /// instantiating the internal `RequestBuilder` with the provided
    /// function `f`.
    fn from_client(
        client: &'a Client,
        f: impl Fn(&reqwest::Client) -> RequestBuilder,
    ) -> RequestBuilderWrapper<'a> {
        let request_builder = f(&client.client);
        RequestBuilderWrapper {
            client,
            request_builder,
        }
    }

    // Produces a final `RequestBuilder` out of this `RequestBuilderWrapper`
    fn into_request_builder(self) -> RequestBuilder {
        self.request_builder
    }
}

// Composable functions applicable to a `RequestBuilderWrapper`
impl<'a> RequestBuilderWrapper<'a> {
    fn apply_accept(&self, accept: &[&str]) -> anyhow::Result<RequestBuilderWrapper<'a>> {
        let request_builder = self
            .request_builder
            .try_clone()
            .ok_or_else(|| anyhow!("could not clone request builder"))?
            .header("Accept", Vec::from(accept).join(", "));

        Ok(RequestBuilderWrapper {
            client: self.client,
            request_builder,
        })
    }

    /// Updates request as necessary for authentication.
    ///
    /// If the cache holds a bearer token for the repository it goes into the
    /// Authorization header; cached HTTP Basic credentials are applied as is.
    fn apply_auth(&self, image: &Reference) -> anyhow::Result<RequestBuilderWrapper<'a>> {
        let mut headers = HeaderMap::new();
        let request_builder = self
            .request_builder
            .try_clone()
            .ok_or_else(|| anyhow!("could not clone request builder"))?;

        let token = self.client.tokens.read().get(image).cloned();
        let request_builder = match token {
            Some(RegistryTokenType::Bearer(token)) => {
                debug!("Using bearer token authentication.");
                headers.insert("Authorization", token.bearer_token().parse()?);
                request_builder.headers(headers)
            }
            Some(RegistryTokenType::Basic(username, password)) => {
                debug!("Using HTTP basic authentication.");
                request_builder.basic_auth(username, Some(password))
            }
            None => request_builder,
        };
        Ok(RequestBuilderWrapper {
            client: self.client,
            request_builder,
        })
    }
}

/// A client configuration
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Which protocol the client should use
    pub protocol: ClientProtocol,

    /// Accept invalid hostname. Defaults to false
    pub accept_invalid_hostnames: bool,

    /// Accept invalid certificates. Defaults to false
    pub accept_invalid_certificates: bool,
}

impl ClientConfig {
    /// Configuration for an upstream whose transport security may be skipped.
    ///
    /// The registry is contacted over plain HTTP and, should it redirect to
    /// HTTPS, certificate and hostname checks are not enforced. Both the
    /// registry name and the host serving it are exempted.
    pub fn insecure(registry: &str) -> Self {
        let mut exceptions = vec![registry.to_owned()];
        let resolved = resolve_registry_name(registry);
        if resolved != registry {
            exceptions.push(resolved.to_owned());
        }
        ClientConfig {
            protocol: ClientProtocol::HttpsExcept(exceptions),
            accept_invalid_hostnames: true,
            accept_invalid_certificates: true,
        }
    }
}

/// The protocol that the client should use to connect
#[derive(Debug, Clone, PartialEq)]
pub enum ClientProtocol {
    #[allow(missing_docs)]
    Http,
    #[allow(missing_docs)]
    Https,
    #[allow(missing_docs)]
    HttpsExcept(Vec<String>),
}

impl Default for ClientProtocol {
    fn default() -> Self {
        ClientProtocol::Https
    }
}

impl ClientProtocol {
    fn scheme_for(&self, registry: &str) -> &str {
        match self {
            ClientProtocol::Https => "https",
            ClientProtocol::Http => "http",
            ClientProtocol::HttpsExcept(exceptions) => {
                if exceptions.iter().any(|e| e == registry) {
                    "http"
                } else {
                    "https"
                }
            }
        }
    }
}

#[derive(Clone)]
struct BearerChallenge {
    pub realm: Option<String>,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl Challenge for BearerChallenge {
    fn challenge_name() -> &'static str {
        "Bearer"
    }

    fn from_raw(raw: RawChallenge) -> Option<Self> {
        match raw {
            RawChallenge::Token68(_) => None,
            RawChallenge::Fields(mut map) => Some(BearerChallenge {
                realm: map.remove("realm"),
                scope: map.remove("scope"),
                service: map.remove("service"),
            }),
        }
    }

    fn into_raw(self) -> RawChallenge {
        let mut map = ChallengeFields::new();
        if let Some(realm) = self.realm {
            map.insert_static_quoting("realm", realm);
        }
        if let Some(scope) = self.scope {
            map.insert_static_quoting("scope", scope);
        }
        if let Some(service) = self.service {
            map.insert_static_quoting("service", service);
        }
        RawChallenge::Fields(map)
    }
}

/// Extract `Docker-Content-Digest` header from a manifest response, falling
/// back to hashing the body (tested with ECR, which omits the header).
fn digest_header_value(headers: &HeaderMap, body: &[u8]) -> String {
    match headers
        .get("Docker-Content-Digest")
        .and_then(|hv| hv.to_str().ok())
    {
        Some(digest) => digest.to_owned(),
        None => {
            let digest = sha256_digest(body);
            debug!(%digest, "Computed digest of manifest payload.");
            digest
        }
    }
}

/// Check that `content` hashes to `expected`.
///
/// Only sha256 can be recomputed here; other algorithms are accepted as is.
fn verify_digest(expected: &str, content: &[u8]) -> anyhow::Result<()> {
    if !expected.starts_with("sha256:") {
        debug!(%expected, "Skipping verification of non-sha256 digest");
        return Ok(());
    }
    let actual = sha256_digest(content);
    if actual != expected {
        return Err(anyhow!(
            "digest mismatch: expected {}, got {}",
            expected,
            actual
        ));
    }
    Ok(())
}

/// Pass `chunks` through, hashing them on the way, and fail at the end of the
/// stream if the content does not match `expected`.
fn verified<S, E>(chunks: S, expected: String) -> impl Stream<Item = anyhow::Result<Bytes>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let hasher = if expected.starts_with("sha256:") {
        Some(sha2::Sha256::new())
    } else {
        debug!(%expected, "Skipping verification of non-sha256 digest");
        None
    };
    stream::try_unfold(
        (Box::pin(chunks), hasher, expected),
        |(mut chunks, mut hasher, expected)| async move {
            match chunks.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(Into::<anyhow::Error>::into)?;
                    if let Some(hasher) = hasher.as_mut() {
                        hasher.update(&chunk);
                    }
                    Ok(Some((chunk, (chunks, hasher, expected))))
                }
                None => {
                    if let Some(hasher) = hasher {
                        let actual = format!("sha256:{:x}", hasher.finalize());
                        if actual != expected {
                            return Err(anyhow!(
                                "digest mismatch: expected {}, got {}",
                                expected,
                                actual
                            ));
                        }
                    }
                    Ok(None)
                }
            }
        },
    )
}

/// Computes the SHA256 digest of a byte vector
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", sha2::Sha256::digest(bytes))
}
