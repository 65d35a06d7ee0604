//! Server is an HTTP(S) server answering registry v2 pull requests.
//!
//! Only the read side of the protocol is served: manifests and blobs by
//! digest. Writes are routed to the pull-through services, which refuse them.

use std::convert::Infallible;
use std::sync::Arc;

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::status::StatusCode;
use http::Response;
use hyper::body::Bytes;
use hyper::Body;
use oci_distribution::errors::{OciEnvelope, OciError, OciErrorCode};
use oci_distribution::manifest::{self, OCI_IMAGE_MANIFEST_MEDIA_TYPE};
use tracing::{debug, error, instrument};
use warp::{Filter, Rejection, Reply};

use crate::config::ServerConfig;
use crate::digest::Digest;
use crate::error::Error;
use crate::gateway::Gateway;
use crate::local::{BlobService, ManifestService};

const PING: &str = "this is the pull-through gateway";
const DIGEST_HEADER: &str = "docker-content-digest";
const API_VERSION_HEADER: &str = "docker-distribution-api-version";

/// Start the gateway's HTTP(S) server
///
/// TLS is used when both a certificate and a key are configured.
pub(crate) async fn start(gateway: Arc<Gateway>, config: &ServerConfig) -> anyhow::Result<()> {
    let routes = routes(gateway);
    match config.tls_files() {
        Some((cert, key)) => {
            warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run((config.addr, config.port))
                .await
        }
        None => warp::serve(routes).run((config.addr, config.port)).await,
    }
    Ok(())
}

/// Every route the gateway answers.
pub fn routes(
    gateway: Arc<Gateway>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health = warp::get().and(warp::path("healthz")).map(|| PING);
    let version = warp::get()
        .and(warp::path("v2"))
        .and(warp::path::end())
        .map(|| {
            warp::reply::with_header(
                warp::reply::json(&serde_json::json!({})),
                API_VERSION_HEADER,
                "registry/2.0",
            )
        });

    let with_gateway = warp::any().map(move || gateway.clone());

    let get_manifest = warp::get()
        .and(warp::path!("v2" / String / String / "manifests" / String))
        .and(with_gateway.clone())
        .and_then(get_manifest);
    let head_manifest = warp::head()
        .and(warp::path!("v2" / String / String / "manifests" / String))
        .and(with_gateway.clone())
        .and_then(head_manifest);
    let put_manifest = warp::put()
        .and(warp::path!("v2" / String / String / "manifests" / String))
        .and(warp::body::bytes())
        .and(with_gateway.clone())
        .and_then(put_manifest);
    let delete_manifest = warp::delete()
        .and(warp::path!("v2" / String / String / "manifests" / String))
        .and(with_gateway.clone())
        .and_then(delete_manifest);
    let get_blob = warp::get()
        .and(warp::path!("v2" / String / String / "blobs" / String))
        .and(with_gateway.clone())
        .and_then(get_blob);
    let head_blob = warp::head()
        .and(warp::path!("v2" / String / String / "blobs" / String))
        .and(with_gateway)
        .and_then(head_blob);

    health
        .or(version)
        .or(get_manifest)
        .or(head_manifest)
        .or(put_manifest)
        .or(delete_manifest)
        .or(get_blob)
        .or(head_blob)
}

/// Fetch a manifest, pulling it through from its origin if needed.
///
/// Implements GET /v2/{namespace}/{name}/manifests/{digest}
#[instrument(level = "info", skip(gateway))]
async fn get_manifest(
    namespace: String,
    name: String,
    digest: String,
    gateway: Arc<Gateway>,
) -> Result<Response<Body>, Infallible> {
    let digest = match validate(&namespace, &name, &digest) {
        Ok(digest) => digest,
        Err(response) => return Ok(response),
    };
    let manifests = gateway.manifests(&namespace, &name);
    match manifests.get(&digest).await {
        Ok(content) => {
            let media_type = manifest::versioned(&content)
                .map(|v| v.effective_media_type().to_owned())
                .unwrap_or_else(|_| OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_owned());
            debug!(%media_type, size = content.len(), "Serving manifest");
            Ok(content_response(Body::from(content), &media_type, &digest))
        }
        Err(e) => Ok(error_response(&e, OciErrorCode::ManifestUnknown)),
    }
}

/// Check for a locally stored manifest.
///
/// Implements HEAD /v2/{namespace}/{name}/manifests/{digest}
#[instrument(level = "info", skip(gateway))]
async fn head_manifest(
    namespace: String,
    name: String,
    digest: String,
    gateway: Arc<Gateway>,
) -> Result<Response<Body>, Infallible> {
    let digest = match validate(&namespace, &name, &digest) {
        Ok(digest) => digest,
        Err(response) => return Ok(response),
    };
    match gateway.manifests(&namespace, &name).exists(&digest).await {
        Ok(true) => Ok(head_response(None, &digest)),
        Ok(false) => Ok(error_response(
            &Error::ContentUnknown(digest),
            OciErrorCode::ManifestUnknown,
        )),
        Err(e) => Ok(error_response(&e, OciErrorCode::ManifestUnknown)),
    }
}

/// Implements PUT /v2/{namespace}/{name}/manifests/{reference}
#[instrument(level = "info", skip(body, gateway))]
async fn put_manifest(
    namespace: String,
    name: String,
    reference: String,
    body: Bytes,
    gateway: Arc<Gateway>,
) -> Result<Response<Body>, Infallible> {
    let result = gateway
        .manifests(&namespace, &name)
        .put(body.to_vec())
        .await;
    match result {
        Ok(digest) => Ok(head_response(None, &digest)),
        Err(e) => Ok(error_response(&e, OciErrorCode::ManifestUnknown)),
    }
}

/// Implements DELETE /v2/{namespace}/{name}/manifests/{digest}
#[instrument(level = "info", skip(gateway))]
async fn delete_manifest(
    namespace: String,
    name: String,
    digest: String,
    gateway: Arc<Gateway>,
) -> Result<Response<Body>, Infallible> {
    let digest = match validate(&namespace, &name, &digest) {
        Ok(digest) => digest,
        Err(response) => return Ok(response),
    };
    match gateway.manifests(&namespace, &name).delete(&digest).await {
        Ok(()) => Ok(return_with_code(StatusCode::ACCEPTED, Body::empty())),
        Err(e) => Ok(error_response(&e, OciErrorCode::ManifestUnknown)),
    }
}

/// Fetch a blob, from local storage or its remembered origin.
///
/// Implements GET /v2/{namespace}/{name}/blobs/{digest}
#[instrument(level = "info", skip(gateway))]
async fn get_blob(
    namespace: String,
    name: String,
    digest: String,
    gateway: Arc<Gateway>,
) -> Result<Response<Body>, Infallible> {
    let digest = match validate(&namespace, &name, &digest) {
        Ok(digest) => digest,
        Err(response) => return Ok(response),
    };
    match gateway.blobs(&namespace, &name).get(&digest).await {
        Ok(content) => Ok(content_response(
            Body::wrap_stream(content),
            "application/octet-stream",
            &digest,
        )),
        Err(e) => Ok(error_response(&e, OciErrorCode::BlobUnknown)),
    }
}

/// Implements HEAD /v2/{namespace}/{name}/blobs/{digest}
#[instrument(level = "info", skip(gateway))]
async fn head_blob(
    namespace: String,
    name: String,
    digest: String,
    gateway: Arc<Gateway>,
) -> Result<Response<Body>, Infallible> {
    let digest = match validate(&namespace, &name, &digest) {
        Ok(digest) => digest,
        Err(response) => return Ok(response),
    };
    match gateway.blobs(&namespace, &name).stat(&digest).await {
        Ok(size) => Ok(head_response(Some(size), &digest)),
        Err(e) => Ok(error_response(&e, OciErrorCode::BlobUnknown)),
    }
}

/// Repository path components follow the distribution naming rules:
/// lowercase alphanumerics separated by single `.`, `_` or `-`.
fn valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .split(|c| c == '.' || c == '_' || c == '-')
            .all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            })
}

fn validate(namespace: &str, name: &str, digest: &str) -> Result<Digest, Response<Body>> {
    if !valid_path_component(namespace) || !valid_path_component(name) {
        return Err(oci_error(
            StatusCode::BAD_REQUEST,
            OciErrorCode::NameInvalid,
            format!("invalid repository name {}/{}", namespace, name),
        ));
    }
    digest.parse().map_err(|e: crate::digest::InvalidDigest| {
        oci_error(StatusCode::BAD_REQUEST, OciErrorCode::DigestInvalid, e.to_string())
    })
}

fn content_response(body: Body, media_type: &str, digest: &Digest) -> Response<Body> {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    if let Ok(v) = media_type.parse() {
        headers.insert(CONTENT_TYPE, v);
    }
    if let Ok(v) = digest.as_str().parse() {
        headers.insert(DIGEST_HEADER, v);
    }
    response
}

fn head_response(size: Option<u64>, digest: &Digest) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    if let Some(size) = size {
        headers.insert(CONTENT_LENGTH, size.into());
    }
    if let Ok(v) = digest.as_str().parse() {
        headers.insert(DIGEST_HEADER, v);
    }
    response
}

/// Render an error as an OCI error envelope.
///
/// `not_found` is the code used for every flavour of missing content on the
/// route that failed.
fn error_response(err: &Error, not_found: OciErrorCode) -> Response<Body> {
    let (status, code) = match err {
        Error::ContentUnknown(_)
        | Error::ManifestUnknownRevision { .. }
        | Error::BlobUnknown { .. } => (StatusCode::NOT_FOUND, not_found),
        Error::UnsupportedOperation(_) => {
            (StatusCode::METHOD_NOT_ALLOWED, OciErrorCode::Unsupported)
        }
        Error::CatalogUnavailable(_) | Error::Cancelled => {
            error!(error = %err, "Unable to resolve content");
            (StatusCode::SERVICE_UNAVAILABLE, OciErrorCode::Unavailable)
        }
        Error::InvalidCapacity(_) | Error::InvalidOrigin(_) | Error::Other(_) => {
            error!(error = ?err, "Server error");
            (StatusCode::INTERNAL_SERVER_ERROR, OciErrorCode::Unknown)
        }
    };
    oci_error(status, code, err.to_string())
}

fn oci_error(status: StatusCode, code: OciErrorCode, message: String) -> Response<Body> {
    let envelope = OciEnvelope::from(OciError::new(code, message));
    match serde_json::to_vec(&envelope) {
        Ok(body) => {
            let mut response = return_with_code(status, Body::from(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => return_with_code(
            StatusCode::INTERNAL_SERVER_ERROR,
            Body::from(format!("Server error: {}", e)),
        ),
    }
}

fn return_with_code(code: StatusCode, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = code;
    response
}
