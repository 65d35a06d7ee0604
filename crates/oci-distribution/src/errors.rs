//! Errors related to interacting with an OCI compliant remote store

/// The OCI specification defines a specific error format.
///
/// This struct represents that error format, which is formally described here:
/// https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
///
/// The same shape is used both for errors decoded from an upstream registry
/// and for errors a registry front renders to its own clients.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct OciError {
    /// The error code
    pub code: OciErrorCode,
    /// An optional message associated with the error
    #[serde(default)]
    pub message: String,
    /// Unstructured optional data associated with the error
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl OciError {
    /// Create an error with the given code and message and no detail.
    pub fn new(code: OciErrorCode, message: impl Into<String>) -> Self {
        OciError {
            code,
            message: message.into(),
            detail: serde_json::Value::Null,
        }
    }

    /// Whether this error tells the client that the requested content does
    /// not exist, as opposed to a failure reaching or using it.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code,
            OciErrorCode::BlobUnknown
                | OciErrorCode::ManifestUnknown
                | OciErrorCode::ManifestBlobUnknown
                | OciErrorCode::NameUnknown
        )
    }
}

impl std::error::Error for OciError {}

impl std::fmt::Display for OciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OCI API error: {}", self.message.as_str())
    }
}

/// The envelope wrapping every OCI error response body.
#[derive(serde::Deserialize, serde::Serialize, Debug)]
pub struct OciEnvelope {
    /// The errors reported by the registry
    pub errors: Vec<OciError>,
}

impl From<OciError> for OciEnvelope {
    fn from(error: OciError) -> Self {
        OciEnvelope {
            errors: vec![error],
        }
    }
}

/// OCI error codes
///
/// Outlined here: https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciErrorCode {
    /// Blob unknown to registry
    BlobUnknown,
    /// Blob upload is invalid
    BlobUploadInvalid,
    /// Blob upload is unknown to registry
    BlobUploadUnknown,
    /// Provided digest did not match uploaded content.
    DigestInvalid,
    /// Blob is unknown to registry
    ManifestBlobUnknown,
    /// Manifest is invalid
    ManifestInvalid,
    /// Manifest unknown
    ///
    /// This error is returned when the manifest, identified by name and tag is unknown to the repository.
    ManifestUnknown,
    /// Invalid repository name
    NameInvalid,
    /// Repository name is not known
    NameUnknown,
    /// Provided length did not match content length
    SizeInvalid,
    /// Authentication required.
    Unauthorized,
    /// Requested access to the resource is denied
    Denied,
    /// This operation is unsupported
    Unsupported,
    /// Too many requests from client
    Toomanyrequests,
    /// The registry failed for a reason it does not classify further
    Unknown,
    /// The registry could not serve the request right now.
    ///
    /// Not part of the distribution spec; used for errors the registry front
    /// reports when one of its own dependencies is down.
    Unavailable,
}
