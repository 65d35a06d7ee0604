//! Errors surfaced by the pull-through services and their collaborators.
use std::fmt;

use thiserror::Error;

use crate::digest::Digest;

/// Why a manifest request ended in [`Error::ManifestUnknownRevision`].
///
/// Callers only ever see the unified not-found error; the cause exists so
/// logs can tell the different dead ends apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissCause {
    /// The catalog has no record tying the digest to the repository.
    Unresolved,
    /// The catalog record points at an origin that cannot be used.
    MalformedOrigin,
    /// The origin answered that it does not have the content.
    RemoteNotFound,
    /// The origin could not be reached or served something unusable.
    RemoteFailed,
}

impl fmt::Display for MissCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cause = match self {
            MissCause::Unresolved => "unresolved",
            MissCause::MalformedOrigin => "malformed-origin",
            MissCause::RemoteNotFound => "remote-not-found",
            MissCause::RemoteFailed => "remote-failed",
        };
        f.write_str(cause)
    }
}

/// Describes the ways resolving content through the gateway can fail.
#[derive(Error, Debug)]
pub enum Error {
    /// A collaborator does not hold the requested content.
    #[error("unknown content {0}")]
    ContentUnknown(Digest),
    /// No local copy and no usable origin exist for a manifest.
    #[error("unknown manifest {name}@{digest}")]
    ManifestUnknownRevision {
        /// `<namespace>/<name>` of the repository asked for the manifest
        name: String,
        /// The requested digest
        digest: Digest,
        /// Where resolution gave up
        cause: MissCause,
    },
    /// No local copy and no remembered origin exist for a blob.
    #[error("unknown blob {name}@{digest}")]
    BlobUnknown {
        /// `<namespace>/<name>` of the repository asked for the blob
        name: String,
        /// The requested digest
        digest: Digest,
    },
    /// The pull-through path is read only.
    #[error("operation {0} is not supported")]
    UnsupportedOperation(&'static str),
    /// The digest cache must hold at least one entry.
    #[error("invalid digest cache capacity {0}")]
    InvalidCapacity(usize),
    /// The catalog recorded an origin reference that cannot be parsed.
    #[error("invalid origin reference {0:?}")]
    InvalidOrigin(String),
    /// The image catalog could not be queried.
    #[error("image catalog unavailable: {0}")]
    CatalogUnavailable(#[source] anyhow::Error),
    /// The request was abandoned before it completed.
    #[error("request cancelled")]
    Cancelled,
    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this is a collaborator's "unknown content" answer.
    pub fn is_content_unknown(&self) -> bool {
        matches!(self, Error::ContentUnknown(_))
    }
}

/// Results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
