//! Manifest formats served by OCI and Docker registries
//!
//! The gateway never rewrites manifests. It only needs to know which media
//! type to announce and which blobs a manifest points at, so the types here
//! decode just enough of each format to answer those two questions.
use std::collections::HashMap;

/// The mediatype for a Docker v2 schema 2 manifest.
pub const IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// The mediatype for a Docker v2 schema 2 manifest list.
pub const IMAGE_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// The mediatype for a signed Docker v2 schema 1 manifest.
pub const IMAGE_MANIFEST_SCHEMA1_SIGNED_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// The mediatype for an OCI image manifest.
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// The mediatype for an OCI image index.
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Every manifest media type the gateway is willing to fetch from an origin.
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[
    IMAGE_MANIFEST_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    OCI_IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    IMAGE_MANIFEST_SCHEMA1_SIGNED_MEDIA_TYPE,
];

/// Versioned provides a struct with the manifest's schemaVersion and mediaType.
/// Incoming content with unknown schema versions can be decoded against this
/// struct to check the version.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned {
    /// schema_version is the image manifest schema that this image follows
    pub schema_version: i32,

    /// media_type is the media type of this schema.
    pub media_type: Option<String>,
}

impl Versioned {
    /// The media type a registry should announce for this manifest.
    ///
    /// Schema 1 manifests never carry a `mediaType` field, and schema 2
    /// manifests written by older tooling may omit it too.
    pub fn effective_media_type(&self) -> &str {
        match (&self.media_type, self.schema_version) {
            (Some(media_type), _) => media_type.as_str(),
            (None, 1) => IMAGE_MANIFEST_SCHEMA1_SIGNED_MEDIA_TYPE,
            (None, _) => OCI_IMAGE_MANIFEST_MEDIA_TYPE,
        }
    }
}

/// The OCI descriptor is a generic object used to describe other objects.
///
/// It is defined in the OCI Image Specification:
/// https://github.com/opencontainers/image-spec/blob/master/descriptor.md#properties
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    /// The media type of the referenced content.
    #[serde(default)]
    pub media_type: String,
    /// The digest of the targeted content.
    pub digest: String,
    /// The size, in bytes, of the raw content.
    #[serde(default)]
    pub size: i64,
    /// Optional metadata for this descriptor.
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct FsLayer {
    blob_sum: String,
}

/// The parts of a manifest that point at other content.
///
/// One struct covers schema 1 (`fsLayers`), schema 2 and OCI image manifests
/// (`config` and `layers`) and manifest lists / indexes (`manifests`). Fields
/// that a given format does not use are simply absent.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestReferences {
    config: Option<OciDescriptor>,
    #[serde(default)]
    layers: Vec<OciDescriptor>,
    #[serde(default)]
    manifests: Vec<OciDescriptor>,
    #[serde(default)]
    fs_layers: Vec<FsLayer>,
}

/// Decode the schema version and media type of a raw manifest.
pub fn versioned(payload: &[u8]) -> anyhow::Result<Versioned> {
    serde_json::from_slice(payload)
        .map_err(|e| anyhow::anyhow!("Failed to parse manifest as a Versioned object: {}", e))
}

/// List the digests of all content a raw manifest refers to, deduplicated
/// and in document order.
///
/// Schema 1 manifests repeat the empty layer many times, so duplicates are
/// dropped.
pub fn referenced_digests(payload: &[u8]) -> anyhow::Result<Vec<String>> {
    let refs: ManifestReferences = serde_json::from_slice(payload)
        .map_err(|e| anyhow::anyhow!("Failed to parse manifest references: {}", e))?;

    let mut digests: Vec<String> = Vec::new();
    let candidates = refs
        .config
        .into_iter()
        .chain(refs.layers)
        .chain(refs.manifests)
        .map(|d| d.digest)
        .chain(refs.fs_layers.into_iter().map(|l| l.blob_sum));
    for digest in candidates {
        if !digest.is_empty() && !digests.contains(&digest) {
            digests.push(digest);
        }
    }
    Ok(digests)
}
