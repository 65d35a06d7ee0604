//! An [`ImageMetadataResolver`] backed by the cluster's image API.
//!
//! Image streams (`image.openshift.io/v1`) record, per tag, the history of
//! images the tag pointed at. Each of those images carries the reference it
//! was imported from, which is where the gateway pulls missing content.
use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::error::ErrorResponse;
use oci_distribution::Reference;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::metadata::{ImageMetadata, ImageMetadataResolver};

/// Image stream annotation allowing insecure transport to the origin.
pub const INSECURE_REPOSITORY_ANNOTATION: &str = "openshift.io/image.insecureRepository";

const IMAGE_GROUP: &str = "image.openshift.io";
const IMAGE_VERSION: &str = "v1";

#[derive(Debug, Default, Deserialize)]
struct ImageStream {
    #[serde(default)]
    metadata: StreamMeta,
    #[serde(default)]
    status: ImageStreamStatus,
}

#[derive(Debug, Default, Deserialize)]
struct StreamMeta {
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageStreamStatus {
    #[serde(default)]
    tags: Vec<NamedTagEventList>,
}

#[derive(Debug, Deserialize)]
struct NamedTagEventList {
    #[serde(default)]
    items: Vec<TagEvent>,
}

#[derive(Debug, Deserialize)]
struct TagEvent {
    image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Image {
    #[serde(default)]
    docker_image_reference: String,
    #[serde(default)]
    docker_image_manifest: String,
}

impl ImageStream {
    fn references(&self, digest: &Digest) -> bool {
        self.status
            .tags
            .iter()
            .flat_map(|t| t.items.iter())
            .any(|event| event.image == digest.as_str())
    }

    fn insecure_allowed(&self) -> bool {
        self.metadata
            .annotations
            .get(INSECURE_REPOSITORY_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

impl Image {
    fn into_metadata(self, insecure_allowed: bool) -> Result<ImageMetadata> {
        let origin = Reference::try_from(self.docker_image_reference.as_str())
            .map_err(|_| Error::InvalidOrigin(self.docker_image_reference.clone()))?;
        let raw_content = if self.docker_image_manifest.is_empty() {
            None
        } else {
            Some(self.docker_image_manifest.into_bytes())
        };
        Ok(ImageMetadata {
            origin,
            raw_content,
            insecure_allowed,
        })
    }
}

/// Resolves digests through image streams and images stored in the cluster.
#[derive(Clone)]
pub struct KubeImageCatalog {
    client: kube::Client,
}

impl KubeImageCatalog {
    /// Create a catalog that queries the cluster through `client`.
    pub fn new(client: kube::Client) -> Self {
        KubeImageCatalog { client }
    }

    fn image_streams(&self, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            IMAGE_GROUP,
            IMAGE_VERSION,
            "ImageStream",
        ));
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }

    fn images(&self) -> Api<DynamicObject> {
        let resource =
            ApiResource::from_gvk(&GroupVersionKind::gvk(IMAGE_GROUP, IMAGE_VERSION, "Image"));
        Api::all_with(self.client.clone(), &resource)
    }
}

#[async_trait]
impl ImageMetadataResolver for KubeImageCatalog {
    #[instrument(level = "debug", skip(self))]
    async fn resolve(
        &self,
        namespace: &str,
        name: &str,
        digest: &Digest,
    ) -> Result<ImageMetadata> {
        let stream: ImageStream = concrete(
            self.image_streams(namespace)
                .get(name)
                .await
                .map_err(|e| classify(e, digest))?,
        )?;
        if !stream.references(digest) {
            debug!("Digest is not part of the image stream history");
            return Err(Error::ContentUnknown(digest.clone()));
        }

        let image: Image = concrete(
            self.images()
                .get(digest.as_str())
                .await
                .map_err(|e| classify(e, digest))?,
        )?;
        image.into_metadata(stream.insecure_allowed())
    }
}

/// A missing object means the catalog has no record; anything else means the
/// catalog could not answer.
fn classify(error: kube::Error, digest: &Digest) -> Error {
    match error {
        kube::Error::Api(ErrorResponse { code: 404, .. }) => Error::ContentUnknown(digest.clone()),
        e => Error::CatalogUnavailable(e.into()),
    }
}

/// Convert a `DynamicObject` into one of the typed views above by going
/// through JSON.
fn concrete<T: DeserializeOwned>(object: DynamicObject) -> Result<T> {
    let value = serde_json::to_value(&object).map_err(anyhow::Error::from)?;
    Ok(serde_json::from_value(value).map_err(anyhow::Error::from)?)
}

#[cfg(test)]
mod test {
    use super::*;

    const DIGEST: &str = "sha256:958608f8ecc1dc62c93b6c610f3a834dae4220c9642e6e8b4e0f2b3ad7cbd238";

    fn dynamic(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).expect("valid dynamic object")
    }

    fn stream(annotations: serde_json::Value, images: &[&str]) -> ImageStream {
        let items: Vec<_> = images
            .iter()
            .map(|i| serde_json::json!({ "image": i, "dockerImageReference": "ignored" }))
            .collect();
        concrete(dynamic(serde_json::json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": "ImageStream",
            "metadata": { "name": "app", "namespace": "user", "annotations": annotations },
            "status": { "tags": [ { "tag": "latest", "items": items } ] }
        })))
        .expect("image stream")
    }

    #[test]
    fn stream_must_reference_the_digest() {
        let s = stream(serde_json::json!({}), &[DIGEST]);
        assert!(s.references(&Digest::new_unchecked(DIGEST)));
        assert!(!s.references(&Digest::new_unchecked("sha256:0000")));
        assert!(!s.insecure_allowed());
    }

    #[test]
    fn stream_without_status_references_nothing() {
        let s: ImageStream = concrete(dynamic(serde_json::json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": "ImageStream",
            "metadata": { "name": "app" }
        })))
        .unwrap();
        assert!(!s.references(&Digest::new_unchecked(DIGEST)));
    }

    #[test]
    fn insecure_annotation_is_honoured() {
        let s = stream(
            serde_json::json!({ INSECURE_REPOSITORY_ANNOTATION: "true" }),
            &[DIGEST],
        );
        assert!(s.insecure_allowed());
        let s = stream(
            serde_json::json!({ INSECURE_REPOSITORY_ANNOTATION: "yes" }),
            &[DIGEST],
        );
        assert!(!s.insecure_allowed());
    }

    #[test]
    fn image_without_manifest_needs_a_remote_fetch() {
        let image: Image = concrete(dynamic(serde_json::json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": "Image",
            "metadata": { "name": DIGEST },
            "dockerImageReference": format!("example.com:5000/user/app@{}", DIGEST),
            "dockerImageManifest": ""
        })))
        .unwrap();
        let metadata = image.into_metadata(true).unwrap();
        assert_eq!("example.com:5000", metadata.origin.registry());
        assert_eq!("user/app", metadata.origin.repository());
        assert_eq!(Some(DIGEST), metadata.origin.digest());
        assert!(metadata.raw_content.is_none());
        assert!(metadata.insecure_allowed);
    }

    #[test]
    fn image_with_manifest_carries_its_content() {
        let image: Image = concrete(dynamic(serde_json::json!({
            "apiVersion": "image.openshift.io/v1",
            "kind": "Image",
            "metadata": { "name": DIGEST },
            "dockerImageReference": format!("quay.io/user/app@{}", DIGEST),
            "dockerImageManifest": "{\"schemaVersion\":2}"
        })))
        .unwrap();
        let metadata = image.into_metadata(false).unwrap();
        assert_eq!(
            Some(b"{\"schemaVersion\":2}".to_vec()),
            metadata.raw_content
        );
    }

    #[test]
    fn malformed_origin_is_rejected() {
        let image = Image {
            docker_image_reference: "not a reference".to_owned(),
            docker_image_manifest: String::new(),
        };
        assert!(matches!(
            image.into_metadata(false),
            Err(Error::InvalidOrigin(r)) if r == "not a reference"
        ));
    }

    #[test]
    fn not_found_and_outage_are_told_apart() {
        let digest = Digest::new_unchecked(DIGEST);
        let not_found = kube::Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: "imagestreams.image.openshift.io \"app\" not found".to_owned(),
            reason: "NotFound".to_owned(),
            code: 404,
        });
        assert!(classify(not_found, &digest).is_content_unknown());

        let forbidden = kube::Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: "forbidden".to_owned(),
            reason: "Forbidden".to_owned(),
            code: 403,
        });
        assert!(matches!(
            classify(forbidden, &digest),
            Error::CatalogUnavailable(_)
        ));
    }
}
