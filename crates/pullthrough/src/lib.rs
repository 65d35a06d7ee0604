//! Pull-through resolution for a container registry gateway.
//!
//! When a manifest is missing from local storage, the gateway asks the
//! cluster's image catalog where the content was mirrored from, fetches it
//! from that origin and remembers the origin of the manifest and its blobs in
//! a bounded [`DigestRepositoryCache`], so subsequent blob requests go straight
//! to the right upstream.
//!
//! ```rust,no_run
//! use pullthrough::config::Config;
//! use pullthrough::Gateway;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let config = Config::default_config()?;
//!     let client = kube::Client::try_default().await?;
//!     Gateway::new(config, client)?.start().await
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

mod blob;
mod cache;
mod catalog;
pub mod config;
mod digest;
mod error;
mod gateway;
pub mod local;
mod manifest;
mod metadata;
pub mod remote;
mod repository;
pub mod webserver;

#[cfg(test)]
mod testing;

pub use blob::PullthroughBlobService;
pub use cache::{DigestRepositoryCache, RepositoryLocation};
pub use catalog::{KubeImageCatalog, INSECURE_REPOSITORY_ANNOTATION};
pub use digest::{Digest, InvalidDigest};
pub use error::{Error, MissCause, Result};
pub use gateway::Gateway;
pub use manifest::PullthroughManifestService;
pub use metadata::{ImageMetadata, ImageMetadataResolver};
pub use repository::Repository;
