//! A pull-only OCI Distribution client for fetching manifests and blobs from
//! an OCI compliant remote store
#![cfg_attr(not(test), deny(missing_docs))]

pub mod client;
pub mod errors;
pub mod manifest;
mod reference;
pub mod secrets;
mod token_cache;

#[doc(inline)]
pub use client::Client;
#[doc(inline)]
pub use reference::{ParseError, Reference};
