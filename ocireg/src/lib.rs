//! Client for the OCI/Docker Distribution v2 registry protocol: pull and
//! push of manifests and blobs with bearer/basic auth, mirror failover,
//! resumable reads, registry-to-registry copy, and import/export of the
//! combined OCI-layout / docker-save tar format.

mod archive;
pub mod auth;
pub mod blob;
pub mod client;
pub mod compress;
pub mod digest;
mod dispatch;
pub mod errors;
pub mod hosts;
mod image;
pub mod manifest;
pub mod ratelimit;
pub mod reference;
pub mod retry;

pub use blob::{Blob, BlobInfo, BlobSource, BlobStream, source_from_bytes, source_from_path};
pub use client::Client;
pub use compress::Compression;
pub use errors::{Error, Result};
pub use hosts::{HostConfig, HostMap, TlsMode};
pub use manifest::{Manifest, ManifestBody, RepoList, TagList};
pub use ratelimit::RateLimit;
pub use reference::Reference;
pub use retry::BlobReader;
