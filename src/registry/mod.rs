//! Registry capabilities
//!
//! The mirror engine talks to registries only through the traits in this module: a
//! [`RepositoryConnector`] opens a [`Repository`], which exposes a [`BlobStore`], a
//! [`ManifestService`] and a [`TagService`]. [`client::RegistryContext`] implements them over
//! the Docker Registry HTTP API v2 and [`memory::MemoryRegistry`] implements them in memory.

pub mod auth;
pub mod blobs;
pub mod client;
pub mod credentials;
pub mod manifests;
pub mod memory;

pub use auth::{Auth, Scope};
pub use client::RegistryContext;
pub use credentials::CredentialStore;
pub use memory::MemoryRegistry;

use crate::digest::Digest;
use crate::error::RegistryError;
use crate::manifest::{Descriptor, Manifest};
use crate::reference::ImageReference;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Stream of blob content chunks
pub type BlobStream = BoxStream<'static, Result<Bytes, RegistryError>>;

/// Options for starting a blob upload
#[derive(Debug, Clone, Default)]
pub struct BlobCreateOptions {
    /// Repository in the same registry to mount the blob from, with the blob digest set
    pub mount_from: Option<ImageReference>,
    /// Descriptor of the blob about to be written
    pub descriptor: Option<Descriptor>,
}

/// Result of [`BlobStore::create`]
pub enum CreateOutcome {
    /// An upload session to stream the blob into
    Writer(Box<dyn BlobWriter>),
    /// The registry mounted the blob from another repository; nothing to upload
    Mounted(Descriptor),
}

impl std::fmt::Debug for CreateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateOutcome::Writer(_) => f.write_str("Writer"),
            CreateOutcome::Mounted(desc) => f.debug_tuple("Mounted").field(desc).finish(),
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Descriptor of a blob present in the repository, or `BlobUnknown`
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, RegistryError>;

    /// Fetch a whole blob into memory
    async fn get(&self, digest: &Digest) -> Result<Bytes, RegistryError>;

    /// Open a blob for streaming
    async fn open(&self, digest: &Digest) -> Result<BlobStream, RegistryError>;

    /// Start an upload, or mount when `options.mount_from` is set and the registry agrees
    async fn create(&self, options: BlobCreateOptions) -> Result<CreateOutcome, RegistryError>;

    /// Upload a whole blob in one request
    async fn put(&self, media_type: &str, data: Bytes) -> Result<Descriptor, RegistryError>;
}

/// An open upload session
#[async_trait]
pub trait BlobWriter: Send {
    /// Stream content into the session and return the number of bytes written
    async fn write_from(&mut self, stream: BlobStream) -> Result<u64, RegistryError>;

    /// Finish the upload, verifying the content against `descriptor`. The session stays open
    /// when this fails and must be canceled by the caller.
    async fn commit(&mut self, descriptor: &Descriptor) -> Result<Descriptor, RegistryError>;

    /// Abandon the upload
    async fn cancel(self: Box<Self>) -> Result<(), RegistryError>;
}

#[async_trait]
pub trait ManifestService: Send + Sync {
    async fn exists(&self, digest: &Digest) -> Result<bool, RegistryError>;

    /// Fetch a manifest by digest, accepting the given media types
    async fn get(&self, digest: &Digest, media_types: &[&str]) -> Result<Manifest, RegistryError>;

    /// Push a manifest, under `tag` when given and by digest otherwise
    async fn put(&self, manifest: &Manifest, tag: Option<&str>) -> Result<Digest, RegistryError>;
}

#[async_trait]
pub trait TagService: Send + Sync {
    /// Resolve a tag to the descriptor of the manifest it points at
    async fn get(&self, tag: &str) -> Result<Descriptor, RegistryError>;
}

pub trait Repository: Send + Sync {
    /// The repository this handle was opened for, without tag or digest
    fn named(&self) -> &ImageReference;
    fn blobs(&self) -> Arc<dyn BlobStore>;
    fn manifests(&self) -> Arc<dyn ManifestService>;
    fn tags(&self) -> Arc<dyn TagService>;
}

#[async_trait]
pub trait RepositoryConnector: Send + Sync {
    /// Open the repository named by `reference` (tag and digest are ignored)
    async fn repository(
        &self,
        reference: &ImageReference,
        insecure: bool,
    ) -> Result<Arc<dyn Repository>, RegistryError>;

    /// A connector that requests `actions` on each repository it opens plus the extra
    /// `scopes` in the same token
    fn scoped(&self, actions: &[&str], scopes: &[Scope]) -> Arc<dyn RepositoryConnector>;
}
