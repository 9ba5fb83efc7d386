//! In-memory registry
//!
//! [`MemoryRegistry`] serves any number of registry hosts from memory. Blob content is stored
//! once per host and linked into repositories, so cross-repository mounts behave like a real
//! registry. Every write is counted and manifest pushes are recorded, and manifest rejections
//! can be injected per repository and media type.

use crate::digest::Digest;
use crate::error::RegistryError;
use crate::manifest::{Descriptor, Manifest};
use crate::reference::ImageReference;
use crate::registry::{
    BlobCreateOptions, BlobStore, BlobStream, BlobWriter, CreateOutcome, ManifestService,
    Repository, RepositoryConnector, Scope, TagService,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

const OCTET_STREAM: &str = "application/octet-stream";
const STREAM_CHUNK: usize = 4096;

/// Write calls observed by the registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub blob_puts: usize,
    pub upload_sessions: usize,
    pub commits: usize,
    pub cancels: usize,
    pub mounts: usize,
    pub manifest_puts: usize,
}

impl WriteCounts {
    pub fn total(&self) -> usize {
        self.blob_puts + self.upload_sessions + self.commits + self.mounts + self.manifest_puts
    }
}

/// One attempted manifest push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPush {
    pub registry: String,
    pub repository: String,
    pub media_type: String,
    pub tag: Option<String>,
    pub digest: Digest,
    pub accepted: bool,
}

#[derive(Default)]
struct RepoState {
    blobs: HashSet<Digest>,
    manifests: HashMap<Digest, (String, Bytes)>,
    tags: HashMap<String, Digest>,
}

#[derive(Default)]
struct HostState {
    content: HashMap<Digest, Bytes>,
    repositories: HashMap<String, RepoState>,
}

struct Rejection {
    registry: String,
    repository: String,
    media_type: String,
    error: RegistryError,
}

#[derive(Default)]
struct State {
    hosts: HashMap<String, HostState>,
    counts: WriteCounts,
    pushes: Vec<ManifestPush>,
    rejections: Vec<Rejection>,
    unreachable: HashSet<String>,
    corrupt_puts: bool,
    ignore_mounts: bool,
}

impl State {
    fn repo(&mut self, registry: &str, repository: &str) -> &mut RepoState {
        self.hosts
            .entry(registry.to_string())
            .or_default()
            .repositories
            .entry(repository.to_string())
            .or_default()
    }

    fn linked(&self, registry: &str, repository: &str, digest: &Digest) -> Option<Bytes> {
        let host = self.hosts.get(registry)?;
        let repo = host.repositories.get(repository)?;
        if !repo.blobs.contains(digest) {
            return None;
        }
        host.content.get(digest).cloned()
    }

    fn store_blob(&mut self, registry: &str, repository: &str, data: Bytes) -> Digest {
        let digest = Digest::from_bytes(&data);
        self.hosts
            .entry(registry.to_string())
            .or_default()
            .content
            .insert(digest.clone(), data);
        self.repo(registry, repository).blobs.insert(digest.clone());
        digest
    }
}

#[derive(Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<Mutex<State>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Store a blob in `registry/repository` and return its descriptor
    pub fn add_blob(&self, registry: &str, repository: &str, data: &[u8]) -> Descriptor {
        let digest = self
            .lock()
            .store_blob(registry, repository, Bytes::copy_from_slice(data));
        Descriptor::new(OCTET_STREAM, data.len() as u64, digest)
    }

    /// Store a manifest, optionally tagging it
    pub fn add_manifest(&self, registry: &str, repository: &str, manifest: &Manifest, tag: Option<&str>) -> Digest {
        let digest = manifest.digest();
        let mut state = self.lock();
        let repo = state.repo(registry, repository);
        repo.manifests.insert(
            digest.clone(),
            (manifest.media_type().to_string(), manifest.payload().clone()),
        );
        if let Some(tag) = tag {
            repo.tags.insert(tag.to_string(), digest.clone());
        }
        digest
    }

    /// Fail every push of `media_type` manifests to `registry/repository` with `error`
    pub fn reject_manifests(&self, registry: &str, repository: &str, media_type: &str, error: RegistryError) {
        self.lock().rejections.push(Rejection {
            registry: registry.to_string(),
            repository: repository.to_string(),
            media_type: media_type.to_string(),
            error,
        });
    }

    /// Make whole-blob puts report a digest that does not match the content
    pub fn set_corrupt_puts(&self, corrupt: bool) {
        self.lock().corrupt_puts = corrupt;
    }

    /// Decline every mount request, as registries without cross-repository mount do
    pub fn set_ignore_mounts(&self, ignore: bool) {
        self.lock().ignore_mounts = ignore;
    }

    /// Fail connections to `registry`
    pub fn set_unreachable(&self, registry: &str) {
        self.lock().unreachable.insert(registry.to_string());
    }

    pub fn counts(&self) -> WriteCounts {
        self.lock().counts.clone()
    }

    pub fn pushes(&self) -> Vec<ManifestPush> {
        self.lock().pushes.clone()
    }

    pub fn has_blob(&self, registry: &str, repository: &str, digest: &Digest) -> bool {
        self.lock().linked(registry, repository, digest).is_some()
    }

    pub fn tag(&self, registry: &str, repository: &str, tag: &str) -> Option<Digest> {
        let state = self.lock();
        state
            .hosts
            .get(registry)?
            .repositories
            .get(repository)?
            .tags
            .get(tag)
            .cloned()
    }

    pub fn manifest(&self, registry: &str, repository: &str, digest: &Digest) -> Option<Manifest> {
        let state = self.lock();
        let (media_type, payload) = state
            .hosts
            .get(registry)?
            .repositories
            .get(repository)?
            .manifests
            .get(digest)?
            .clone();
        Manifest::from_bytes(Some(&media_type), payload).ok()
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RepositoryConnector for MemoryRegistry {
    async fn repository(
        &self,
        reference: &ImageReference,
        _insecure: bool,
    ) -> Result<Arc<dyn Repository>, RegistryError> {
        if self.lock().unreachable.contains(&reference.registry) {
            return Err(RegistryError::Network(format!(
                "dial tcp {}: connection refused",
                reference.registry
            )));
        }
        Ok(Arc::new(MemoryRepository {
            named: reference.as_repository(),
            handle: Handle {
                state: self.state.clone(),
                registry: reference.registry.clone(),
                repository: reference.repository.clone(),
            },
        }))
    }

    fn scoped(&self, _actions: &[&str], _scopes: &[Scope]) -> Arc<dyn RepositoryConnector> {
        Arc::new(self.clone())
    }
}

#[derive(Clone)]
struct Handle {
    state: Arc<Mutex<State>>,
    registry: String,
    repository: String,
}

impl Handle {
    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }
}

struct MemoryRepository {
    named: ImageReference,
    handle: Handle,
}

impl Repository for MemoryRepository {
    fn named(&self) -> &ImageReference {
        &self.named
    }

    fn blobs(&self) -> Arc<dyn BlobStore> {
        Arc::new(MemoryBlobs(self.handle.clone()))
    }

    fn manifests(&self) -> Arc<dyn ManifestService> {
        Arc::new(MemoryManifests(self.handle.clone()))
    }

    fn tags(&self) -> Arc<dyn TagService> {
        Arc::new(MemoryTags(self.handle.clone()))
    }
}

struct MemoryBlobs(Handle);

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, RegistryError> {
        let h = &self.0;
        h.lock()
            .linked(&h.registry, &h.repository, digest)
            .map(|data| Descriptor::new(OCTET_STREAM, data.len() as u64, digest.clone()))
            .ok_or(RegistryError::BlobUnknown)
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes, RegistryError> {
        let h = &self.0;
        h.lock()
            .linked(&h.registry, &h.repository, digest)
            .ok_or(RegistryError::BlobUnknown)
    }

    async fn open(&self, digest: &Digest) -> Result<BlobStream, RegistryError> {
        let data = self.get(digest).await?;
        let chunks: Vec<Result<Bytes, RegistryError>> = (0..data.len())
            .step_by(STREAM_CHUNK)
            .map(|start| Ok(data.slice(start..(start + STREAM_CHUNK).min(data.len()))))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn create(&self, options: BlobCreateOptions) -> Result<CreateOutcome, RegistryError> {
        let h = &self.0;
        let mut state = h.lock();
        state.counts.upload_sessions += 1;

        if let Some(from) = options.mount_from.as_ref().filter(|_| !state.ignore_mounts) {
            let mounted = from.digest.as_ref().and_then(|digest| {
                if from.registry != h.registry {
                    return None;
                }
                state
                    .linked(&h.registry, &from.repository, digest)
                    .map(|data| (digest.clone(), data.len() as u64))
            });
            if let Some((digest, size)) = mounted {
                state.repo(&h.registry, &h.repository).blobs.insert(digest.clone());
                state.counts.mounts += 1;
                let descriptor = match options.descriptor {
                    Some(d) => d,
                    None => Descriptor::new(OCTET_STREAM, size, digest),
                };
                return Ok(CreateOutcome::Mounted(descriptor));
            }
        }

        Ok(CreateOutcome::Writer(Box::new(MemoryWriter {
            handle: h.clone(),
            buffer: Vec::new(),
        })))
    }

    async fn put(&self, media_type: &str, data: Bytes) -> Result<Descriptor, RegistryError> {
        let h = &self.0;
        let mut state = h.lock();
        state.counts.blob_puts += 1;
        let size = data.len() as u64;
        if state.corrupt_puts {
            let mut altered = data.to_vec();
            altered.push(0);
            return Ok(Descriptor::new(media_type, size, Digest::from_bytes(&altered)));
        }
        let digest = state.store_blob(&h.registry, &h.repository, data);
        Ok(Descriptor::new(media_type, size, digest))
    }
}

struct MemoryWriter {
    handle: Handle,
    buffer: Vec<u8>,
}

#[async_trait]
impl BlobWriter for MemoryWriter {
    async fn write_from(&mut self, mut stream: BlobStream) -> Result<u64, RegistryError> {
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            self.buffer.extend_from_slice(&chunk);
        }
        Ok(written)
    }

    async fn commit(&mut self, descriptor: &Descriptor) -> Result<Descriptor, RegistryError> {
        let mut state = self.handle.lock();
        state.counts.commits += 1;
        descriptor.digest.verify(&self.buffer)?;
        let buffer = std::mem::take(&mut self.buffer);
        state.store_blob(&self.handle.registry, &self.handle.repository, Bytes::from(buffer));
        Ok(descriptor.clone())
    }

    async fn cancel(self: Box<Self>) -> Result<(), RegistryError> {
        self.handle.lock().counts.cancels += 1;
        Ok(())
    }
}

struct MemoryManifests(Handle);

#[async_trait]
impl ManifestService for MemoryManifests {
    async fn exists(&self, digest: &Digest) -> Result<bool, RegistryError> {
        let h = &self.0;
        let state = h.lock();
        Ok(state
            .hosts
            .get(&h.registry)
            .and_then(|host| host.repositories.get(&h.repository))
            .is_some_and(|repo| repo.manifests.contains_key(digest)))
    }

    async fn get(&self, digest: &Digest, _media_types: &[&str]) -> Result<Manifest, RegistryError> {
        let h = &self.0;
        let (media_type, payload) = {
            let state = h.lock();
            state
                .hosts
                .get(&h.registry)
                .and_then(|host| host.repositories.get(&h.repository))
                .and_then(|repo| repo.manifests.get(digest))
                .cloned()
                .ok_or_else(|| RegistryError::ManifestUnknown(digest.to_string()))?
        };
        Manifest::from_bytes(Some(&media_type), payload)
    }

    async fn put(&self, manifest: &Manifest, tag: Option<&str>) -> Result<Digest, RegistryError> {
        let h = &self.0;
        let mut state = h.lock();
        state.counts.manifest_puts += 1;
        let digest = manifest.digest();

        let rejected = state
            .rejections
            .iter()
            .find(|r| {
                r.registry == h.registry
                    && r.repository == h.repository
                    && r.media_type == manifest.media_type()
            })
            .map(|r| r.error.clone());

        state.pushes.push(ManifestPush {
            registry: h.registry.clone(),
            repository: h.repository.clone(),
            media_type: manifest.media_type().to_string(),
            tag: tag.map(str::to_string),
            digest: digest.clone(),
            accepted: rejected.is_none(),
        });
        if let Some(error) = rejected {
            return Err(error);
        }

        let repo = state.repo(&h.registry, &h.repository);
        repo.manifests.insert(
            digest.clone(),
            (manifest.media_type().to_string(), manifest.payload().clone()),
        );
        if let Some(tag) = tag {
            repo.tags.insert(tag.to_string(), digest.clone());
        }
        Ok(digest)
    }
}

struct MemoryTags(Handle);

#[async_trait]
impl TagService for MemoryTags {
    async fn get(&self, tag: &str) -> Result<Descriptor, RegistryError> {
        let h = &self.0;
        let state = h.lock();
        let repo = state
            .hosts
            .get(&h.registry)
            .and_then(|host| host.repositories.get(&h.repository))
            .ok_or_else(|| RegistryError::ManifestUnknown(tag.to_string()))?;
        let digest = repo
            .tags
            .get(tag)
            .ok_or_else(|| RegistryError::ManifestUnknown(tag.to_string()))?;
        let (media_type, payload) = repo
            .manifests
            .get(digest)
            .ok_or_else(|| RegistryError::ManifestUnknown(tag.to_string()))?;
        Ok(Descriptor::new(media_type, payload.len() as u64, digest.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_mount_links_existing_blob() {
        let registry = MemoryRegistry::new();
        let desc = registry.add_blob("reg.example", "ns/src", b"layer");
        let repo = registry.repository(&reference("reg.example/ns/dst"), false).await.unwrap();

        let outcome = repo
            .blobs()
            .create(BlobCreateOptions {
                mount_from: Some(reference("reg.example/ns/src").with_digest(&desc.digest)),
                descriptor: Some(desc.clone()),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Mounted(_)));
        assert!(registry.has_blob("reg.example", "ns/dst", &desc.digest));
        assert_eq!(registry.counts().mounts, 1);
    }

    #[tokio::test]
    async fn test_commit_verifies_content() {
        let registry = MemoryRegistry::new();
        let repo = registry.repository(&reference("reg.example/ns/dst"), false).await.unwrap();
        let CreateOutcome::Writer(mut writer) = repo.blobs().create(BlobCreateOptions::default()).await.unwrap() else {
            panic!("expected writer");
        };
        let stream = futures::stream::iter(vec![Ok(Bytes::from_static(b"abc"))]).boxed();
        assert_eq!(writer.write_from(stream).await.unwrap(), 3);
        let wrong = Descriptor::new(OCTET_STREAM, 3, Digest::from_bytes(b"xyz"));
        assert!(matches!(
            writer.commit(&wrong).await,
            Err(RegistryError::DigestMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        let registry = MemoryRegistry::new();
        registry.set_unreachable("down.example");
        assert!(registry.repository(&reference("down.example/a"), false).await.is_err());
    }
}
