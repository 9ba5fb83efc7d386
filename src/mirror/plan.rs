//! Planned work
//!
//! A [`Plan`] owns one [`RegistryPlan`] per destination registry, which owns one
//! [`RepositoryPlan`] per destination repository. Repository plans hold the blob copies and
//! manifest pushes that bring the repository up to date. Blob descriptors and source
//! manifests are stored once on the plan and looked up by digest.
//!
//! Planning writes into the tree from many tasks, so every level carries its own lock. Locks
//! are never held across an await.

use super::mappings::DestinationType;
use crate::digest::Digest;
use crate::error::MirrorError;
use crate::logging::{Logger, format_size};
use crate::manifest::{Descriptor, Manifest};
use crate::reference::ImageReference;
use crate::registry::{BlobStore, ManifestService};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Blobs to copy from one source repository into one destination repository
#[derive(Clone)]
pub struct BlobCopy {
    pub from: Arc<dyn BlobStore>,
    pub to: Arc<dyn BlobStore>,
    pub from_ref: ImageReference,
    pub to_ref: ImageReference,
    /// Which manifest the blobs were planned for, used in error messages
    pub location: String,
    pub destination_type: DestinationType,
    pub blobs: BTreeSet<Digest>,
}

/// Manifest pushes into one destination repository
#[derive(Clone)]
pub struct ManifestPlan {
    pub to_ref: ImageReference,
    pub to: Arc<dyn ManifestService>,
    pub to_blobs: Arc<dyn BlobStore>,
    pub destination_type: DestinationType,
    /// Manifests pushed once per tag
    pub digests_to_tags: BTreeMap<Digest, BTreeSet<String>>,
    /// Manifests pushed by digest, in the order they must land
    pub digest_copies: Vec<Digest>,
}

impl ManifestPlan {
    pub fn is_empty(&self) -> bool {
        self.digests_to_tags.is_empty() && self.digest_copies.is_empty()
    }

    /// Every manifest digest this plan pushes
    pub fn digests(&self) -> BTreeSet<Digest> {
        self.digests_to_tags
            .keys()
            .chain(self.digest_copies.iter())
            .cloned()
            .collect()
    }
}

/// Destination side of a manifest push
pub struct ManifestTarget {
    pub to_ref: ImageReference,
    pub to: Arc<dyn ManifestService>,
    pub to_blobs: Arc<dyn BlobStore>,
    pub destination_type: DestinationType,
}

#[derive(Default)]
struct RepositoryState {
    blob_copies: Vec<BlobCopy>,
    manifests: BTreeMap<DestinationType, ManifestPlan>,
    /// Blobs found or placed in the repository while copying
    expected_blobs: BTreeSet<Digest>,
}

pub struct RepositoryPlan {
    pub name: String,
    state: Mutex<RepositoryState>,
}

impl RepositoryPlan {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::default(),
        }
    }

    /// Add `blobs` to the copy unit for (`from_ref`, `destination_type`, `location`), creating
    /// it when needed. Descriptors are recorded on `plan`.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_blobs(
        &self,
        plan: &Plan,
        from_ref: &ImageReference,
        to_ref: &ImageReference,
        destination_type: DestinationType,
        location: &str,
        from: &Arc<dyn BlobStore>,
        to: &Arc<dyn BlobStore>,
        blobs: &[Descriptor],
    ) {
        for blob in blobs {
            plan.save_blob(blob);
        }
        let mut state = lock(&self.state);
        let existing = state.blob_copies.iter().position(|c| {
            &c.from_ref == from_ref
                && c.destination_type == destination_type
                && c.location == location
        });
        let index = match existing {
            Some(index) => index,
            None => {
                state.blob_copies.push(BlobCopy {
                    from: from.clone(),
                    to: to.clone(),
                    from_ref: from_ref.clone(),
                    to_ref: to_ref.clone(),
                    location: location.to_string(),
                    destination_type,
                    blobs: BTreeSet::new(),
                });
                state.blob_copies.len() - 1
            }
        };
        state.blob_copies[index]
            .blobs
            .extend(blobs.iter().map(|b| b.digest.clone()));
    }

    /// Push `manifest` to the destination, once per tag or by digest when `tags` is empty
    pub fn copy_manifest(
        &self,
        plan: &Plan,
        target: &ManifestTarget,
        digest: &Digest,
        manifest: &Manifest,
        tags: &BTreeSet<String>,
    ) {
        plan.save_manifest(digest, manifest);
        let mut state = lock(&self.state);
        let manifests = state
            .manifests
            .entry(target.destination_type)
            .or_insert_with(|| ManifestPlan {
                to_ref: target.to_ref.clone(),
                to: target.to.clone(),
                to_blobs: target.to_blobs.clone(),
                destination_type: target.destination_type,
                digests_to_tags: BTreeMap::new(),
                digest_copies: Vec::new(),
            });
        if tags.is_empty() {
            if !manifests.digest_copies.contains(digest) {
                manifests.digest_copies.push(digest.clone());
            }
            return;
        }
        manifests
            .digests_to_tags
            .entry(digest.clone())
            .or_default()
            .extend(tags.iter().cloned());
    }

    pub fn expect_blob(&self, digest: &Digest) {
        lock(&self.state).expected_blobs.insert(digest.clone());
    }

    /// Whether `digest` is already known to be in the repository
    pub fn is_expected(&self, digest: &Digest) -> bool {
        lock(&self.state).expected_blobs.contains(digest)
    }

    pub fn blob_copies(&self) -> Vec<BlobCopy> {
        lock(&self.state).blob_copies.clone()
    }

    pub fn manifest_plans(&self) -> Vec<ManifestPlan> {
        lock(&self.state).manifests.values().cloned().collect()
    }

    /// Digests of every blob this repository receives
    pub fn blob_digests(&self) -> BTreeSet<Digest> {
        lock(&self.state)
            .blob_copies
            .iter()
            .flat_map(|c| c.blobs.iter().cloned())
            .collect()
    }

    fn trim(&self) -> bool {
        let mut state = lock(&self.state);
        state.blob_copies.retain(|c| !c.blobs.is_empty());
        state.manifests.retain(|_, m| !m.is_empty());
        state.blob_copies.is_empty() && state.manifests.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Blobs copied into more than one repository of the registry
    pub shared_count: usize,
    pub shared_size: u64,
    pub unique_count: usize,
    pub unique_size: u64,
}

pub struct RegistryPlan {
    pub name: String,
    repositories: Mutex<BTreeMap<String, Arc<RepositoryPlan>>>,
    /// Repositories known to hold each blob
    associated_blobs: Mutex<BTreeMap<Digest, BTreeSet<String>>>,
    stats: Mutex<RegistryStats>,
}

impl RegistryPlan {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            repositories: Mutex::default(),
            associated_blobs: Mutex::default(),
            stats: Mutex::default(),
        }
    }

    pub fn repository(&self, name: &str) -> Arc<RepositoryPlan> {
        lock(&self.repositories)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RepositoryPlan::new(name)))
            .clone()
    }

    pub fn repositories(&self) -> Vec<Arc<RepositoryPlan>> {
        lock(&self.repositories).values().cloned().collect()
    }

    pub fn associate_blob(&self, digest: &Digest, repository: &str) {
        lock(&self.associated_blobs)
            .entry(digest.clone())
            .or_default()
            .insert(repository.to_string());
    }

    /// A repository other than `repository` known to hold `digest`
    pub fn mount_from(&self, digest: &Digest, repository: &str) -> Option<String> {
        lock(&self.associated_blobs)
            .get(digest)?
            .iter()
            .find(|r| r.as_str() != repository)
            .cloned()
    }

    pub fn stats(&self) -> RegistryStats {
        *lock(&self.stats)
    }

    fn trim(&self) -> bool {
        let mut repositories = lock(&self.repositories);
        repositories.retain(|_, repo| !repo.trim());
        repositories.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanStats {
    /// Bytes of every planned blob copy
    pub bytes: u64,
    pub blobs: usize,
    pub manifests: usize,
}

#[derive(Default)]
pub struct Plan {
    registries: Mutex<BTreeMap<String, Arc<RegistryPlan>>>,
    errors: Mutex<Vec<MirrorError>>,
    blobs: Mutex<HashMap<Digest, Descriptor>>,
    manifests: Mutex<HashMap<Digest, Manifest>>,
    stats: Mutex<PlanStats>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self, name: &str) -> Arc<RegistryPlan> {
        lock(&self.registries)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RegistryPlan::new(name)))
            .clone()
    }

    pub fn registries(&self) -> Vec<Arc<RegistryPlan>> {
        lock(&self.registries).values().cloned().collect()
    }

    pub fn registry_names(&self) -> Vec<String> {
        lock(&self.registries).keys().cloned().collect()
    }

    pub fn add_error(&self, error: MirrorError) {
        tracing::debug!(error = %error, "planning error");
        lock(&self.errors).push(error);
    }

    pub fn has_errors(&self) -> bool {
        !lock(&self.errors).is_empty()
    }

    pub fn take_errors(&self) -> Vec<MirrorError> {
        std::mem::take(&mut *lock(&self.errors))
    }

    fn save_blob(&self, descriptor: &Descriptor) {
        lock(&self.blobs)
            .entry(descriptor.digest.clone())
            .or_insert_with(|| descriptor.clone());
    }

    fn save_manifest(&self, digest: &Digest, manifest: &Manifest) {
        lock(&self.manifests)
            .entry(digest.clone())
            .or_insert_with(|| manifest.clone());
    }

    pub fn blob(&self, digest: &Digest) -> Option<Descriptor> {
        lock(&self.blobs).get(digest).cloned()
    }

    pub fn manifest(&self, digest: &Digest) -> Option<Manifest> {
        lock(&self.manifests).get(digest).cloned()
    }

    fn blob_size(&self, digest: &Digest) -> u64 {
        lock(&self.blobs).get(digest).map(|d| d.size).unwrap_or(0)
    }

    pub fn stats(&self) -> PlanStats {
        *lock(&self.stats)
    }

    /// Drop blob copies without blobs, then repositories and registries left without work
    pub fn trim(&self) {
        lock(&self.registries).retain(|_, registry| !registry.trim());
    }

    pub fn calculate_stats(&self) {
        let mut totals = PlanStats::default();
        let mut unique_manifests = BTreeSet::new();
        for registry in self.registries() {
            let mut owners: BTreeMap<Digest, usize> = BTreeMap::new();
            for repo in registry.repositories() {
                for digest in repo.blob_digests() {
                    *owners.entry(digest).or_default() += 1;
                }
                for manifests in repo.manifest_plans() {
                    unique_manifests.extend(manifests.digests());
                }
            }

            let mut stats = RegistryStats::default();
            for (digest, count) in &owners {
                let size = self.blob_size(digest);
                totals.bytes += size * *count as u64;
                if *count > 1 {
                    stats.shared_count += 1;
                    stats.shared_size += size;
                } else {
                    stats.unique_count += 1;
                    stats.unique_size += size;
                }
            }
            totals.blobs += owners.len();
            *lock(&registry.stats) = stats;
        }
        totals.manifests = unique_manifests.len();
        *lock(&self.stats) = totals;
    }

    /// Render the plan on the logger's error stream
    pub fn print(&self, logger: &Logger) {
        for registry in self.registries() {
            logger.line(&format!("{}/", registry.name));
            for repo in registry.repositories() {
                logger.line(&format!("  {}", repo.name));
                for copy in repo.blob_copies() {
                    logger.line("    blobs:");
                    for digest in &copy.blobs {
                        match self.blob_size(digest) {
                            0 => logger.line(&format!("      {} {}", copy.from_ref, digest)),
                            size => logger.line(&format!(
                                "      {} {} {}",
                                copy.from_ref,
                                digest,
                                format_size(size)
                            )),
                        }
                    }
                }
                logger.line("    manifests:");
                for manifests in repo.manifest_plans() {
                    for digest in &manifests.digest_copies {
                        logger.line(&format!("      {}", digest));
                    }
                    for (digest, tags) in &manifests.digests_to_tags {
                        for tag in tags {
                            logger.line(&format!("      {} -> {}", digest, tag));
                        }
                    }
                }
            }
            let stats = registry.stats();
            let total = stats.shared_size + stats.unique_size;
            if total > 0 {
                logger.line(&format!(
                    "  stats: shared={} unique={} size={} ratio={:.2}",
                    stats.shared_count,
                    stats.unique_count,
                    format_size(total),
                    stats.unique_size as f64 / total as f64
                ));
            } else {
                logger.line(&format!(
                    "  stats: shared={} unique={} size={}",
                    stats.shared_count,
                    stats.unique_count,
                    format_size(total)
                ));
            }
        }
    }
}
