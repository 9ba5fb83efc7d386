//! Plan construction
//!
//! Sources are planned in parallel, at most `max_registry` at a time. For each source the tags
//! are resolved in parallel on the source registry's queue, then every resolved digest is
//! planned in parallel: the manifest is fetched, manifest lists are filtered and their children
//! loaded, and each push target gets its blob copies and manifest pushes. Failures are
//! recorded on the plan and never stop the remaining sources or targets from being planned.

use super::mappings::DestinationType;
use super::plan::{ManifestTarget, Plan, lock};
use super::scopes::calculate_scopes;
use super::tree::{PushTargets, SourceNode, TargetTree};
use super::workqueue::WorkQueue;
use super::connect_destination;
use crate::config::MirrorOptions;
use crate::digest::Digest;
use crate::error::MirrorError;
use crate::logging::Logger;
use crate::manifest::{
    Descriptor, MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_SCHEMA2, Manifest, ManifestKind, SCHEMA2_MANIFEST_ONLY, filter_manifest_list,
};
use crate::reference::ImageReference;
use crate::registry::{ManifestService, Repository, RepositoryConnector};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

const DESTINATION_ACTIONS: &[&str] = &["pull", "push"];

/// Media types accepted for manifest list children
const CHILD_MANIFEST_TYPES: &[&str] = &[
    MEDIA_TYPE_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_SCHEMA2,
    MEDIA_TYPE_OCI_MANIFEST,
];

/// A source manifest ready to be pushed, with the children it needs pushed first
struct Expanded {
    digest: Digest,
    manifest: Manifest,
    children: Vec<(Digest, Manifest)>,
}

impl Expanded {
    /// Image manifests whose blobs must be present at the destination
    fn images(&self) -> impl Iterator<Item = &Manifest> {
        self.children
            .iter()
            .map(|(_, m)| m)
            .chain(std::iter::once(&self.manifest))
    }
}

pub(crate) struct Planner {
    options: MirrorOptions,
    logger: Logger,
    plan: Arc<Plan>,
    from: Arc<dyn RepositoryConnector>,
    to: BTreeMap<String, Arc<dyn RepositoryConnector>>,
    to_default: Arc<dyn RepositoryConnector>,
}

impl Planner {
    pub(crate) fn new(
        options: &MirrorOptions,
        logger: &Logger,
        connector: &Arc<dyn RepositoryConnector>,
        tree: &TargetTree,
    ) -> Self {
        let to_default = connector.scoped(DESTINATION_ACTIONS, &[]);
        let mut to = BTreeMap::new();
        for (registry, scopes) in calculate_scopes(tree) {
            tracing::debug!(
                registry = %registry,
                scopes = %scopes.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(" "),
                "using scopes for registry"
            );
            let scoped = if options.skip_multiple_scopes {
                to_default.clone()
            } else {
                connector.scoped(DESTINATION_ACTIONS, &scopes)
            };
            to.insert(registry, scoped);
        }
        Self {
            options: options.clone(),
            logger: logger.clone(),
            plan: Arc::new(Plan::new()),
            from: connector.clone(),
            to,
            to_default,
        }
    }

    fn destination_connector(&self, registry: &str) -> &Arc<dyn RepositoryConnector> {
        self.to.get(registry).unwrap_or(&self.to_default)
    }

    /// Plan every source in `tree`
    pub(crate) async fn build(self, tree: TargetTree) -> Arc<Plan> {
        let planner = Arc::new(self);
        let mut registry_workers: BTreeMap<String, WorkQueue> = BTreeMap::new();
        for key in tree.keys() {
            registry_workers
                .entry(key.registry.clone())
                .or_insert_with(|| WorkQueue::new(planner.options.max_per_registry));
        }

        let q = WorkQueue::new(planner.options.max_registry);
        q.batch(|w| {
            for (key, node) in tree {
                let Some(rq) = registry_workers.get(&key.registry).cloned() else {
                    continue;
                };
                let planner = planner.clone();
                w.parallel(async move {
                    planner.plan_source(&rq, node).await;
                });
            }
        })
        .await;
        q.done().await;
        for rq in registry_workers.values() {
            rq.done().await;
        }

        let plan = planner.plan.clone();
        plan.trim();
        plan.calculate_stats();
        plan
    }

    async fn plan_source(self: Arc<Self>, rq: &WorkQueue, mut node: SourceNode) {
        let src = node.reference.clone();
        let src_repo = match self.from.repository(&src, self.options.insecure).await {
            Ok(repo) => repo,
            Err(e) => {
                self.plan.add_error(MirrorError::retriever(
                    &src,
                    format!("unable to connect to {}: {}", src, e),
                ));
                return;
            }
        };

        let resolved: Arc<Mutex<Vec<(Digest, PushTargets)>>> = Arc::default();
        rq.batch(|w| {
            for (tag, targets) in &node.tags {
                let tags = src_repo.tags();
                let (tag, targets) = (tag.clone(), targets.clone());
                let (src, plan, resolved) = (src.clone(), self.plan.clone(), resolved.clone());
                w.parallel(async move {
                    match tags.get(&tag).await {
                        Ok(desc) => {
                            tracing::info!(
                                "resolved source image {}:{} to {}",
                                src,
                                tag,
                                desc.digest
                            );
                            lock(&resolved).push((desc.digest, targets));
                        }
                        Err(e) => plan.add_error(MirrorError::retriever(
                            &src,
                            format!(
                                "unable to retrieve source image {} by tag {}: {}",
                                src, tag, e
                            ),
                        )),
                    }
                });
            }
        })
        .await;
        for (digest, targets) in std::mem::take(&mut *lock(&resolved)) {
            node.merge_into_digests(digest, targets);
        }

        rq.queue(|w| {
            for (digest, targets) in node.digests {
                let planner = self.clone();
                let (src_repo, src) = (src_repo.clone(), src.clone());
                w.parallel(async move {
                    planner.plan_digest(src_repo, src, digest, targets).await;
                });
            }
        });
    }

    async fn plan_digest(
        &self,
        src_repo: Arc<dyn Repository>,
        src: ImageReference,
        digest: Digest,
        targets: PushTargets,
    ) {
        let manifests = src_repo.manifests();
        let manifest = match manifests.get(&digest, SCHEMA2_MANIFEST_ONLY).await {
            Ok(manifest) => manifest,
            Err(e) => {
                self.plan.add_error(MirrorError::retriever(
                    &src,
                    format!("unable to retrieve source image {} manifest {}: {}", src, digest, e),
                ));
                return;
            }
        };

        let expanded = match self.expand(&manifests, &src, &digest, manifest).await {
            Ok(Some(expanded)) => expanded,
            Ok(None) => {
                self.logger.info(&format!("Filtered all images from {}, skipping", src));
                return;
            }
            Err(e) => {
                self.plan.add_error(e);
                return;
            }
        };

        let location = if expanded.digest == digest {
            format!("manifest {}", expanded.digest)
        } else {
            format!("manifest {} in manifest list {}", expanded.digest, digest)
        };

        let canonical_from = src_repo.named().clone();
        for target in targets.into_values() {
            self.plan_target(
                &src_repo,
                &src,
                &canonical_from,
                &expanded,
                &location,
                target.reference,
                target.destination_type,
                &target.tags,
            )
            .await;
        }
    }

    /// Filter a manifest list and load the children that remain. Returns `None` when the
    /// filter removes every entry.
    async fn expand(
        &self,
        manifests: &Arc<dyn ManifestService>,
        src: &ImageReference,
        digest: &Digest,
        manifest: Manifest,
    ) -> Result<Option<Expanded>, MirrorError> {
        if !manifest.is_list() {
            return Ok(Some(Expanded {
                digest: digest.clone(),
                manifest,
                children: Vec::new(),
            }));
        }

        let filtered = filter_manifest_list(digest, &manifest, |p| self.options.include_platform(p))
            .map_err(|e| {
                MirrorError::retriever(
                    src,
                    format!("unable to filter source image {} manifest list: {}", src, e),
                )
            })?;
        let Some(filtered) = filtered else {
            return Ok(None);
        };
        if &filtered.digest != digest {
            tracing::debug!("filtered manifest list {} to new digest {}", digest, filtered.digest);
        }

        let mut children = Vec::with_capacity(filtered.children.len());
        for (i, child) in filtered.children.iter().enumerate() {
            let loaded = manifests.get(&child.digest, CHILD_MANIFEST_TYPES).await.map_err(|e| {
                MirrorError::retriever(
                    src,
                    format!(
                        "unable to retrieve source image {} manifest #{} from manifest list: {}",
                        src,
                        i + 1,
                        e
                    ),
                )
            })?;
            children.push((child.digest.clone(), loaded));
        }

        Ok(Some(Expanded {
            digest: filtered.digest,
            manifest: filtered.manifest,
            children,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn plan_target(
        &self,
        src_repo: &Arc<dyn Repository>,
        src: &ImageReference,
        canonical_from: &ImageReference,
        expanded: &Expanded,
        location: &str,
        dst: ImageReference,
        destination_type: DestinationType,
        tags: &BTreeSet<String>,
    ) {
        let connector = self.destination_connector(&dst.registry);
        let connected = connect_destination(connector, destination_type, &dst, &self.options).await;
        let to_repo = match connected {
            Ok(repo) => repo,
            Err(e) => {
                self.plan.add_error(MirrorError::retriever_to(
                    src,
                    &dst,
                    format!("unable to connect to {}: {}", dst, e),
                ));
                return;
            }
        };

        let canonical_to = to_repo.named().clone();
        let registry_plan = self.plan.registry(&dst.registry);
        let repo_plan = registry_plan.repository(&canonical_to.repository);
        let to_manifests = to_repo.manifests();

        let must_copy_layers = if self.options.force {
            true
        } else if src.registry == dst.registry && canonical_from == &canonical_to {
            false
        } else {
            match to_manifests.exists(&expanded.digest).await {
                Ok(true) => {
                    tracing::debug!(
                        "manifest exists in {}, no need to copy layers without --force",
                        dst
                    );
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    tracing::debug!(
                        "unable to check for manifest {} in {}: {}",
                        expanded.digest,
                        dst,
                        e
                    );
                    true
                }
            }
        };

        let to_blobs = to_repo.blobs();
        if must_copy_layers {
            let mut blobs: Vec<Descriptor> = Vec::new();
            for manifest in expanded.images() {
                match manifest.kind() {
                    ManifestKind::Image(_) => blobs.extend(manifest.references()),
                    ManifestKind::List(_) => continue,
                    ManifestKind::Schema1 { .. } => {
                        self.plan.add_error(MirrorError::retriever_to(
                            src,
                            &dst,
                            format!("the manifest type {} is not supported", manifest.media_type()),
                        ));
                    }
                }
            }
            repo_plan.copy_blobs(
                &self.plan,
                src,
                &dst,
                destination_type,
                location,
                &src_repo.blobs(),
                &to_blobs,
                &blobs,
            );
            if src.registry == dst.registry {
                for blob in &blobs {
                    registry_plan.associate_blob(&blob.digest, &src.repository);
                }
            }
        }

        let target = ManifestTarget {
            to_ref: dst,
            to: to_manifests,
            to_blobs,
            destination_type,
        };
        if must_copy_layers {
            for (digest, child) in &expanded.children {
                repo_plan.copy_manifest(&self.plan, &target, digest, child, &BTreeSet::new());
            }
        }
        repo_plan.copy_manifest(&self.plan, &target, &expanded.digest, &expanded.manifest, tags);
    }
}
