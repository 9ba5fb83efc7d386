//! Phase scheduling
//!
//! Each destination repository becomes one [`WorkUnit`]. A blob needed by several repositories
//! of the same registry is uploaded by the first of them; the others run in a later phase so
//! they can mount it instead of uploading it again. Units within a phase are independent.
//! Manifest lists and their children always share a unit, where children are pushed first.

use super::plan::{BlobCopy, ManifestPlan, Plan, PlanStats, RegistryPlan, RepositoryPlan, lock};
use crate::digest::Digest;
use crate::logging::Logger;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct WorkUnit {
    pub registry: Arc<RegistryPlan>,
    pub repository: Arc<RepositoryPlan>,
    pub blob_copies: Vec<Arc<BlobCopy>>,
    pub manifests: Vec<ManifestPlan>,
    /// Blobs expected to arrive by mount from an earlier phase
    pub mounts: usize,
    /// Blobs other units also copy
    pub shared: usize,
}

impl WorkUnit {
    pub fn blob_count(&self) -> usize {
        self.blob_copies.iter().map(|c| c.blobs.len()).sum()
    }

    pub fn manifest_count(&self) -> usize {
        self.manifests
            .iter()
            .map(|m| m.digest_copies.len() + m.digests_to_tags.values().map(|t| t.len()).sum::<usize>())
            .sum()
    }
}

#[derive(Default)]
pub struct Phase {
    pub units: Vec<Arc<WorkUnit>>,
    failed: AtomicBool,
    errors: Mutex<Vec<String>>,
}

impl Phase {
    pub fn failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Record an error and mark the phase failed
    pub fn fail(&self, error: impl ToString) {
        lock(&self.errors).push(error.to_string());
        self.failed();
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }
}

pub struct WorkPlan {
    pub phases: Vec<Arc<Phase>>,
    pub stats: PlanStats,
    copied: AtomicU64,
}

impl WorkPlan {
    pub fn bytes_copied(&self, n: u64) {
        self.copied.fetch_add(n, Ordering::Relaxed);
    }

    pub fn copied(&self) -> u64 {
        self.copied.load(Ordering::Relaxed)
    }

    pub fn print(&self, logger: &Logger) {
        for (i, phase) in self.phases.iter().enumerate() {
            logger.line(&format!("phase {}:", i));
            for unit in &phase.units {
                logger.line(&format!(
                    "  {} {} blobs={} mounts={} manifests={} shared={}",
                    unit.registry.name,
                    unit.repository.name,
                    unit.blob_count(),
                    unit.mounts,
                    unit.manifest_count(),
                    unit.shared
                ));
            }
        }
    }
}

pub fn greedy(plan: &Plan) -> WorkPlan {
    let mut units = Vec::new();
    for registry in plan.registries() {
        for repository in registry.repositories() {
            let digests = repository.blob_digests();
            units.push((registry.clone(), repository, digests));
        }
    }

    let mut owners: HashMap<(&str, &Digest), usize> = HashMap::new();
    let mut users: HashMap<(&str, &Digest), usize> = HashMap::new();
    for (i, (registry, _, digests)) in units.iter().enumerate() {
        for digest in digests {
            owners.entry((registry.name.as_str(), digest)).or_insert(i);
            *users.entry((registry.name.as_str(), digest)).or_default() += 1;
        }
    }

    let mut phase_of = Vec::with_capacity(units.len());
    let mut scheduled: Vec<(usize, WorkUnit)> = Vec::with_capacity(units.len());
    for (i, (registry, repository, digests)) in units.iter().enumerate() {
        let mut phase = 0;
        let mut mounts = 0;
        let mut shared = 0;
        for digest in digests {
            let key = (registry.name.as_str(), digest);
            if users[&key] > 1 {
                shared += 1;
            }
            let owner = owners[&key];
            if owner != i {
                mounts += 1;
                phase = phase.max(phase_of[owner] + 1);
            }
        }
        phase_of.push(phase);
        scheduled.push((
            phase,
            WorkUnit {
                registry: registry.clone(),
                repository: repository.clone(),
                blob_copies: repository.blob_copies().into_iter().map(Arc::new).collect(),
                manifests: repository.manifest_plans(),
                mounts,
                shared,
            },
        ));
    }

    let count = phase_of.iter().max().map(|p| p + 1).unwrap_or(0);
    let mut phases: Vec<Phase> = (0..count).map(|_| Phase::default()).collect();
    for (phase, unit) in scheduled {
        phases[phase].units.push(Arc::new(unit));
    }

    WorkPlan {
        phases: phases.into_iter().map(Arc::new).collect(),
        stats: plan.stats(),
        copied: AtomicU64::new(0),
    }
}
