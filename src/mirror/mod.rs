//! Image mirroring
//!
//! A [`Mirror`] run has two halves. Planning reads every source and destination and records
//! what must move in a [`plan::Plan`]; nothing is written. Execution turns the plan into
//! phases with [`greedy::greedy`] and copies blobs and manifests phase by phase, stopping after
//! the first phase that fails.

pub mod copy;
pub mod greedy;
pub mod mappings;
pub mod plan;
pub mod planner;
pub mod scopes;
pub mod tree;
pub mod workqueue;

pub use copy::Executor;
pub use greedy::{Phase, WorkPlan, WorkUnit, greedy};
pub use mappings::{DestinationType, Mapping};
pub use plan::Plan;
pub use workqueue::{Work, WorkQueue};

use crate::config::MirrorOptions;
use crate::error::{MirrorError, RegistryError, Result};
use crate::logging::Logger;
use crate::manifest::Descriptor;
use crate::reference::ImageReference;
use crate::registry::{Repository, RepositoryConnector};
use planner::Planner;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tree::build_target_tree;

/// Open a destination repository of the given type
pub(crate) async fn connect_destination(
    connector: &Arc<dyn RepositoryConnector>,
    destination_type: DestinationType,
    reference: &ImageReference,
    options: &MirrorOptions,
) -> std::result::Result<Arc<dyn Repository>, RegistryError> {
    match destination_type {
        DestinationType::Registry => connector.repository(reference, options.insecure).await,
        DestinationType::S3 => {
            tracing::debug!(
                buckets = ?options.s3_source_buckets,
                "S3 destination requested for {}",
                reference
            );
            Err(RegistryError::Unsupported(format!(
                "no S3 blob store driver is available to push to s3://{}",
                reference
            )))
        }
    }
}

pub struct Mirror {
    options: MirrorOptions,
    mappings: Vec<Mapping>,
    logger: Logger,
    connector: Arc<dyn RepositoryConnector>,
}

impl Mirror {
    pub fn new(
        options: MirrorOptions,
        mappings: Vec<Mapping>,
        logger: Logger,
        connector: Arc<dyn RepositoryConnector>,
    ) -> Result<Self> {
        options.validate()?;
        mappings::validate(&mappings)?;
        Ok(Self {
            options,
            mappings,
            logger,
            connector,
        })
    }

    /// Build the plan. Problems with individual sources or targets are recorded on the plan.
    pub async fn plan(&self) -> Arc<Plan> {
        let tree = build_target_tree(&self.mappings);
        Planner::new(&self.options, &self.logger, &self.connector, &tree)
            .build(tree)
            .await
    }

    pub async fn run(&self) -> Result<()> {
        let start = Instant::now();
        let plan = self.plan().await;
        plan.print(&self.logger);
        self.logger.line("");

        let errors = plan.take_errors();
        if !errors.is_empty() {
            for error in &errors {
                self.logger.error(&error.to_string());
            }
            self.planning_completed(start);
            return Err(MirrorError::Planning);
        }

        let work = Arc::new(greedy(&plan));
        work.print(&self.logger);
        self.logger.line("");
        self.planning_completed(start);

        if self.options.dry_run {
            self.logger.info("Dry run complete");
            return Ok(());
        }

        let executor = Arc::new(Executor::new(&self.options, &self.logger, plan.clone(), work.clone()));
        let next = Instant::now();
        let result = self.execute(&plan, &work, executor).await;
        let elapsed = next.elapsed();
        self.logger.info(&format!(
            "Mirroring completed in {} ({})",
            self.logger.format_duration(elapsed),
            self.logger.format_speed(work.copied(), elapsed)
        ));
        result
    }

    fn planning_completed(&self, start: Instant) {
        self.logger.info(&format!(
            "Planning completed in {}",
            self.logger.format_duration(start.elapsed())
        ));
    }

    async fn execute(&self, plan: &Plan, work: &WorkPlan, executor: Arc<Executor>) -> Result<()> {
        let q = WorkQueue::new(self.options.max_registry);
        let registry_workers: Arc<BTreeMap<String, WorkQueue>> = Arc::new(
            plan.registry_names()
                .into_iter()
                .map(|name| (name, WorkQueue::new(self.options.max_per_registry)))
                .collect(),
        );

        let mut result = Ok(());
        for (i, phase) in work.phases.iter().enumerate() {
            tracing::debug!(phase = i, units = phase.units.len(), "starting phase");
            q.batch(|w| {
                for unit in &phase.units {
                    let (executor, workers) = (executor.clone(), registry_workers.clone());
                    let (phase, unit) = (phase.clone(), unit.clone());
                    let max_per_registry = self.options.max_per_registry;
                    w.parallel(async move {
                        let rq = workers
                            .get(&unit.registry.name)
                            .cloned()
                            .unwrap_or_else(|| WorkQueue::new(max_per_registry));
                        copy_unit(executor, &rq, phase, unit).await;
                    });
                }
            })
            .await;
            if phase.is_failed() {
                result = Err(MirrorError::Mirroring);
                break;
            }
        }

        q.done().await;
        for rq in registry_workers.values() {
            rq.done().await;
        }
        result
    }
}

/// Copy the blobs of one unit in parallel, then push its manifests
async fn copy_unit(executor: Arc<Executor>, rq: &WorkQueue, phase: Arc<Phase>, unit: Arc<WorkUnit>) {
    rq.batch(|w| {
        for copy in &unit.blob_copies {
            for digest in &copy.blobs {
                let blob = executor
                    .plan()
                    .blob(digest)
                    .unwrap_or_else(|| Descriptor::new("", 0, digest.clone()));
                let (executor, phase, unit, copy) = (executor.clone(), phase.clone(), unit.clone(), copy.clone());
                w.parallel(async move {
                    match executor.copy_blob(&unit.registry, &unit.repository, &copy, &blob).await {
                        Ok(()) => unit.registry.associate_blob(&blob.digest, &unit.repository.name),
                        Err(e) => {
                            executor.logger().error(&e.to_string());
                            phase.fail(e);
                        }
                    }
                });
            }
        }
    })
    .await;
    if phase.is_failed() {
        return;
    }

    for manifests in &unit.manifests {
        for e in executor.copy_manifests(&unit.registry, &unit.repository, manifests).await {
            executor.logger().error(&e.to_string());
            phase.fail(e);
        }
    }
}
