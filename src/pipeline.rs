//! Batch orchestration.
//!
//! Drives every item through
//!
//! ```text
//! fetch → classify → route (per region) → generate (per routed target) → record
//! ```
//!
//! on a fixed-size rayon pool, checkpointing the [`StateStore`] as it goes.
//!
//! ## Item lifecycle
//!
//! ```text
//! queued ──► in-flight ──► success | failed
//!   │
//!   └─► skipped (already a success in the state file)
//! ```
//!
//! Ids that do not parse never reach the queue; they are recorded as failed
//! with the identity error so they show up in the failed list. Duplicate ids
//! are processed once.
//!
//! ## Concurrency
//!
//! Workers share nothing but the state store and the transform provider. A
//! provider that is not thread-safe is rejected for more than one worker
//! unless `serialize_transforms` is set. A provider that is not thread-safe,
//! or any provider under `serialize_transforms`, has every call go through
//! one lock ([`GuardedProvider`]), with one worker too.
//!
//! ## Cancellation
//!
//! Setting the cancel flag stops workers from starting new items. Items in
//! flight finish normally, then one final checkpoint runs. A checkpoint that
//! still fails after its retries aborts the run the same way and is returned
//! as the run's error.

use crate::artifacts::{ArtifactError, ArtifactGenerator, FileOutcome, MeshOrigin, TargetInput};
use crate::classify::ClassifierConfig;
use crate::collaborators::{Collaborators, FetchError, GuardedProvider, fetch_mesh, fetch_skeleton};
use crate::config::PipelineConfig;
use crate::geometry::{Mesh, SkeletonError};
use crate::identity::{IdentityError, ItemId, parse_item_id};
use crate::paths::PathResolver;
use crate::route::{RouteFailure, RouteKind, RoutedTarget, TemplateRegistry, TransformRouter, replay};
use crate::state::{ProcessingRecord, StateError, StateStore, TargetRecord};
use crate::types::Format;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("could not start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("state checkpoint failed: {0}")]
    State(#[from] StateError),
}

/// Reasons a single item fails. Rendered into the record's error message.
#[derive(Error, Debug)]
pub enum ItemError {
    #[error("fetch: {0}")]
    Fetch(#[from] FetchError),
    #[error("{}", describe_route_failures(.0))]
    NoTargets(Vec<RouteFailure>),
    #[error("transformed geometry rejected: {0}")]
    Geometry(#[from] SkeletonError),
    #[error("skeleton for {template}: {source}")]
    Skeleton {
        template: String,
        source: ArtifactError,
    },
}

fn describe_route_failures(failures: &[RouteFailure]) -> String {
    let parts: Vec<String> = failures.iter().map(|f| f.to_string()).collect();
    format!("all targets failed: {}", parts.join(" | "))
}

/// Work list for one run, built from raw ids against the state store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkPlan {
    /// Items to process, in input order.
    pub queue: Vec<ItemId>,
    /// Items already recorded as successful.
    pub resumed: Vec<ItemId>,
    /// Raw ids that failed to parse.
    pub invalid: Vec<(String, IdentityError)>,
    /// Repeated ids dropped from the input.
    pub duplicates: usize,
}

/// Per-target line of an [`ItemReport`].
#[derive(Debug, Clone, PartialEq)]
pub struct TargetReport {
    pub template_id: String,
    pub route: RouteKind,
    pub primary: bool,
    pub created: Vec<Format>,
    pub present: Vec<Format>,
    pub failed_formats: Vec<String>,
    pub mesh_origin: Option<MeshOrigin>,
}

/// What happened to one item in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub record: ProcessingRecord,
    pub targets: Vec<TargetReport>,
    /// Regions that could not be routed while others succeeded.
    pub unrouted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started {
        queued: usize,
        resumed: usize,
        invalid: usize,
        workers: usize,
    },
    ItemFinished {
        /// 1-based completion order.
        position: usize,
        total: usize,
        report: Box<ItemReport>,
    },
    Checkpointed {
        records: usize,
    },
}

/// Aggregate outcome of [`Pipeline::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
    /// `(id, reason)` for every failed item, invalid ids included.
    pub failed: Vec<(String, String)>,
    /// Queued items never started because the run was cancelled.
    pub not_started: usize,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Slot {
    Done(Box<ItemReport>),
    NotStarted,
}

pub struct Pipeline<'a> {
    collaborators: Collaborators,
    provider: GuardedProvider,
    classifier: ClassifierConfig,
    router: TransformRouter,
    generator: ArtifactGenerator,
    state: &'a StateStore,
    source_space: String,
    strip_prefixes: Vec<String>,
    workers: usize,
    checkpoint_every: usize,
    timeout: Option<Duration>,
}

impl<'a> Pipeline<'a> {
    /// Assemble a pipeline from validated config.
    ///
    /// Re-checks the thread-safety contract against the provider actually
    /// supplied, which may differ from what the config describes.
    pub fn new(
        config: &PipelineConfig,
        collaborators: Collaborators,
        paths: PathResolver,
        state: &'a StateStore,
    ) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        let workers = config.processing.max_workers;
        let serialize = config.processing.serialize_transforms;
        if workers > 1 && !serialize && !collaborators.transforms.is_thread_safe() {
            return Err(PipelineError::Config(format!(
                "{workers} workers requested but the transform provider is not thread-safe; \
                 use one worker or set processing.serialize_transforms"
            )));
        }

        let timeout = config.processing.timeout();
        let provider = GuardedProvider::new(collaborators.transforms.clone(), serialize, timeout);
        let router = TransformRouter::new(
            config.input.source_space.clone(),
            config.routing.clone(),
            TemplateRegistry::new(config.templates.clone()),
        );
        let generator = ArtifactGenerator::new(
            paths,
            config.output.formats.clone(),
            config.output.skip_existing,
            config.output.min_artifact_bytes,
        );

        Ok(Self {
            collaborators,
            provider,
            classifier: config.classifier.clone(),
            router,
            generator,
            state,
            source_space: config.input.source_space.clone(),
            strip_prefixes: config.input.strip_prefixes.clone(),
            workers,
            checkpoint_every: config.processing.checkpoint_every,
            timeout,
        })
    }

    /// Parse, deduplicate and filter raw ids. `limit` caps the queue after
    /// resumed items are removed, so repeated limited runs make progress.
    pub fn plan<S: AsRef<str>>(&self, raw_ids: &[S], limit: Option<usize>) -> WorkPlan {
        let mut plan = WorkPlan::default();
        let mut seen = HashSet::new();
        for raw in raw_ids {
            let raw = raw.as_ref();
            let id = match parse_item_id(raw, &self.strip_prefixes) {
                Ok(id) => id,
                Err(e) => {
                    plan.invalid.push((raw.to_string(), e));
                    continue;
                }
            };
            if !seen.insert(id.clone()) {
                plan.duplicates += 1;
                continue;
            }
            if self.state.is_done(id.as_str()) {
                plan.resumed.push(id);
            } else {
                plan.queue.push(id);
            }
        }
        if let Some(limit) = limit {
            plan.queue.truncate(limit);
        }
        plan
    }

    /// Execute a plan. Always ends with a checkpoint.
    pub fn run(
        &self,
        plan: &WorkPlan,
        cancel: &AtomicBool,
        events: Option<Sender<ProgressEvent>>,
    ) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary {
            skipped: plan.resumed.len(),
            ..Default::default()
        };
        for (raw, error) in &plan.invalid {
            let reason = format!("identity: {error}");
            tracing::warn!(id = %raw, %error, "invalid item id");
            self.state.record(raw, ProcessingRecord::failed(raw.as_str(), reason.clone()));
            summary.failed.push((raw.clone(), reason));
        }

        if let Some(tx) = &events {
            let _ = tx.send(ProgressEvent::Started {
                queued: plan.queue.len(),
                resumed: plan.resumed.len(),
                invalid: plan.invalid.len(),
                workers: self.workers,
            });
        }
        tracing::info!(
            queued = plan.queue.len(),
            resumed = plan.resumed.len(),
            invalid = plan.invalid.len(),
            duplicates = plan.duplicates,
            workers = self.workers,
            "starting run"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("treewarp-worker-{i}"))
            .build()?;

        let completed = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let checkpoint_error: Mutex<Option<StateError>> = Mutex::new(None);
        let total = plan.queue.len();

        let slots: Vec<Slot> = pool.install(|| {
            plan.queue
                .par_iter()
                .map_with(events.clone(), |tx, id| {
                    if cancel.load(Ordering::SeqCst) || abort.load(Ordering::SeqCst) {
                        return Slot::NotStarted;
                    }
                    let report = self.process_item(id);
                    self.state.record(id.as_str(), report.record.clone());

                    let position = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(tx) = tx {
                        let _ = tx.send(ProgressEvent::ItemFinished {
                            position,
                            total,
                            report: Box::new(report.clone()),
                        });
                    }
                    if position % self.checkpoint_every == 0 {
                        match self.state.checkpoint() {
                            Ok(()) => {
                                if let Some(tx) = tx {
                                    let _ = tx.send(ProgressEvent::Checkpointed { records: position });
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "checkpoint failed; stopping run");
                                abort.store(true, Ordering::SeqCst);
                                let mut slot = checkpoint_error.lock().unwrap_or_else(|p| p.into_inner());
                                slot.get_or_insert(e);
                            }
                        }
                    }
                    Slot::Done(Box::new(report))
                })
                .collect()
        });

        for slot in slots {
            match slot {
                Slot::Done(report) => {
                    let record = report.record;
                    match record.error {
                        Some(error) => summary.failed.push((record.item_id, error)),
                        None => summary.succeeded += 1,
                    }
                }
                Slot::NotStarted => summary.not_started += 1,
            }
        }
        summary.cancelled = cancel.load(Ordering::SeqCst);
        if summary.cancelled {
            tracing::warn!(not_started = summary.not_started, "run cancelled");
        }

        // Final checkpoint runs even after a periodic one failed.
        let final_checkpoint = self.state.checkpoint();
        let earlier = checkpoint_error
            .into_inner()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(e) = earlier {
            return Err(e.into());
        }
        final_checkpoint?;
        if let Some(tx) = &events {
            let _ = tx.send(ProgressEvent::Checkpointed {
                records: completed.load(Ordering::SeqCst),
            });
        }

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            skipped = summary.skipped,
            not_started = summary.not_started,
            "run finished"
        );
        Ok(summary)
    }

    /// Run one item to a terminal record. Never panics on bad input; every
    /// failure becomes a `failed` record.
    pub fn process_item(&self, id: &ItemId) -> ItemReport {
        let span = tracing::info_span!("item", id = %id);
        let _enter = span.enter();
        match self.try_process(id) {
            Ok(report) => {
                tracing::info!(
                    primary = report.record.primary_template.as_deref().unwrap_or(""),
                    targets = report.targets.len(),
                    "item done"
                );
                report
            }
            Err(e) => {
                tracing::warn!(error = %e, "item failed");
                ItemReport {
                    record: ProcessingRecord::failed(id.as_str(), e.to_string()),
                    targets: Vec::new(),
                    unrouted: Vec::new(),
                }
            }
        }
    }

    fn try_process(&self, id: &ItemId) -> Result<ItemReport, ItemError> {
        let skeleton = fetch_skeleton(&self.collaborators.geometry, id, self.timeout)?;
        let positions = skeleton.positions();

        let classification = self.classifier.classify(&positions);
        let regions = self.classifier.required_regions(classification);
        tracing::debug!(
            region = %classification.region,
            confidence = classification.confidence,
            targets = regions.len(),
            "classified"
        );

        let mut routed: Vec<RoutedTarget> = Vec::new();
        let mut failures = Vec::new();
        for (region, result) in self.router.route_all(&self.provider, &positions, &regions) {
            match result {
                Ok(target) => {
                    if routed.iter().any(|r| r.template.id == target.template.id) {
                        tracing::debug!(%region, template = %target.template.id, "template already routed");
                        continue;
                    }
                    routed.push(target);
                }
                Err(failure) => {
                    tracing::warn!(%region, error = %failure, "target failed");
                    failures.push(failure);
                }
            }
        }
        if routed.is_empty() {
            return Err(ItemError::NoTargets(failures));
        }

        let primary_idx = routed
            .iter()
            .position(|r| r.region == classification.region)
            .unwrap_or(0);

        let mut targets = Vec::with_capacity(routed.len());
        let mut reports = Vec::with_capacity(routed.len());
        for (idx, target) in routed.iter().enumerate() {
            let transformed = skeleton.with_positions(target.positions.clone())?;
            let input = TargetInput {
                item: id,
                source_space: &self.source_space,
                routed: target,
                skeleton: &transformed,
                is_primary: idx == primary_idx,
            };
            let artifacts = self
                .generator
                .generate(&input, || self.native_mesh(id, target))
                .map_err(|source| ItemError::Skeleton {
                    template: target.template.id.clone(),
                    source,
                })?;

            targets.push(TargetRecord {
                template_id: target.template.id.clone(),
                template_name: target.template.name.clone(),
                region: target.region,
                route: target.kind,
                alternate: target.alternate.clone(),
                files: artifacts
                    .files
                    .iter()
                    .map(|(f, p)| (*f, p.to_string_lossy().into_owned()))
                    .collect::<BTreeMap<_, _>>(),
            });
            reports.push(TargetReport {
                template_id: target.template.id.clone(),
                route: target.kind,
                primary: idx == primary_idx,
                created: artifacts.created().collect(),
                present: artifacts.present().collect(),
                failed_formats: artifacts.failed.iter().map(|e| e.to_string()).collect(),
                mesh_origin: artifacts
                    .outcomes
                    .get(&Format::Mesh)
                    .filter(|o| **o == FileOutcome::Created)
                    .and(artifacts.mesh_origin),
            });
        }

        let primary = routed[primary_idx].template.id.clone();
        Ok(ItemReport {
            record: ProcessingRecord::success(id.as_str(), primary, targets),
            targets: reports,
            unrouted: failures.iter().map(|f| f.to_string()).collect(),
        })
    }

    /// Native mesh moved through the same steps as the skeleton, or `None`
    /// if there is no mesh source, no mesh, or any step fails.
    fn native_mesh(&self, id: &ItemId, target: &RoutedTarget) -> Option<Mesh> {
        let source = self.collaborators.meshes.as_ref()?;
        let mesh = match fetch_mesh(source, id, self.timeout) {
            Ok(Some(mesh)) => mesh,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "native mesh unavailable; using tube mesh");
                return None;
            }
        };
        let moved = replay(&self.provider, &mesh.vertices, &target.applied)
            .map_err(|e| e.to_string())
            .and_then(|vertices| mesh.with_vertices(vertices).map_err(|e| e.to_string()));
        match moved {
            Ok(mesh) => Some(mesh),
            Err(e) => {
                tracing::warn!(template = %target.template.id, error = %e, "native mesh transform failed; using tube mesh");
                None
            }
        }
    }
}

/// Convenience for embedding: shared handle to the cancel flag.
pub fn cancel_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}
