//! Reconciliation driver: walks the relationship window and republishes
//! every record the graph store is out of sync with.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use relsync_core::{InconsistencyReason, ReconcilePolicy, RelationshipRecord};
use relsync_graph::{EdgeVerdict, EdgeVerifier, GraphStore, MembershipVerifier, Neo4jRestClient};
use relsync_storage::{
    PgRelationshipStore, RecordSource, RelationshipStore, SourceOutcome, SourceStats, Window,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod publisher;

pub use config::{ReconcileConfig, DEFAULT_EXCHANGE};
pub use publisher::{
    AmqpTransport, ExchangeTransport, LogOnlyTransport, PublishError, PublishOutcome,
    RepairPublisher,
};

pub const CRATE_NAME: &str = "relsync-sync";

/// Knobs for a single pass over the window.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub window: Window,
    pub max_iterations: u32,
    /// Awaited before every record to bound the request rate on the graph store.
    pub record_delay: Duration,
    pub exchange: String,
}

impl RunSettings {
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            window: config.window(),
            max_iterations: config.max_iterations,
            record_delay: config.record_delay,
            exchange: config.exchange.clone(),
        }
    }
}

/// Everything a run touches, handed down by reference.
pub struct ReconcileContext<'a> {
    pub store: &'a dyn RelationshipStore,
    pub graph: &'a dyn GraphStore,
    pub transport: &'a dyn ExchangeTransport,
    pub policy: &'a ReconcilePolicy,
    pub settings: RunSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordVerdict {
    Excluded,
    Consistent(EdgeVerdict),
    Inconsistent(InconsistencyReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: Window,
    pub total: u64,
    pub final_index: u64,
    /// Records consumed from the window, `final_index - skip`.
    pub processed: u64,
    pub visited: u64,
    pub excluded: u64,
    pub consistent: u64,
    pub missing_source: u64,
    pub missing_target: u64,
    pub missing_relationship: u64,
    pub duplicates_found: u64,
    pub edges_deleted: u64,
    pub events_published: u64,
    pub events_dropped: u64,
    pub source: SourceStats,
    pub outcome: SourceOutcome,
}

impl ReconcileSummary {
    pub fn inconsistent(&self) -> u64 {
        self.missing_source + self.missing_target + self.missing_relationship
    }
}

#[derive(Debug, Default)]
struct Tally {
    visited: u64,
    excluded: u64,
    consistent: u64,
    missing_source: u64,
    missing_target: u64,
    missing_relationship: u64,
    duplicates_found: u64,
    edges_deleted: u64,
    events_published: u64,
    events_dropped: u64,
}

impl Tally {
    fn record(&mut self, verdict: RecordVerdict) {
        self.visited += 1;
        match verdict {
            RecordVerdict::Excluded => self.excluded += 1,
            RecordVerdict::Consistent(edge) => {
                self.consistent += 1;
                if let EdgeVerdict::Duplicated { deleted, .. } = edge {
                    self.duplicates_found += 1;
                    self.edges_deleted += deleted as u64;
                }
            }
            RecordVerdict::Inconsistent(InconsistencyReason::MissingSource) => {
                self.missing_source += 1
            }
            RecordVerdict::Inconsistent(InconsistencyReason::MissingTarget) => {
                self.missing_target += 1
            }
            RecordVerdict::Inconsistent(InconsistencyReason::MissingRelationship) => {
                self.missing_relationship += 1
            }
        }
    }
}

pub struct Reconciler<'a> {
    ctx: ReconcileContext<'a>,
    membership: MembershipVerifier<'a>,
    edges: EdgeVerifier<'a>,
    publisher: RepairPublisher<'a>,
}

impl<'a> Reconciler<'a> {
    pub fn new(ctx: ReconcileContext<'a>) -> Self {
        let membership = MembershipVerifier::new(ctx.graph);
        let edges = EdgeVerifier::new(ctx.graph, ctx.policy);
        let publisher = RepairPublisher::new(ctx.transport, ctx.settings.exchange.clone());
        Self {
            ctx,
            membership,
            edges,
            publisher,
        }
    }

    /// Judge a single record against the graph store. May prune duplicate edges.
    pub async fn check(&self, record: &RelationshipRecord) -> RecordVerdict {
        if self.ctx.policy.is_excluded(record) {
            return RecordVerdict::Excluded;
        }

        let Some(source) = self.membership.resolve(&record.source_id).await else {
            return RecordVerdict::Inconsistent(InconsistencyReason::MissingSource);
        };
        let Some(target) = self.membership.resolve(&record.target_id).await else {
            return RecordVerdict::Inconsistent(InconsistencyReason::MissingTarget);
        };

        // Groups fan out to many members; list the edges from the other side.
        let flipped = record.is_flipped();
        let (from_id, to_id) = if flipped {
            (&target.internal_id, &source.internal_id)
        } else {
            (&source.internal_id, &target.internal_id)
        };

        match self
            .edges
            .verify(from_id, to_id, &record.rel_type, flipped)
            .await
        {
            EdgeVerdict::Missing => {
                RecordVerdict::Inconsistent(InconsistencyReason::MissingRelationship)
            }
            verdict => RecordVerdict::Consistent(verdict),
        }
    }

    pub async fn run(&self) -> Result<ReconcileSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("reconcile", %run_id))
            .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<ReconcileSummary> {
        let started_at = Utc::now();
        let settings = &self.ctx.settings;
        let mut source = RecordSource::open(self.ctx.store, settings.window, settings.max_iterations)
            .await
            .context("counting relationships in the primary store")?;

        let mut tally = Tally::default();
        while let Some(record) = source.next_record().await {
            if !settings.record_delay.is_zero() {
                tokio::time::sleep(settings.record_delay).await;
            }

            let verdict = self.check(&record).await;
            tally.record(verdict);

            if let RecordVerdict::Inconsistent(reason) = verdict {
                log_inconsistency(&record, reason);
                let outcome = self
                    .publisher
                    .publish_record(&record)
                    .await
                    .with_context(|| format!("publishing repair event for {}", record.id))?;
                match outcome {
                    PublishOutcome::Published => tally.events_published += 1,
                    PublishOutcome::Dropped => tally.events_dropped += 1,
                }
            }
        }

        let outcome = source.outcome().unwrap_or(SourceOutcome::WindowComplete);
        let summary = ReconcileSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window: settings.window,
            total: source.total(),
            final_index: source.index(),
            processed: source.processed(),
            visited: tally.visited,
            excluded: tally.excluded,
            consistent: tally.consistent,
            missing_source: tally.missing_source,
            missing_target: tally.missing_target,
            missing_relationship: tally.missing_relationship,
            duplicates_found: tally.duplicates_found,
            edges_deleted: tally.edges_deleted,
            events_published: tally.events_published,
            events_dropped: tally.events_dropped,
            source: source.stats(),
            outcome,
        };

        if outcome == SourceOutcome::MaxIterations {
            warn!(iterations = summary.source.iterations, "max iteration count reached, exiting");
        }
        info!(
            synced = summary.processed,
            inconsistent = summary.inconsistent(),
            published = summary.events_published,
            edges_deleted = summary.edges_deleted,
            outcome = ?outcome,
            "synced entries on this process"
        );
        Ok(summary)
    }
}

fn log_inconsistency(record: &RelationshipRecord, reason: InconsistencyReason) {
    warn!(
        id = %record.id,
        rel_type = %record.rel_type,
        source = %format!("{{{} {}}}", record.source_id, record.source_name),
        target = %format!("{{{} {}}}", record.target_id, record.target_name),
        err = %reason,
        "relationship out of sync"
    );
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
}

/// Connect to all three stores and reconcile the configured window once.
pub async fn run_reconcile_once(
    config: &ReconcileConfig,
    options: RunOptions,
) -> Result<ReconcileSummary> {
    config.validate()?;
    let policy = ReconcilePolicy::from_workspace_root(&config.workspace_root)?;
    let store = PgRelationshipStore::connect(&config.database_url, policy.excluded_kinds.clone())
        .await?;
    let graph = Neo4jRestClient::new(config.graph_client_config())?;
    let transport: Box<dyn ExchangeTransport> = if options.dry_run {
        Box::new(LogOnlyTransport)
    } else {
        Box::new(AmqpTransport::connect(&config.amqp_url).await?)
    };

    let reconciler = Reconciler::new(ReconcileContext {
        store: &store,
        graph: &graph,
        transport: transport.as_ref(),
        policy: &policy,
        settings: RunSettings::from_config(config),
    });
    reconciler.run().await
}

/// Filtered relationship total, for sizing windows.
pub async fn count_relationships(config: &ReconcileConfig) -> Result<u64> {
    let policy = ReconcilePolicy::from_workspace_root(&config.workspace_root)?;
    let store = PgRelationshipStore::connect(&config.database_url, policy.excluded_kinds).await?;
    let total = store
        .count()
        .await
        .context("counting relationships in the primary store")?;
    Ok(total)
}

pub async fn migrate(config: &ReconcileConfig) -> Result<()> {
    let store = PgRelationshipStore::connect(&config.database_url, Vec::new()).await?;
    store.migrate().await
}

/// Scheduler that re-runs the configured window on `config.cron`.
pub async fn build_scheduler(config: ReconcileConfig, options: RunOptions) -> Result<JobScheduler> {
    config.validate()?;
    let cron = config.cron.clone();
    let gate = Arc::new(Mutex::new(()));
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let config = config.clone();
        let gate = Arc::clone(&gate);
        Box::pin(async move {
            match run_if_idle(&gate, run_reconcile_once(&config, options)).await {
                Some(Ok(summary)) => info!(
                    run_id = %summary.run_id,
                    processed = summary.processed,
                    inconsistent = summary.inconsistent(),
                    "scheduled reconcile finished"
                ),
                Some(Err(err)) => error!(error = ?err, "scheduled reconcile failed"),
                None => {}
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Awaits `job` unless an earlier tick still holds `gate`; runs never overlap.
async fn run_if_idle<F: Future>(gate: &Mutex<()>, job: F) -> Option<F::Output> {
    let Ok(_running) = gate.try_lock() else {
        warn!("previous scheduled reconcile still running, skipping this tick");
        return None;
    };
    Some(job.await)
}

pub async fn maybe_build_scheduler(
    config: &ReconcileConfig,
    options: RunOptions,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(config.clone(), options).await.map(Some)
}
