// src/collect.rs
//! Run coordinator: one [`CollectionRun`] at a time fans out per-source fetch
//! tasks, survives partial failure, and drives the merged batch through
//! normalize -> classify -> dedupe into the persisted record set.
//!
//! Concurrency model: per-source tasks are the only suspension points
//! (network-bound, semaphore-capped, individually timed out, cancellable via a
//! watch channel); the processing stage runs synchronously after every task
//! settles. The coordinator is the single writer of the run record and the
//! progress state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::classify::{ClassificationResult, ClassifierEngine};
use crate::config::{AppConfig, SourceConfig};
use crate::dedupe::{self, RepeatCluster};
use crate::normalize::{self, NormalizedItem};
use crate::progress::{ProgressBroadcaster, SourceProgress, SourceStatus};
use crate::sources::{AdapterFactory, RawItem};
use crate::store::FeedbackStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    pub message: String,
}

/// One execution of the multi-source collection pipeline. Mutated only by the
/// coordinator; readers get clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRun {
    pub run_id: String,
    pub status: RunStatus,
    pub per_source: BTreeMap<String, SourceProgress>,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub errors: Vec<SourceFailure>,
    pub items_collected: usize,
    /// Repeating-request clusters reported by the deduplicator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repeats: Vec<RepeatCluster>,
}

/// Coordination-level failures, surfaced synchronously to the caller.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("a collection run is already active: {0}")]
    AlreadyActive(String),
    #[error("no enabled sources configured")]
    NoSourcesEnabled,
    #[error("unknown run id: {0}")]
    UnknownRun(String),
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub fetch_timeout: Duration,
    pub max_concurrent_fetches: usize,
    pub similarity_threshold: f32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_concurrent_fetches: 8,
            similarity_threshold: dedupe::DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl RunSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            fetch_timeout: Duration::from_secs(cfg.fetch_timeout_secs),
            max_concurrent_fetches: cfg.max_concurrent_fetches,
            similarity_threshold: cfg.similarity_threshold,
        }
    }
}

struct ActiveRun {
    run_id: String,
    cancel: watch::Sender<bool>,
}

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("collect_runs_total", "Collection runs started.");
        describe_counter!("collect_items_total", "Raw items fetched across all sources.");
        describe_counter!(
            "collect_source_errors_total",
            "Source fetch failures (including timeouts)."
        );
        describe_counter!("dedup_removed_total", "Items removed as exact duplicates.");
        describe_gauge!("collect_last_run_ts", "Unix ts when a run last finished.");
    });
}

pub struct RunCoordinator {
    store: Arc<dyn FeedbackStore>,
    factory: Arc<dyn AdapterFactory>,
    classifier: Arc<ClassifierEngine>,
    progress: Arc<ProgressBroadcaster>,
    settings: RunSettings,
    active: Mutex<Option<ActiveRun>>,
    last: Mutex<Option<CollectionRun>>,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn FeedbackStore>,
        factory: Arc<dyn AdapterFactory>,
        classifier: Arc<ClassifierEngine>,
        progress: Arc<ProgressBroadcaster>,
        settings: RunSettings,
    ) -> Self {
        Self {
            store,
            factory,
            classifier,
            progress,
            settings,
            active: Mutex::new(None),
            last: Mutex::new(None),
        }
    }

    pub fn progress(&self) -> Arc<ProgressBroadcaster> {
        Arc::clone(&self.progress)
    }

    /// Start a run over the enabled sources. Fails fast with
    /// [`RunError::AlreadyActive`] while another run holds the slot.
    pub fn start_run(self: Arc<Self>, sources: Vec<SourceConfig>) -> Result<String, RunError> {
        let enabled: Vec<SourceConfig> = sources.into_iter().filter(|s| s.enabled()).collect();
        if enabled.is_empty() {
            return Err(RunError::NoSourcesEnabled);
        }

        let run_id = Uuid::new_v4().to_string();
        let cancel_rx = {
            let mut active = self.active.lock().expect("active-run lock poisoned");
            if let Some(a) = active.as_ref() {
                return Err(RunError::AlreadyActive(a.run_id.clone()));
            }
            let (tx, rx) = watch::channel(false);
            *active = Some(ActiveRun {
                run_id: run_id.clone(),
                cancel: tx,
            });
            rx
        };

        let source_names: Vec<String> = enabled.iter().map(|s| s.source_name()).collect();
        let run = CollectionRun {
            run_id: run_id.clone(),
            status: RunStatus::Running,
            per_source: source_names
                .iter()
                .map(|n| (n.clone(), SourceProgress::default()))
                .collect(),
            started_at: Utc::now().naive_utc(),
            finished_at: None,
            errors: Vec::new(),
            items_collected: 0,
            repeats: Vec::new(),
        };
        *self.last.lock().expect("last-run lock poisoned") = Some(run);
        self.progress.begin_run(&run_id, &source_names);

        tracing::info!(target: "collect", run_id = %run_id, sources = source_names.len(), "collection run started");

        let id = run_id.clone();
        tokio::spawn(async move {
            self.execute(id, enabled, cancel_rx).await;
        });

        Ok(run_id)
    }

    /// Request cancellation of the active run.
    pub fn cancel_run(&self, run_id: &str) -> Result<(), RunError> {
        let active = self.active.lock().expect("active-run lock poisoned");
        match active.as_ref() {
            Some(a) if a.run_id == run_id => {
                let _ = a.cancel.send(true);
                tracing::info!(target: "collect", run_id = %run_id, "cancellation requested");
                Ok(())
            }
            _ => Err(RunError::UnknownRun(run_id.to_string())),
        }
    }

    /// Snapshot of the identified run (current or most recent).
    pub fn get_status(&self, run_id: &str) -> Option<CollectionRun> {
        self.last
            .lock()
            .expect("last-run lock poisoned")
            .as_ref()
            .filter(|r| r.run_id == run_id)
            .cloned()
    }

    /// Snapshot of the current (or last finished) run, if any.
    pub fn current(&self) -> Option<CollectionRun> {
        self.last.lock().expect("last-run lock poisoned").clone()
    }

    /// Mutate the run record, but only while it has not been superseded.
    fn with_run<F: FnOnce(&mut CollectionRun)>(&self, run_id: &str, f: F) {
        if let Some(run) = self.last.lock().expect("last-run lock poisoned").as_mut() {
            if run.run_id == run_id {
                f(run);
            }
        }
    }

    async fn execute(
        self: Arc<Self>,
        run_id: String,
        sources: Vec<SourceConfig>,
        cancel: watch::Receiver<bool>,
    ) {
        ensure_metrics_described();
        counter!("collect_runs_total").increment(1);

        let total = sources.len();
        let sem = Arc::new(Semaphore::new(self.settings.max_concurrent_fetches.max(1)));
        let mut join = JoinSet::new();

        for cfg in sources {
            let name = cfg.source_name();
            let factory = Arc::clone(&self.factory);
            let progress = Arc::clone(&self.progress);
            let sem = Arc::clone(&sem);
            let fetch_timeout = self.settings.fetch_timeout;
            let mut cancel = cancel.clone();

            join.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return (name, Err("worker pool closed".to_string()), SourceStatus::Error);
                };
                if *cancel.borrow() {
                    return (name, Err("cancelled".to_string()), SourceStatus::Cancelled);
                }

                progress.source_started(&name);
                let adapter = match factory.build(&cfg) {
                    Ok(a) => a,
                    Err(e) => {
                        let msg = format!("adapter setup failed: {e:#}");
                        tracing::warn!(target: "collect", source = %name, error = %msg, "source skipped");
                        counter!("collect_source_errors_total").increment(1);
                        progress.source_finished(&name, 0, SourceStatus::Error);
                        return (name, Err(msg), SourceStatus::Error);
                    }
                };

                let fetched = tokio::select! {
                    _ = cancel.changed() => {
                        progress.source_finished(&name, 0, SourceStatus::Cancelled);
                        return (name, Err("cancelled".to_string()), SourceStatus::Cancelled);
                    }
                    res = tokio::time::timeout(fetch_timeout, adapter.fetch()) => res,
                };

                match fetched {
                    Ok(Ok(items)) => {
                        progress.source_finished(&name, items.len(), SourceStatus::Completed);
                        (name, Ok(items), SourceStatus::Completed)
                    }
                    Ok(Err(e)) => {
                        let msg = format!("{e:#}");
                        tracing::warn!(target: "collect", source = %name, error = %msg, "source fetch failed");
                        counter!("collect_source_errors_total").increment(1);
                        progress.source_finished(&name, 0, SourceStatus::Error);
                        (name, Err(msg), SourceStatus::Error)
                    }
                    Err(_) => {
                        let msg = format!("fetch timed out after {}s", fetch_timeout.as_secs());
                        tracing::warn!(target: "collect", source = %name, "source fetch timed out");
                        counter!("collect_source_errors_total").increment(1);
                        progress.source_finished(&name, 0, SourceStatus::Error);
                        (name, Err(msg), SourceStatus::Error)
                    }
                }
            });
        }

        let mut fetched: Vec<(String, Vec<RawItem>)> = Vec::new();
        let mut any_success = false;
        let mut settled = 0usize;

        while let Some(joined) = join.join_next().await {
            settled += 1;
            match joined {
                Ok((name, outcome, status)) => {
                    let count = outcome.as_ref().map_or(0, Vec::len);
                    self.with_run(&run_id, |run| {
                        run.per_source
                            .insert(name.clone(), SourceProgress { count, status });
                        if let Err(msg) = &outcome {
                            run.errors.push(SourceFailure {
                                source: name.clone(),
                                message: msg.clone(),
                            });
                        }
                    });
                    if let Ok(items) = outcome {
                        any_success = true;
                        fetched.push((name, items));
                    }
                }
                Err(e) => {
                    // A panicked fetch task is isolated like any other source failure.
                    tracing::warn!(target: "collect", error = ?e, "fetch task aborted");
                    self.with_run(&run_id, |run| {
                        run.errors.push(SourceFailure {
                            source: "internal".to_string(),
                            message: format!("fetch task aborted: {e}"),
                        });
                    });
                }
            }
            // Fetching owns the first 90%; processing and merge own the rest.
            self.progress
                .set_percent(90.0 * settled as f32 / total.max(1) as f32);
        }

        let cancelled = *cancel.borrow();

        // Processing stage: synchronous and pure, over the settled batch only.
        let mut normalized: Vec<NormalizedItem> = Vec::new();
        for (source, items) in fetched {
            counter!("collect_items_total").increment(items.len() as u64);
            for raw in items {
                normalized.push(normalize::normalize(raw, &source));
            }
        }

        let outcome = dedupe::dedupe(normalized, self.settings.similarity_threshold);
        counter!("dedup_removed_total").increment(outcome.removed as u64);

        let batch: Vec<(NormalizedItem, ClassificationResult)> = outcome
            .survivors
            .into_iter()
            .map(|item| {
                let classification = self.classifier.classify(&item);
                (item, classification)
            })
            .collect();

        let now = Utc::now().naive_utc();
        let merged = batch.len();
        let stats = self.store.merge_collected(batch, now);

        let status = if cancelled {
            RunStatus::Cancelled
        } else if any_success {
            RunStatus::Completed
        } else {
            RunStatus::Error
        };

        // Terminal progress event goes out while this run still holds the
        // slot; the record update happens after the slot is released so that
        // a caller observing `finished_at` can immediately start a new run.
        self.progress.finish(status);
        *self.active.lock().expect("active-run lock poisoned") = None;
        self.with_run(&run_id, |run| {
            run.status = status;
            run.finished_at = Some(now);
            run.items_collected = merged;
            run.repeats = outcome.repeats.clone();
        });
        gauge!("collect_last_run_ts").set(now.and_utc().timestamp() as f64);

        tracing::info!(
            target: "collect",
            run_id = %run_id,
            status = ?status,
            merged,
            inserted = stats.inserted,
            updated = stats.updated,
            duplicates_removed = outcome.removed,
            repeat_clusters = outcome.repeats.len(),
            "collection run finished"
        );
    }
}
