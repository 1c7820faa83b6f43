// src/progress.rs
//! Run progress publishing: a single-writer snapshot plus a broadcast stream.
//!
//! The coordinator is the only writer; observers either poll [`ProgressBroadcaster::snapshot`]
//! or subscribe to the event stream. Every event is a full snapshot, so a
//! subscriber never needs to stitch partial updates together (no torn reads).
//!
//! Protocol guarantees, enforced on both ends:
//! - per-run monotonicity: `progress_percent` and per-source counts never
//!   decrease within one `run_id`; only a new run resets them,
//! - exactly one terminal event per run,
//! - stale-data guard ([`ProgressObserver`]): events from a different run are
//!   discarded, and a fresh observer refuses non-zero counts until it has seen
//!   a zeroed start (unless the event is terminal).

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::collect::RunStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    #[default]
    Pending,
    Fetching,
    Completed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProgress {
    pub count: usize,
    pub status: SourceStatus,
}

/// Consistent view of one run's progress. Also the event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub progress_percent: f32,
    pub current_source: Option<String>,
    pub per_source: BTreeMap<String, SourceProgress>,
    /// Set on the final event of a run; nothing follows it for that `run_id`.
    pub terminal: bool,
}

impl ProgressSnapshot {
    fn idle() -> Self {
        Self {
            run_id: String::new(),
            status: RunStatus::Pending,
            progress_percent: 0.0,
            current_source: None,
            per_source: BTreeMap::new(),
            terminal: false,
        }
    }

    pub fn total_count(&self) -> usize {
        self.per_source.values().map(|p| p.count).sum()
    }

    fn is_fresh(&self) -> bool {
        self.progress_percent == 0.0 && self.total_count() == 0 && !self.terminal
    }
}

pub struct ProgressBroadcaster {
    state: RwLock<ProgressSnapshot>,
    tx: broadcast::Sender<ProgressSnapshot>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(ProgressSnapshot::idle()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.read().expect("progress lock poisoned").clone()
    }

    /// Reset under a new `run_id`. The only mutation allowed to lower counts.
    pub fn begin_run(&self, run_id: &str, sources: &[String]) {
        let mut s = self.state.write().expect("progress lock poisoned");
        *s = ProgressSnapshot::idle();
        s.run_id = run_id.to_string();
        s.status = RunStatus::Running;
        for src in sources {
            s.per_source.insert(src.clone(), SourceProgress::default());
        }
        let event = s.clone();
        drop(s);
        let _ = self.tx.send(event);
    }

    pub fn source_started(&self, source: &str) {
        self.mutate(|s| {
            s.current_source = Some(source.to_string());
            if let Some(p) = s.per_source.get_mut(source) {
                p.status = SourceStatus::Fetching;
            }
        });
    }

    /// Update a source's item count; regressive values are clamped away.
    pub fn source_count(&self, source: &str, count: usize) {
        self.mutate(|s| {
            if let Some(p) = s.per_source.get_mut(source) {
                p.count = p.count.max(count);
            }
        });
    }

    pub fn source_finished(&self, source: &str, count: usize, status: SourceStatus) {
        self.mutate(|s| {
            if let Some(p) = s.per_source.get_mut(source) {
                p.count = p.count.max(count);
                p.status = status;
            }
        });
    }

    /// Raise the overall percent; lowering it within a run is impossible.
    pub fn set_percent(&self, percent: f32) {
        self.mutate(|s| {
            s.progress_percent = s.progress_percent.max(percent.clamp(0.0, 100.0));
        });
    }

    /// Publish the run's single terminal event with final per-source counts.
    /// Further publishes for this run are ignored.
    pub fn finish(&self, status: RunStatus) {
        let mut s = self.state.write().expect("progress lock poisoned");
        if s.terminal {
            return;
        }
        s.status = status;
        s.progress_percent = 100.0;
        s.current_source = None;
        s.terminal = true;
        let event = s.clone();
        drop(s);
        let _ = self.tx.send(event);
    }

    fn mutate<F: FnOnce(&mut ProgressSnapshot)>(&self, f: F) {
        let mut s = self.state.write().expect("progress lock poisoned");
        if s.terminal {
            return;
        }
        f(&mut s);
        let event = s.clone();
        drop(s);
        let _ = self.tx.send(event);
    }
}

/// Client-side half of the protocol. Any observer (poller or subscriber) can
/// run events through `apply` and get exactly the guarantees of §progress:
/// stale runs discarded, counts and percent monotone, nothing after terminal.
#[derive(Debug, Default)]
pub struct ProgressObserver {
    tracked: Option<ProgressSnapshot>,
    /// Set by [`ProgressObserver::track`]: the run id came from out-of-band
    /// knowledge, so events from any other run are stale by definition.
    pinned: bool,
}

impl ProgressObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect events for a specific run (the id returned by `start_run`).
    /// Local state resets to initializing.
    pub fn track(&mut self, run_id: &str) {
        let mut s = ProgressSnapshot::idle();
        s.run_id = run_id.to_string();
        self.tracked = Some(s);
        self.pinned = true;
    }

    pub fn current(&self) -> Option<&ProgressSnapshot> {
        self.tracked.as_ref()
    }

    /// Apply one event. Returns the updated view, or `None` when the event was
    /// discarded by the stale-data guard.
    pub fn apply(&mut self, event: ProgressSnapshot) -> Option<&ProgressSnapshot> {
        let adopt = match &self.tracked {
            // Never seen a run: only a zeroed start or a terminal marker may
            // establish one, otherwise a stale mid-run event from an earlier
            // run could be adopted as current.
            None => {
                if event.is_fresh() || event.terminal {
                    true
                } else {
                    return None;
                }
            }
            // Different run: a pinned observer discards it outright; an
            // adopted view accepts only a fresh reset under the new id.
            Some(t) if t.run_id != event.run_id => {
                if !self.pinned && event.is_fresh() {
                    true
                } else {
                    return None;
                }
            }
            Some(t) if t.terminal => return None,
            Some(_) => false,
        };

        if adopt {
            self.tracked = Some(event);
        } else if let Some(t) = self.tracked.as_mut() {
            // Monotone merge: regressive counts/percent cannot corrupt the
            // local view even if the transport reorders events.
            t.status = event.status;
            t.current_source = event.current_source;
            t.progress_percent = t.progress_percent.max(event.progress_percent);
            for (src, p) in event.per_source {
                let entry = t.per_source.entry(src).or_default();
                entry.count = entry.count.max(p.count);
                entry.status = p.status;
            }
            t.terminal = event.terminal;
        }
        self.tracked.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<String> {
        vec!["Reddit".to_string(), "GitHub Issues".to_string()]
    }

    #[test]
    fn percent_and_counts_never_decrease_within_a_run() {
        let b = ProgressBroadcaster::new();
        b.begin_run("run-1", &sources());
        b.set_percent(40.0);
        b.set_percent(10.0);
        assert_eq!(b.snapshot().progress_percent, 40.0);

        b.source_count("Reddit", 25);
        b.source_count("Reddit", 5);
        assert_eq!(b.snapshot().per_source["Reddit"].count, 25);
    }

    #[test]
    fn new_run_resets_under_new_run_id() {
        let b = ProgressBroadcaster::new();
        b.begin_run("run-1", &sources());
        b.source_count("Reddit", 25);
        b.finish(RunStatus::Completed);

        b.begin_run("run-2", &sources());
        let s = b.snapshot();
        assert_eq!(s.run_id, "run-2");
        assert_eq!(s.progress_percent, 0.0);
        assert_eq!(s.total_count(), 0);
    }

    #[test]
    fn exactly_one_terminal_event() {
        let b = ProgressBroadcaster::new();
        let mut rx = b.subscribe();
        b.begin_run("run-1", &sources());
        b.finish(RunStatus::Completed);
        b.finish(RunStatus::Error);
        b.set_percent(50.0);

        let mut terminals = 0;
        while let Ok(ev) = rx.try_recv() {
            if ev.terminal {
                terminals += 1;
                assert_eq!(ev.status, RunStatus::Completed);
            }
        }
        assert_eq!(terminals, 1);
    }

    #[test]
    fn observer_discards_events_from_other_runs() {
        let mut obs = ProgressObserver::new();
        obs.track("run-2");

        let mut stale = ProgressSnapshot::idle();
        stale.run_id = "run-1".to_string();
        stale.progress_percent = 80.0;
        stale
            .per_source
            .insert("Reddit".into(), SourceProgress { count: 120, status: SourceStatus::Completed });
        assert!(obs.apply(stale).is_none(), "stale run event must be discarded");
        assert_eq!(obs.current().expect("tracked").total_count(), 0);
    }

    #[test]
    fn fresh_observer_rejects_nonzero_counts_without_terminal_marker() {
        let mut obs = ProgressObserver::new();

        let mut leak = ProgressSnapshot::idle();
        leak.run_id = "old".to_string();
        leak.per_source
            .insert("Reddit".into(), SourceProgress { count: 200, status: SourceStatus::Completed });
        assert!(obs.apply(leak.clone()).is_none());

        // The same payload marked terminal is the final-count report and is allowed.
        leak.terminal = true;
        leak.status = RunStatus::Completed;
        assert!(obs.apply(leak).is_some());
    }

    #[test]
    fn observer_view_is_monotone_even_for_reordered_events() {
        let mut obs = ProgressObserver::new();
        obs.track("run-1");

        let mut ev1 = ProgressSnapshot::idle();
        ev1.run_id = "run-1".to_string();
        ev1.status = RunStatus::Running;
        ev1.progress_percent = 50.0;
        ev1.per_source
            .insert("Reddit".into(), SourceProgress { count: 30, status: SourceStatus::Fetching });

        let mut ev2 = ev1.clone();
        ev2.progress_percent = 20.0;
        ev2.per_source.get_mut("Reddit").expect("src").count = 10;

        obs.apply(ev1);
        obs.apply(ev2);
        let cur = obs.current().expect("tracked");
        assert_eq!(cur.progress_percent, 50.0);
        assert_eq!(cur.per_source["Reddit"].count, 30);
    }

    #[test]
    fn nothing_applies_after_local_terminal() {
        let mut obs = ProgressObserver::new();
        obs.track("run-1");

        let mut done = ProgressSnapshot::idle();
        done.run_id = "run-1".to_string();
        done.status = RunStatus::Completed;
        done.terminal = true;
        assert!(obs.apply(done).is_some());

        let mut late = ProgressSnapshot::idle();
        late.run_id = "run-1".to_string();
        late.progress_percent = 10.0;
        assert!(obs.apply(late).is_none());
    }
}
