// src/store.rs
//! Repository contract for the persisted feedback set, the in-memory
//! implementation, and the flat tabular export projection.
//!
//! Single-writer discipline: the run coordinator merges collected batches, the
//! state manager applies lifecycle edits, and readers always get cloned
//! snapshots taken under the store lock (no torn reads). History appends are
//! atomic with the state write because both happen under the same lock.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::classify::ClassificationResult;
use crate::normalize::NormalizedItem;
use crate::state::{Comment, ReviewState, StateError, StateTransition};

/// Persisted union of a normalized item, its classification, and the review
/// lifecycle. `identity` (inside `item`) is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    #[serde(flatten)]
    pub item: NormalizedItem,
    pub classification: ClassificationResult,
    pub state: ReviewState,
    pub assigned_user: Option<String>,
    pub last_updated: NaiveDateTime,
    pub history: Vec<StateTransition>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
}

/// Abstract repository the engine writes through. Implementations must make
/// `apply_state` atomic: the state write and its history append happen
/// together or not at all.
pub trait FeedbackStore: Send + Sync {
    /// Merge a collected batch: new identity inserts a fresh record in state
    /// NEW; an existing identity refreshes the normalized/classification
    /// fields and leaves every lifecycle field untouched.
    fn merge_collected(
        &self,
        batch: Vec<(NormalizedItem, ClassificationResult)>,
        now: NaiveDateTime,
    ) -> MergeStats;

    fn get(&self, identity: &str) -> Option<FeedbackRecord>;

    fn list(&self) -> Vec<FeedbackRecord>;

    fn count(&self) -> usize;

    fn apply_state(
        &self,
        identity: &str,
        new_state: ReviewState,
        user: &str,
        now: NaiveDateTime,
    ) -> Result<FeedbackRecord, StateError>;

    fn append_comment(
        &self,
        identity: &str,
        text: &str,
        user: &str,
        now: NaiveDateTime,
    ) -> Result<Comment, StateError>;

    fn history(&self, identity: &str) -> Result<Vec<StateTransition>, StateError>;
}

/// In-memory store keyed by identity. The `BTreeMap` keeps listings in a
/// stable order across calls.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, FeedbackRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, FeedbackRecord>> {
        self.records.lock().expect("feedback store mutex poisoned")
    }
}

impl FeedbackStore for MemoryStore {
    fn merge_collected(
        &self,
        batch: Vec<(NormalizedItem, ClassificationResult)>,
        now: NaiveDateTime,
    ) -> MergeStats {
        let mut stats = MergeStats::default();
        let mut records = self.lock();
        for (item, classification) in batch {
            match records.get_mut(&item.identity) {
                Some(existing) => {
                    existing.item = item;
                    existing.classification = classification;
                    stats.updated += 1;
                }
                None => {
                    records.insert(
                        item.identity.clone(),
                        FeedbackRecord {
                            item,
                            classification,
                            state: ReviewState::New,
                            assigned_user: None,
                            last_updated: now,
                            history: Vec::new(),
                            comments: Vec::new(),
                        },
                    );
                    stats.inserted += 1;
                }
            }
        }
        stats
    }

    fn get(&self, identity: &str) -> Option<FeedbackRecord> {
        self.lock().get(identity).cloned()
    }

    fn list(&self) -> Vec<FeedbackRecord> {
        self.lock().values().cloned().collect()
    }

    fn count(&self) -> usize {
        self.lock().len()
    }

    fn apply_state(
        &self,
        identity: &str,
        new_state: ReviewState,
        user: &str,
        now: NaiveDateTime,
    ) -> Result<FeedbackRecord, StateError> {
        let mut records = self.lock();
        let record = records
            .get_mut(identity)
            .ok_or_else(|| StateError::UnknownIdentity(identity.to_string()))?;
        record.history.push(StateTransition {
            old_state: record.state,
            new_state,
            user: user.to_string(),
            at: now,
        });
        record.state = new_state;
        record.assigned_user = Some(user.to_string());
        record.last_updated = now;
        Ok(record.clone())
    }

    fn append_comment(
        &self,
        identity: &str,
        text: &str,
        user: &str,
        now: NaiveDateTime,
    ) -> Result<Comment, StateError> {
        let mut records = self.lock();
        let record = records
            .get_mut(identity)
            .ok_or_else(|| StateError::UnknownIdentity(identity.to_string()))?;
        let comment = Comment {
            author: user.to_string(),
            text: text.to_string(),
            created_at: now,
        };
        record.comments.push(comment.clone());
        Ok(comment)
    }

    fn history(&self, identity: &str) -> Result<Vec<StateTransition>, StateError> {
        self.lock()
            .get(identity)
            .map(|r| r.history.clone())
            .ok_or_else(|| StateError::UnknownIdentity(identity.to_string()))
    }
}

/// Column order of the flat export.
pub const EXPORT_COLUMNS: &[&str] = &[
    "identity",
    "title",
    "gist",
    "body",
    "category",
    "subcategory",
    "feature_area",
    "domain",
    "audience",
    "priority",
    "sentiment",
    "confidence",
    "source",
    "created_at",
    "url",
    "state",
    "assigned_user",
    "last_updated",
];

/// Read-only projection of the record set to CSV.
pub fn export_csv<W: Write>(records: &[FeedbackRecord], writer: W) -> anyhow::Result<()> {
    let mut w = csv::Writer::from_writer(writer);
    w.write_record(EXPORT_COLUMNS)?;
    for r in records {
        let row: [String; 18] = [
            r.item.identity.clone(),
            r.item.title.clone(),
            r.item.gist.clone(),
            r.item.body.clone(),
            r.classification.category.clone(),
            r.classification.subcategory.clone(),
            r.classification.feature_area.clone().unwrap_or_default(),
            r.classification.domain.clone(),
            r.classification.audience.to_string(),
            r.classification.priority.to_string(),
            r.classification.sentiment.to_string(),
            format!("{:.3}", r.classification.confidence),
            r.item.source.clone(),
            r.item.created_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            r.item.url.clone().unwrap_or_default(),
            r.state.as_str().to_string(),
            r.assigned_user.clone().unwrap_or_default(),
            r.last_updated.format("%Y-%m-%dT%H:%M:%S").to_string(),
        ];
        w.write_record(&row)?;
    }
    w.flush()?;
    Ok(())
}
