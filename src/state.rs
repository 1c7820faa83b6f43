// src/state.rs
//! Review lifecycle of persisted feedback, independent of collection runs.
//!
//! Expected flow: NEW -> TRIAGED -> {CLOSED | IRRELEVANT}, with TRIAGED able
//! to return to NEW and both closed states reopenable to NEW. `update_state`
//! validates state *names* (last-write-wins on the value itself); every hop is
//! preserved in the append-only history.

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::store::{FeedbackRecord, FeedbackStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReviewState {
    New,
    Triaged,
    Closed,
    Irrelevant,
}

impl ReviewState {
    pub const ALL: [ReviewState; 4] = [
        ReviewState::New,
        ReviewState::Triaged,
        ReviewState::Closed,
        ReviewState::Irrelevant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Triaged => "TRIAGED",
            Self::Closed => "CLOSED",
            Self::Irrelevant => "IRRELEVANT",
        }
    }
}

impl std::fmt::Display for ReviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "TRIAGED" => Ok(Self::Triaged),
            "CLOSED" => Ok(Self::Closed),
            "IRRELEVANT" => Ok(Self::Irrelevant),
            _ => Err(()),
        }
    }
}

/// State-level failures, surfaced synchronously to the caller and never
/// silently coerced.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown feedback identity: {0}")]
    UnknownIdentity(String),
    #[error("invalid feedback state: {0}")]
    InvalidState(String),
}

/// One audit-trail entry. Append-only: no update ever removes or rewrites a
/// transition, so concurrent writers can race on the state value without
/// losing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub old_state: ReviewState,
    pub new_state: ReviewState,
    pub user: String,
    pub at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub text: String,
    pub created_at: NaiveDateTime,
}

/// Owns the post-collection lifecycle, keyed by identity against the persisted
/// record set.
pub struct StateManager {
    store: Arc<dyn FeedbackStore>,
}

impl StateManager {
    pub fn new(store: Arc<dyn FeedbackStore>) -> Self {
        Self { store }
    }

    /// Set a record's state. Fails with [`StateError::InvalidState`] for an
    /// unrecognized state name and [`StateError::UnknownIdentity`] when no
    /// record exists; otherwise appends to the audit history and updates
    /// `assigned_user`/`last_updated`.
    pub fn update_state(
        &self,
        identity: &str,
        new_state: &str,
        user: &str,
    ) -> Result<FeedbackRecord, StateError> {
        let state = new_state
            .parse::<ReviewState>()
            .map_err(|()| StateError::InvalidState(new_state.to_string()))?;
        let record = self
            .store
            .apply_state(identity, state, user, Utc::now().naive_utc())?;
        metrics::counter!("feedback_state_updates_total").increment(1);
        tracing::info!(identity, state = %state, user, "feedback state updated");
        Ok(record)
    }

    /// Pure append; never mutates state.
    pub fn add_comment(
        &self,
        identity: &str,
        text: &str,
        user: &str,
    ) -> Result<Comment, StateError> {
        self.store
            .append_comment(identity, text, user, Utc::now().naive_utc())
    }

    pub fn get_history(&self, identity: &str) -> Result<Vec<StateTransition>, StateError> {
        self.store.history(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for s in ReviewState::ALL {
            assert_eq!(s.as_str().parse::<ReviewState>(), Ok(s));
        }
        assert_eq!("triaged".parse::<ReviewState>(), Ok(ReviewState::Triaged));
        assert!("BOGUS".parse::<ReviewState>().is_err());
    }

    #[test]
    fn error_messages_name_the_offender() {
        let e = StateError::InvalidState("BOGUS".into());
        assert_eq!(e.to_string(), "invalid feedback state: BOGUS");
        let e = StateError::UnknownIdentity("abc".into());
        assert_eq!(e.to_string(), "unknown feedback identity: abc");
    }
}
