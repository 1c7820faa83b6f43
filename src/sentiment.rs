// src/sentiment.rs
//! Lexicon-based sentiment polarity. Pure and deterministic: no I/O, no model.
//!
//! Counts signed cue-word weights over the text; a negator within the three
//! preceding tokens inverts a cue's sign ("not working" scores negative even
//! though "working" alone is positive).

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

static LEXICON: Lazy<HashMap<String, i32>> = Lazy::new(|| {
    let raw = include_str!("../sentiment_lexicon.json");
    serde_json::from_str::<HashMap<String, i32>>(raw).expect("valid sentiment lexicon")
});

/// Margin around zero: the weighted sum must clear it in either direction
/// before the text leaves Neutral.
const POLARITY_MARGIN: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Positive => write!(f, "Positive"),
            Self::Negative => write!(f, "Negative"),
            Self::Neutral => write!(f, "Neutral"),
        }
    }
}

/// Weighted lexicon sum over the text, with negation handling.
/// Returns (score, token count).
pub fn score_text(text: &str) -> (i32, usize) {
    let tokens: Vec<String> = tokenize(text).collect();
    let mut score: i32 = 0;

    for i in 0..tokens.len() {
        let base = *LEXICON.get(tokens[i].as_str()).unwrap_or(&0);
        if base == 0 {
            continue;
        }
        // negator within the last 1..=3 tokens inverts the sign
        let negated = (1..=3).any(|k| i >= k && is_negator(tokens[i - k].as_str()));
        score += if negated { -base } else { base };
    }

    (score, tokens.len())
}

/// Classify the text's polarity.
pub fn analyze(text: &str) -> Sentiment {
    let (score, _) = score_text(text);
    if score > POLARITY_MARGIN {
        Sentiment::Positive
    } else if score < -POLARITY_MARGIN {
        Sentiment::Negative
    } else {
        Sentiment::Neutral
    }
}

/// Alphanumeric tokens, lower-cased.
fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
}

fn is_negator(tok: &str) -> bool {
    matches!(
        tok,
        "not" | "no" | "never" | "isn't" | "wasn't" | "aren't" | "won't" | "can't" | "cannot"
            | "without" | "stopped" | "stops"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_praise_is_positive() {
        assert_eq!(
            analyze("The new dashboard is excellent and really intuitive, love it"),
            Sentiment::Positive
        );
    }

    #[test]
    fn bug_reports_read_negative() {
        assert_eq!(
            analyze("Constant crashes and data loss, this is terrible and unusable"),
            Sentiment::Negative
        );
    }

    #[test]
    fn mixed_or_flat_text_is_neutral() {
        assert_eq!(analyze("How do I configure the connector?"), Sentiment::Neutral);
    }

    #[test]
    fn negation_inverts_nearby_cues() {
        let (plain, _) = score_text("the sync is working");
        let (negated, _) = score_text("the sync is not working");
        assert!(plain > 0);
        assert!(negated < 0);
    }

    #[test]
    fn analyze_is_deterministic() {
        let text = "Great feature but the save dialog crashes sometimes";
        assert_eq!(analyze(text), analyze(text));
    }
}
