// src/classify.rs
//! Rule-based classification: category/subcategory, cross-cutting domain,
//! audience, priority, impact type, and a confidence score, all computed from
//! versioned keyword tables loaded from TOML.
//!
//! The matcher is a pure function of `(tables, item)`: case-insensitive
//! substring matching over `title + body`, normalized weighted scores, and
//! declaration-order tie-breaks so re-classification is idempotent.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::normalize::NormalizedItem;
use crate::sentiment::{self, Sentiment};

pub const DEFAULT_CLASSIFY_PATH: &str = "config/classify.toml";
pub const ENV_CLASSIFY_PATH: &str = "HARVESTER_CLASSIFY_PATH";

/// Category assigned when nothing clears the minimum score.
pub const UNCATEGORIZED: &str = "Uncategorized";
/// Domain assigned when no domain keywords match.
pub const DEFAULT_DOMAIN: &str = "General";
/// Impact label assigned when no impact keywords match.
pub const DEFAULT_IMPACT: &str = "Feedback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Audience {
    Developer,
    Customer,
    #[serde(rename = "ISV")]
    Isv,
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Developer => write!(f, "Developer"),
            Self::Customer => write!(f, "Customer"),
            Self::Isv => write!(f, "ISV"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Full classification of one normalized item. Recomputed deterministically
/// from the same item, so re-classification never drifts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: String,
    pub subcategory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_area: Option<String>,
    pub domain: String,
    pub audience: Audience,
    pub priority: Priority,
    pub impact: String,
    pub sentiment: Sentiment,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_keywords: Vec<String>,
}

/* ----------------------------
Table schema (from TOML)
---------------------------- */

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyRoot {
    pub classify: ClassifySection,
    pub categories: Vec<CategoryCfg>,
    #[serde(default)]
    pub domains: Vec<DomainCfg>,
    #[serde(default)]
    pub audiences: Vec<AudienceCfg>,
    #[serde(default)]
    pub priorities: Vec<PriorityCfg>,
    #[serde(default)]
    pub impact: Vec<ImpactCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifySection {
    pub version: u32,
    pub min_score: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryCfg {
    pub id: String,
    pub name: String,
    pub subcategories: Vec<SubcategoryCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubcategoryCfg {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub feature_area: Option<String>,
    pub keywords: Vec<KeywordCfg>,
}

/// A keyword is either a bare term (weight 1.0) or a weighted entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeywordCfg {
    Plain(String),
    Weighted { term: String, weight: f32 },
}

impl KeywordCfg {
    fn parts(&self) -> (&str, f32) {
        match self {
            Self::Plain(t) => (t.as_str(), 1.0),
            Self::Weighted { term, weight } => (term.as_str(), *weight),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainCfg {
    pub id: String,
    pub name: String,
    pub keywords: Vec<KeywordCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudienceCfg {
    pub audience: Audience,
    pub keywords: Vec<KeywordCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriorityCfg {
    pub level: Priority,
    pub keywords: Vec<KeywordCfg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpactCfg {
    pub label: String,
    pub keywords: Vec<KeywordCfg>,
}

/* ----------------------------
Engine
---------------------------- */

#[derive(Debug)]
pub struct ClassifierEngine {
    cfg: ClassifyRoot,
}

impl ClassifierEngine {
    /// Parse and validate tables from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let cfg: ClassifyRoot = toml::from_str(toml_str).context("parsing classify tables")?;
        if cfg.categories.is_empty() {
            return Err(anyhow!("classify tables define no categories"));
        }
        let check = |kws: &[KeywordCfg], owner: &str| -> Result<()> {
            for kw in kws {
                let (term, weight) = kw.parts();
                if term.trim().is_empty() {
                    return Err(anyhow!("empty keyword in `{owner}`"));
                }
                if weight <= 0.0 {
                    return Err(anyhow!("non-positive weight for `{term}` in `{owner}`"));
                }
            }
            Ok(())
        };
        for cat in &cfg.categories {
            for sub in &cat.subcategories {
                check(&sub.keywords, &sub.id)?;
            }
        }
        for d in &cfg.domains {
            check(&d.keywords, &d.id)?;
        }
        for a in &cfg.audiences {
            check(&a.keywords, "audiences")?;
        }
        for p in &cfg.priorities {
            check(&p.keywords, "priorities")?;
        }
        for i in &cfg.impact {
            check(&i.keywords, &i.label)?;
        }
        Ok(Self { cfg })
    }

    /// Tables compiled into the binary; the fallback when no file is present.
    pub fn embedded_default() -> Self {
        Self::from_toml_str(include_str!("../config/classify.toml"))
            .expect("embedded classify tables are valid")
    }

    /// Load from $HARVESTER_CLASSIFY_PATH, then config/classify.toml, then the
    /// embedded tables.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CLASSIFY_PATH) {
            let content = fs::read_to_string(PathBuf::from(&p))
                .with_context(|| format!("reading classify tables from {p}"))?;
            return Self::from_toml_str(&content);
        }
        let default_p = PathBuf::from(DEFAULT_CLASSIFY_PATH);
        if default_p.exists() {
            let content = fs::read_to_string(&default_p)
                .with_context(|| format!("reading classify tables from {}", default_p.display()))?;
            return Self::from_toml_str(&content);
        }
        Ok(Self::embedded_default())
    }

    pub fn version(&self) -> u32 {
        self.cfg.classify.version
    }

    /// Classify one item. The four sub-classifications (category, domain,
    /// audience, priority) are computed independently; a miss in one never
    /// blocks the others.
    pub fn classify(&self, item: &NormalizedItem) -> ClassificationResult {
        let text = format!("{} {}", item.title, item.body).to_lowercase();

        let (category, subcategory, feature_area, sub_priority, confidence, matched_keywords) =
            self.best_subcategory(&text);
        let domain = self.best_domain(&text);
        let audience = self.detect_audience(&text);
        let priority = self
            .detect_priority(&text)
            .or(sub_priority)
            .unwrap_or(Priority::Medium);
        let impact = self.detect_impact(&text);
        let sentiment = sentiment::analyze(&text);

        ClassificationResult {
            category,
            subcategory,
            feature_area,
            domain,
            audience,
            priority,
            impact,
            sentiment,
            confidence,
            matched_keywords,
        }
    }

    /// Matched-weight / total-weight score for one keyword list.
    fn score_keywords<'a>(text: &str, kws: &'a [KeywordCfg]) -> (f32, Vec<&'a str>) {
        let mut matched_w = 0.0f32;
        let mut total_w = 0.0f32;
        let mut matched = Vec::new();
        for kw in kws {
            let (term, weight) = kw.parts();
            total_w += weight;
            if text.contains(&term.to_lowercase()) {
                matched_w += weight;
                matched.push(term);
            }
        }
        if total_w <= 0.0 {
            (0.0, matched)
        } else {
            (matched_w / total_w, matched)
        }
    }

    fn best_subcategory(
        &self,
        text: &str,
    ) -> (String, String, Option<String>, Option<Priority>, f32, Vec<String>) {
        let mut best: Option<(f32, &CategoryCfg, &SubcategoryCfg, Vec<&str>)> = None;
        for cat in &self.cfg.categories {
            for sub in &cat.subcategories {
                let (score, matched) = Self::score_keywords(text, &sub.keywords);
                if score <= 0.0 {
                    continue;
                }
                // strict `>` keeps the first-declared winner on ties
                let better = best.as_ref().map_or(true, |(b, ..)| score > *b);
                if better {
                    best = Some((score, cat, sub, matched));
                }
            }
        }

        match best {
            Some((score, cat, sub, matched)) if score >= self.cfg.classify.min_score => (
                cat.name.clone(),
                sub.name.clone(),
                sub.feature_area.clone(),
                sub.priority,
                clamp01(score),
                matched.into_iter().map(String::from).collect(),
            ),
            _ => (
                UNCATEGORIZED.to_string(),
                UNCATEGORIZED.to_string(),
                None,
                None,
                0.0,
                Vec::new(),
            ),
        }
    }

    fn best_domain(&self, text: &str) -> String {
        let mut best: Option<(f32, &DomainCfg)> = None;
        for d in &self.cfg.domains {
            let (score, _) = Self::score_keywords(text, &d.keywords);
            if score <= 0.0 {
                continue;
            }
            let better = best.as_ref().map_or(true, |(b, _)| score > *b);
            if better {
                best = Some((score, d));
            }
        }
        best.map_or_else(|| DEFAULT_DOMAIN.to_string(), |(_, d)| d.name.clone())
    }

    fn detect_audience(&self, text: &str) -> Audience {
        let mut best: Option<(usize, Audience)> = None;
        for a in &self.cfg.audiences {
            let hits = a
                .keywords
                .iter()
                .filter(|kw| text.contains(&kw.parts().0.to_lowercase()))
                .count();
            if hits == 0 {
                continue;
            }
            let better = best.as_ref().map_or(true, |(b, _)| hits > *b);
            if better {
                best = Some((hits, a.audience));
            }
        }
        best.map_or(Audience::Customer, |(_, a)| a)
    }

    /// Severity tiers are scanned in declaration order (critical first);
    /// the first tier with a hit wins.
    fn detect_priority(&self, text: &str) -> Option<Priority> {
        for p in &self.cfg.priorities {
            let hit = p
                .keywords
                .iter()
                .any(|kw| text.contains(&kw.parts().0.to_lowercase()));
            if hit {
                return Some(p.level);
            }
        }
        None
    }

    fn detect_impact(&self, text: &str) -> String {
        for i in &self.cfg.impact {
            let hit = i
                .keywords
                .iter()
                .any(|kw| text.contains(&kw.parts().0.to_lowercase()));
            if hit {
                return i.label.clone();
            }
        }
        DEFAULT_IMPACT.to_string()
    }
}

fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}
