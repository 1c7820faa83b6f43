// src/config.rs
//! Application configuration: source definitions (a closed tagged enum with an
//! explicit validation step), pipeline tuning knobs, and the persisted search
//! keyword list the UI layer manages.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/harvester.toml";
pub const ENV_CONFIG_PATH: &str = "HARVESTER_CONFIG_PATH";

pub const DEFAULT_KEYWORDS_PATH: &str = "config/keywords.json";
pub const ENV_KEYWORDS_PATH: &str = "HARVESTER_KEYWORDS_PATH";

fn default_max_items() -> usize {
    500
}

fn default_enabled() -> bool {
    true
}

/// One configured feedback source. Closed variant set: unknown kinds fail at
/// deserialization instead of travelling through the pipeline as loose maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Reddit {
        subreddit: String,
        #[serde(default = "default_max_items")]
        max_items: usize,
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
    GithubDiscussions {
        owner: String,
        repo: String,
        #[serde(default = "default_max_items")]
        max_items: usize,
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
    GithubIssues {
        owner: String,
        repo: String,
        #[serde(default = "default_max_items")]
        max_items: usize,
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
    AzureDevOps {
        organization_url: String,
        project: String,
        parent_work_item: u64,
        #[serde(default = "default_max_items")]
        max_items: usize,
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
    FabricCommunity {
        #[serde(default)]
        forums: Vec<String>,
        #[serde(default = "default_max_items")]
        max_items: usize,
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
}

impl SourceConfig {
    /// Display name used as the `source` field on every item from this config.
    pub fn source_name(&self) -> String {
        match self {
            Self::Reddit { subreddit, .. } => format!("Reddit r/{subreddit}"),
            Self::GithubDiscussions { .. } => "GitHub Discussions".to_string(),
            Self::GithubIssues { .. } => "GitHub Issues".to_string(),
            Self::AzureDevOps { .. } => "Azure DevOps".to_string(),
            Self::FabricCommunity { .. } => "Fabric Community".to_string(),
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Self::Reddit { enabled, .. }
            | Self::GithubDiscussions { enabled, .. }
            | Self::GithubIssues { enabled, .. }
            | Self::AzureDevOps { enabled, .. }
            | Self::FabricCommunity { enabled, .. } => *enabled,
        }
    }

    /// Reject configs that would only fail later inside a fetch task.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Reddit { subreddit, .. } => {
                if subreddit.trim().is_empty() {
                    return Err(anyhow!("reddit source requires a subreddit"));
                }
            }
            Self::GithubDiscussions { owner, repo, .. }
            | Self::GithubIssues { owner, repo, .. } => {
                if owner.trim().is_empty() || repo.trim().is_empty() {
                    return Err(anyhow!("github source requires owner and repo"));
                }
            }
            Self::AzureDevOps {
                organization_url,
                project,
                parent_work_item,
                ..
            } => {
                if organization_url.trim().is_empty() || project.trim().is_empty() {
                    return Err(anyhow!(
                        "azure devops source requires organization_url and project"
                    ));
                }
                if *parent_work_item == 0 {
                    return Err(anyhow!("azure devops source requires a parent work item id"));
                }
            }
            Self::FabricCommunity { forums, .. } => {
                if forums.iter().any(|f| f.trim().is_empty()) {
                    return Err(anyhow!("fabric community forum names must be non-empty"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Independent timeout for each source fetch task.
    pub fetch_timeout_secs: u64,
    /// Worker-pool cap for concurrent fetches.
    pub max_concurrent_fetches: usize,
    /// Token-Jaccard threshold for repeating-request detection.
    pub similarity_threshold: f32,
    pub sources: Vec<SourceConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            fetch_timeout_secs: 30,
            max_concurrent_fetches: 8,
            similarity_threshold: 0.7,
            sources: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s).context("parsing harvester config")?;
        for src in &cfg.sources {
            src.validate()
                .with_context(|| format!("invalid source config `{}`", src.source_name()))?;
        }
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading harvester config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load using env var + fallback:
    /// 1) $HARVESTER_CONFIG_PATH
    /// 2) config/harvester.toml
    /// 3) built-in defaults (no sources)
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("HARVESTER_CONFIG_PATH points to non-existent path"));
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        Ok(Self::default())
    }

    pub fn enabled_sources(&self) -> Vec<SourceConfig> {
        self.sources
            .iter()
            .filter(|s| s.enabled())
            .cloned()
            .collect()
    }
}

/* ----------------------------
Search keyword list
---------------------------- */

/// Default keyword set used when no persisted list exists yet.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "workload hub",
    "workloads",
    "workload development kit",
    "WDK",
    "marketplace",
    "ISV",
];

fn keywords_path() -> PathBuf {
    std::env::var(ENV_KEYWORDS_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_KEYWORDS_PATH))
}

fn clean_keywords(items: Vec<String>) -> Vec<String> {
    use std::collections::BTreeSet;
    let mut set = BTreeSet::new();
    for it in items {
        let t = it.trim();
        if !t.is_empty() {
            set.insert(t.to_string());
        }
    }
    set.into_iter().collect()
}

pub fn default_keywords() -> Vec<String> {
    clean_keywords(DEFAULT_KEYWORDS.iter().map(|s| s.to_string()).collect())
}

/// Load the keyword list; a missing or unreadable file yields the defaults.
pub fn load_keywords() -> Vec<String> {
    let path = keywords_path();
    match fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str::<Vec<String>>(&content) {
            Ok(list) => clean_keywords(list),
            Err(e) => {
                tracing::warn!(error = ?e, path = %path.display(), "keywords file corrupt, using defaults");
                default_keywords()
            }
        },
        Err(_) => default_keywords(),
    }
}

pub fn save_keywords(keywords: &[String]) -> Result<()> {
    let path = keywords_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating keywords dir {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(keywords)?;
    fs::write(&path, json).with_context(|| format!("writing keywords to {}", path.display()))
}
