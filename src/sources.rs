// src/sources.rs
//! Source adapter seam: the collection core consumes external platforms only
//! through the [`SourceAdapter`] capability. Real network clients live outside
//! this crate; an [`AdapterFactory`] maps validated source configs onto
//! adapter instances, and [`FixtureAdapter`] serves tests and local runs.

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::config::SourceConfig;

/// Source-native payload as delivered by a platform adapter.
/// Ephemeral; produced and consumed within one collection run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RawItem {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: String,
    /// Timestamp exactly as the platform reported it; parsed later by the
    /// normalizer, never here.
    #[serde(default)]
    pub created_at_raw: String,
    pub url: Option<String>,
    /// Platform-native identifier (submission id, issue number, message id).
    pub native_id: Option<String>,
    /// Source-specific leftovers (flair, labels, forum name, ...).
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetch the latest batch of raw items. Any error counts as a source
    /// failure for the whole task; retries and auth are the adapter's business.
    async fn fetch(&self) -> Result<Vec<RawItem>>;
    fn name(&self) -> &str;
}

/// Builds an adapter for a validated source config. The seam lets the binary
/// wire real platform clients while tests plug in fixtures or failures.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, cfg: &SourceConfig) -> Result<Box<dyn SourceAdapter>>;
}

/// Adapter serving a pre-parsed batch, used by tests and the demo binary.
pub struct FixtureAdapter {
    name: String,
    items: Vec<RawItem>,
}

impl FixtureAdapter {
    pub fn from_items(name: impl Into<String>, items: Vec<RawItem>) -> Self {
        Self {
            name: name.into(),
            items,
        }
    }

    /// Parse a JSON array of raw items (the shape the fixture files carry).
    pub fn from_json_str(name: &str, json: &str) -> Result<Self> {
        let items: Vec<RawItem> = serde_json::from_str(json)
            .with_context(|| format!("parsing fixture items for source `{name}`"))?;
        Ok(Self::from_items(name, items))
    }
}

#[async_trait::async_trait]
impl SourceAdapter for FixtureAdapter {
    async fn fetch(&self) -> Result<Vec<RawItem>> {
        Ok(self.items.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Factory resolving every source kind to an embedded fixture batch.
///
/// The real platform factories (Reddit, GitHub, Azure DevOps, Fabric
/// Community) are external collaborators; this one keeps the pipeline
/// end-to-end runnable without credentials.
pub struct FixtureFactory;

impl AdapterFactory for FixtureFactory {
    fn build(&self, cfg: &SourceConfig) -> Result<Box<dyn SourceAdapter>> {
        let json = match cfg {
            SourceConfig::Reddit { .. } => include_str!("../tests/fixtures/reddit.json"),
            SourceConfig::GithubDiscussions { .. } => {
                include_str!("../tests/fixtures/github_discussions.json")
            }
            SourceConfig::GithubIssues { .. } => {
                include_str!("../tests/fixtures/github_issues.json")
            }
            SourceConfig::AzureDevOps { .. } => include_str!("../tests/fixtures/azure_devops.json"),
            SourceConfig::FabricCommunity { .. } => {
                include_str!("../tests/fixtures/fabric_community.json")
            }
        };
        Ok(Box::new(FixtureAdapter::from_json_str(
            &cfg.source_name(),
            json,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_adapter_parses_json_array() {
        let json = r#"[
            {"title": "Crash on save", "body": "It crashes.", "author": "u1",
             "created_at_raw": "2025-01-15T10:00:00", "url": "https://x/1", "native_id": "1"}
        ]"#;
        let a = FixtureAdapter::from_json_str("Reddit", json).expect("parse fixture");
        assert_eq!(a.name(), "Reddit");
        assert_eq!(a.items.len(), 1);
        assert_eq!(a.items[0].title, "Crash on save");
    }

    #[tokio::test]
    async fn fixture_adapter_fetch_returns_items() {
        let a = FixtureAdapter::from_items(
            "GitHub Issues",
            vec![RawItem {
                title: "t".into(),
                body: "b".into(),
                author: "a".into(),
                created_at_raw: "2025-01-01".into(),
                url: None,
                native_id: Some("7".into()),
                extra: Map::new(),
            }],
        );
        let items = a.fetch().await.expect("fetch fixture");
        assert_eq!(items.len(), 1);
    }
}
