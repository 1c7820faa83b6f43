//! Feedback Harvester — Binary Entrypoint
//! Boots the Axum HTTP server, wiring the collection coordinator, the
//! persisted record set, and the state API behind one router.

use std::sync::{Arc, RwLock};

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feedback_harvester::classify::ClassifierEngine;
use feedback_harvester::collect::{RunCoordinator, RunSettings};
use feedback_harvester::config::{self, AppConfig};
use feedback_harvester::metrics::Metrics;
use feedback_harvester::progress::ProgressBroadcaster;
use feedback_harvester::sources::FixtureFactory;
use feedback_harvester::state::StateManager;
use feedback_harvester::store::{FeedbackStore, MemoryStore};
use feedback_harvester::{api, AppState};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op where the environment is already set.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading harvester config")?;
    let classifier =
        Arc::new(ClassifierEngine::load_default().context("loading classify tables")?);

    let store: Arc<dyn FeedbackStore> = Arc::new(MemoryStore::new());
    let progress = Arc::new(ProgressBroadcaster::new());
    // The fixture factory keeps the pipeline runnable without platform
    // credentials; real adapters plug in through the same seam.
    let coordinator = Arc::new(RunCoordinator::new(
        Arc::clone(&store),
        Arc::new(FixtureFactory),
        classifier,
        Arc::clone(&progress),
        RunSettings::from_config(&cfg),
    ));
    let state_manager = Arc::new(StateManager::new(Arc::clone(&store)));
    let keywords = Arc::new(RwLock::new(config::load_keywords()));

    let metrics = Metrics::init(cfg.sources.len());
    let bind_addr = cfg.bind_addr.clone();

    let state = AppState {
        coordinator,
        store,
        state_manager,
        config: Arc::new(cfg),
        keywords,
    };
    let app = api::router(state).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "feedback harvester listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
