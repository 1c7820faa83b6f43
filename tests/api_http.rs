// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - POST /api/collect + /api/collection_status polling + 409 on conflict
// - state endpoints (200 / 404 / 422)
// - GET /api/export.csv
// - GET /api/keywords

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tower::ServiceExt as _; // for `oneshot`

use feedback_harvester::classify::ClassifierEngine;
use feedback_harvester::collect::{RunCoordinator, RunSettings};
use feedback_harvester::config::{self, AppConfig, SourceConfig};
use feedback_harvester::normalize::normalize;
use feedback_harvester::progress::ProgressBroadcaster;
use feedback_harvester::sources::{AdapterFactory, FixtureFactory, RawItem, SourceAdapter};
use feedback_harvester::state::StateManager;
use feedback_harvester::store::{FeedbackStore, MemoryStore};
use feedback_harvester::{api, AppState};

const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests

fn two_source_config() -> AppConfig {
    AppConfig {
        sources: vec![
            SourceConfig::Reddit {
                subreddit: "MicrosoftFabric".into(),
                max_items: 100,
                enabled: true,
            },
            SourceConfig::GithubIssues {
                owner: "microsoft".into(),
                repo: "sample".into(),
                max_items: 100,
                enabled: true,
            },
        ],
        ..AppConfig::default()
    }
}

fn build_state(factory: Arc<dyn AdapterFactory>, cfg: AppConfig) -> AppState {
    let store: Arc<dyn FeedbackStore> = Arc::new(MemoryStore::new());
    let progress = Arc::new(ProgressBroadcaster::new());
    let coordinator = Arc::new(RunCoordinator::new(
        Arc::clone(&store),
        factory,
        Arc::new(ClassifierEngine::embedded_default()),
        progress,
        RunSettings::from_config(&cfg),
    ));
    let state_manager = Arc::new(StateManager::new(Arc::clone(&store)));
    AppState {
        coordinator,
        store,
        state_manager,
        config: Arc::new(cfg),
        keywords: Arc::new(RwLock::new(config::default_keywords())),
    }
}

/// Build the same Router the binary uses, backed by fixture adapters.
fn fixture_router() -> (Router, AppState) {
    let state = build_state(Arc::new(FixtureFactory), two_source_config());
    (api::router(state.clone()), state)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build GET");
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    let v = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, v)
}

async fn post_json(app: &Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("build POST");
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    let v = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, v)
}

async fn wait_finished(app: &Router) {
    for _ in 0..500 {
        let (_, v) = get_json(app, "/api/collection_status").await;
        if v.get("finished_at").map(|f| !f.is_null()).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("collection did not finish in time");
}

#[tokio::test]
async fn api_health_returns_200_and_ok_body() {
    let (app, _) = fixture_router();

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .expect("build GET /health");
    let resp = app.oneshot(req).await.expect("oneshot /health");
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    assert_eq!(String::from_utf8(bytes.to_vec()).expect("utf8").trim(), "ok");
}

#[tokio::test]
async fn api_collection_status_is_ready_before_any_run() {
    let (app, _) = fixture_router();
    let (status, v) = get_json(&app, "/api/collection_status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["status"], json!("ready"));
}

#[tokio::test]
async fn api_collect_runs_fixtures_to_completion() {
    let (app, _) = fixture_router();

    let (status, v) = post_json(&app, "/api/collect", json!({})).await;
    assert_eq!(status, StatusCode::OK, "collect should start: {v}");
    let run_id = v["run_id"].as_str().expect("run_id").to_string();

    wait_finished(&app).await;

    let (status, run) = get_json(&app, &format!("/api/runs/{run_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], json!("completed"));
    assert!(run["items_collected"].as_u64().expect("count") > 0);

    let (status, feedback) = get_json(&app, "/api/feedback").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!feedback.as_array().expect("array").is_empty());

    // Progress endpoint reports the same run as terminal.
    let (_, progress) = get_json(&app, "/api/progress").await;
    assert_eq!(progress["run_id"], json!(run_id));
    assert_eq!(progress["terminal"], json!(true));
}

#[tokio::test]
async fn api_unknown_run_is_404() {
    let (app, _) = fixture_router();
    let (status, _) = get_json(&app, "/api/runs/not-a-run").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_conflicting_collect_gets_409() {
    struct SlowAdapter(String);
    #[async_trait]
    impl SourceAdapter for SlowAdapter {
        async fn fetch(&self) -> anyhow::Result<Vec<RawItem>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
        fn name(&self) -> &str {
            &self.0
        }
    }
    struct SlowFactory;
    impl AdapterFactory for SlowFactory {
        fn build(&self, cfg: &SourceConfig) -> anyhow::Result<Box<dyn SourceAdapter>> {
            Ok(Box::new(SlowAdapter(cfg.source_name())))
        }
    }

    let state = build_state(Arc::new(SlowFactory), two_source_config());
    let app = api::router(state);

    let (status, first) = post_json(&app, "/api/collect", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let run_id = first["run_id"].as_str().expect("run_id").to_string();

    let (status, second) = post_json(&app, "/api/collect", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(second["error"].as_str().expect("error").contains("already active"));

    // Clean up: cancel and let the run settle.
    let (status, _) = post_json(&app, &format!("/api/runs/{run_id}/cancel"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    wait_finished(&app).await;
}

#[tokio::test]
async fn api_state_endpoints_map_errors_to_statuses() {
    let (app, state) = fixture_router();

    // Seed one record directly.
    let item = normalize(
        RawItem {
            title: "Hub slow".into(),
            body: "so slow".into(),
            author: "a".into(),
            created_at_raw: "2025-06-01".into(),
            url: Some("https://r/1".into()),
            native_id: None,
            extra: Map::new(),
        },
        "Reddit r/MicrosoftFabric",
    );
    let identity = item.identity.clone();
    let cls = ClassifierEngine::embedded_default().classify(&item);
    state.store.merge_collected(vec![(item, cls)], Utc::now().naive_utc());

    // Valid update.
    let (status, rec) = post_json(
        &app,
        &format!("/api/feedback/{identity}/state"),
        json!({ "state": "TRIAGED", "user": "alice" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rec["state"], json!("TRIAGED"));
    assert_eq!(rec["assigned_user"], json!("alice"));

    // Invalid state name -> 422.
    let (status, err) = post_json(
        &app,
        &format!("/api/feedback/{identity}/state"),
        json!({ "state": "BOGUS", "user": "alice" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(err["error"].as_str().expect("error").contains("invalid"));

    // Unknown identity -> 404.
    let (status, _) = post_json(
        &app,
        "/api/feedback/does-not-exist/state",
        json!({ "state": "CLOSED", "user": "alice" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Comment + history round-trip.
    let (status, comment) = post_json(
        &app,
        &format!("/api/feedback/{identity}/comments"),
        json!({ "text": "needs repro", "user": "bob" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(comment["author"], json!("bob"));

    let (status, history) = get_json(&app, &format!("/api/feedback/{identity}/history")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().expect("array").len(), 1);
}

#[tokio::test]
async fn api_export_serves_csv_with_header() {
    let (app, state) = fixture_router();

    let item = normalize(
        RawItem {
            title: "Exportable".into(),
            body: "body".into(),
            author: "a".into(),
            created_at_raw: "2025-06-01".into(),
            url: Some("https://r/9".into()),
            native_id: None,
            extra: Map::new(),
        },
        "Reddit r/MicrosoftFabric",
    );
    let cls = ClassifierEngine::embedded_default().classify(&item);
    state.store.merge_collected(vec![(item, cls)], Utc::now().naive_utc());

    let req = Request::builder()
        .method("GET")
        .uri("/api/export.csv")
        .body(Body::empty())
        .expect("build GET export");
    let resp = app.oneshot(req).await.expect("oneshot export");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").and_then(|h| h.to_str().ok()),
        Some("text/csv")
    );
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    let text = String::from_utf8(bytes.to_vec()).expect("utf8");
    assert!(text.starts_with("identity,title,gist,body,"));
    assert_eq!(text.lines().count(), 2);
}

#[tokio::test]
async fn api_keywords_returns_the_configured_list() {
    let (app, _) = fixture_router();
    let (status, v) = get_json(&app, "/api/keywords").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!v.as_array().expect("array").is_empty());
}
