//! End-to-end tests over a real listener: seed the store, bind a port, and
//! talk to the API with a plain HTTP client. No upstream and no LLM server
//! are running anywhere in here; the serving path must not care.

use std::sync::atomic::AtomicU16;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use propboard_backend::api::{self, AppState};
use propboard_backend::config::Config;
use propboard_backend::ensemble::ModelManager;
use propboard_backend::explain::{ExplanationConfig, ExplanationService, OllamaClient};
use propboard_backend::ingest::engine::IngestionStatusHandle;
use propboard_backend::ingest::{RateGovernor, ResponseCache};
use propboard_backend::models::{Projection, ProjectionSource, ProjectionStatus};
use propboard_backend::store::ProjectionStore;
use propboard_backend::supervisor;

struct TestApp {
    _dir: TempDir,
    base_url: String,
    client: reqwest::Client,
    store: Arc<ProjectionStore>,
    manager: Arc<ModelManager>,
}

fn test_config() -> Config {
    Config {
        port_range: (8000, 8010),
        ingest_interval: Duration::from_secs(60),
        request_min_spacing: Duration::from_secs(3),
        backoff_schedule: vec![
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(40),
        ],
        cache_ttl: Duration::from_secs(300),
        stale_threshold: Duration::from_secs(900),
        // Nothing listens on this port: every LLM call fails fast.
        llm_url: "http://127.0.0.1:9".to_string(),
        llm_model_preference: vec!["llama3:8b".to_string()],
        db_path: String::new(),
        retention_days: 14,
        alert_slack_webhook: None,
        alert_email: None,
        sentry_dsn: None,
    }
}

async fn spawn_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("api.db");
    let store = Arc::new(ProjectionStore::new(db_path.to_str().unwrap()).unwrap());

    let config = Arc::new(test_config());
    let http = reqwest::Client::new();
    let manager = Arc::new(ModelManager::with_default_scorers());
    let explainer = Arc::new(ExplanationService::new(
        OllamaClient::new(http.clone(), config.llm_url.clone()),
        ExplanationConfig {
            model_preference: config.llm_model_preference.clone(),
            llm_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    ));

    let state = AppState {
        store: store.clone(),
        ingestion: IngestionStatusHandle::default(),
        governor: Arc::new(RateGovernor::new(
            config.request_min_spacing,
            config.backoff_schedule.clone(),
        )),
        cache: Arc::new(ResponseCache::new(config.cache_ttl)),
        manager: manager.clone(),
        explainer,
        config,
        started_at: tokio::time::Instant::now(),
        bound_port: Arc::new(AtomicU16::new(0)),
    };

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    state.set_port(port);
    let app = api::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        _dir: dir,
        base_url: format!("http://127.0.0.1:{port}"),
        client: http,
        store,
        manager,
    }
}

fn projection(id: &str, league: &str, start_in_minutes: i64, fetched_ago_minutes: i64) -> Projection {
    let now = DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap();
    Projection {
        projection_id: id.to_string(),
        league_id: league.to_string(),
        league_name: Some("MLB".to_string()),
        player_id: Some(format!("player-{id}")),
        player_name: Some("Mookie Betts".to_string()),
        team: Some("LAD".to_string()),
        stat_type: "hits".to_string(),
        line_score: 1.5,
        start_time: now + ChronoDuration::minutes(start_in_minutes),
        status: ProjectionStatus::PreGame,
        source: ProjectionSource::UpstreamLive,
        fetched_at: now - ChronoDuration::minutes(fetched_ago_minutes),
        updated_at: now - ChronoDuration::minutes(fetched_ago_minutes),
        raw: json!({"line_score": 1.5}),
    }
}

async fn wait_for_scorers(manager: &Arc<ModelManager>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.ready_count() < manager.total_count() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "scorers did not become ready in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn warm_store_serves_while_upstream_is_down() {
    let app = spawn_app().await;

    // 100 pre-game projections across three leagues, fetched five minutes
    // ago; the (absent) upstream is irrelevant to this path.
    let mut seed = Vec::new();
    for i in 0..100 {
        let league = ["1", "2", "82"][i % 3];
        seed.push(projection(
            &format!("p{i:03}"),
            league,
            60 + (i as i64 % 300),
            5,
        ));
    }
    app.store.upsert_many(&seed).unwrap();

    let resp = app
        .client
        .get(format!("{}/api/prizepicks/projections?limit=50", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["count"], 50);
    assert_eq!(body["status"], "fresh");

    let projections = body["projections"].as_array().unwrap();
    assert_eq!(projections.len(), 50);
    // Ordered by start_time ascending: the first row is the earliest game.
    let first_start = projections[0]["start_time"].as_str().unwrap();
    let second_start = projections[1]["start_time"].as_str().unwrap();
    assert!(first_start <= second_start);

    let oldest = body["oldest_fetched_at"].as_str().unwrap();
    let oldest: DateTime<Utc> = oldest.parse().unwrap();
    let age = Utc::now() - oldest;
    assert!((4..=6).contains(&age.num_minutes()), "age {age}");
}

#[tokio::test]
async fn health_answers_immediately_with_cold_models() {
    let app = spawn_app().await;

    let started = std::time::Instant::now();
    let resp = app
        .client
        .get(format!("{}/health", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(started.elapsed() < Duration::from_secs(2));

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["models"]["total_count"], 5);
    assert_eq!(body["models"]["ready_count"], 0);
    assert_eq!(body["llm"]["primary"], Value::Null);
}

#[tokio::test]
async fn enhanced_predictions_degrade_without_ready_scorers() {
    let app = spawn_app().await;
    app.store
        .upsert_many(&[projection("p1", "2", 120, 1)])
        .unwrap();

    let resp = app
        .client
        .get(format!(
            "{}/api/predictions/prizepicks/enhanced?k=10",
            app.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["degraded"], true);
    let reason = body["degraded_reason"].as_str().unwrap();
    assert!(reason.contains("0 of 5"), "{reason}");

    // Still a usable (pass/degraded) prediction per projection.
    let predictions = body["predictions"].as_array().unwrap();
    assert_eq!(predictions.len(), 1);
    assert_eq!(predictions[0]["recommendation"], "pass");
    assert_eq!(predictions[0]["projection"]["projection_id"], "p1");
}

#[tokio::test]
async fn enhanced_predictions_rank_with_trained_scorers() {
    let app = spawn_app().await;
    let seed: Vec<Projection> = (0..10)
        .map(|i| projection(&format!("p{i}"), "2", 60 + i as i64, 1))
        .collect();
    app.store.upsert_many(&seed).unwrap();

    let cancel = CancellationToken::new();
    app.manager.spawn_training(&cancel);
    wait_for_scorers(&app.manager).await;

    let resp = app
        .client
        .get(format!(
            "{}/api/predictions/prizepicks/enhanced?k=10",
            app.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["degraded"], false);
    assert_eq!(body["count"], 10);

    let predictions = body["predictions"].as_array().unwrap();
    for p in predictions {
        let conf = p["confidence"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&conf));
        let rec = p["recommendation"].as_str().unwrap();
        assert!(["over", "under", "pass"].contains(&rec));
        assert!(p["per_scorer"].as_array().unwrap().len() >= 2);
        assert!(p["projection"]["projection_id"].is_string());
    }
}

#[tokio::test]
async fn chat_falls_back_when_llm_is_offline() {
    let app = spawn_app().await;
    app.store
        .upsert_many(&[projection("mlb-1", "2", 120, 1)])
        .unwrap();

    let started = std::time::Instant::now();
    let resp = app
        .client
        .post(format!("{}/api/propollama/chat", app.base_url))
        .json(&json!({
            "message": "why is the Mookie Betts hits prop interesting?",
            "context": {"projection_ids": ["mlb-1"]}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(started.elapsed() < Duration::from_secs(2));

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["model_used"], "fallback");
    assert_eq!(body["reply"]["model_used"], "fallback");
    let text = body["reply"]["text"].as_str().unwrap();
    assert!(text.contains("Mookie Betts"));
    assert!(text.contains("hits"));
    assert!(text.contains("1.5"));
    assert!(body["latency_ms"].as_u64().unwrap() < 2000);
    assert!(body["session_id"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn chat_rejects_empty_message() {
    let app = spawn_app().await;
    let resp = app
        .client
        .post(format!("{}/api/propollama/chat", app.base_url))
        .json(&json!({"message": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn projections_boundary_behaviors() {
    let app = spawn_app().await;
    app.store
        .upsert_many(&[projection("p1", "2", 120, 1)])
        .unwrap();

    // limit=0 is a valid request for an empty page.
    let body: Value = app
        .client
        .get(format!("{}/api/prizepicks/projections?limit=0", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 0);
    assert_eq!(body["projections"].as_array().unwrap().len(), 0);

    // Over-max limits clamp silently.
    let resp = app
        .client
        .get(format!(
            "{}/api/prizepicks/projections?limit=999999",
            app.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Garbage limits are a client error.
    let resp = app
        .client
        .get(format!(
            "{}/api/prizepicks/projections?limit=abc",
            app.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Empty store reports an explicitly empty board, still 200.
    let fresh = spawn_app().await;
    let body: Value = fresh
        .client
        .get(format!("{}/api/prizepicks/projections", fresh.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "empty");
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn stale_store_is_reported_not_hidden() {
    let app = spawn_app().await;
    // Fetched 30 minutes ago, past the 15-minute staleness threshold.
    app.store
        .upsert_many(&[projection("p1", "2", 120, 30)])
        .unwrap();

    let body: Value = app
        .client
        .get(format!("{}/api/prizepicks/projections", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "stale");
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn include_raw_is_opt_in() {
    let app = spawn_app().await;
    app.store
        .upsert_many(&[projection("p1", "2", 120, 1)])
        .unwrap();

    let body: Value = app
        .client
        .get(format!("{}/api/prizepicks/projections", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["projections"][0].get("raw").is_none());

    let body: Value = app
        .client
        .get(format!(
            "{}/api/prizepicks/projections?include_raw=true",
            app.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["projections"][0]["raw"]["line_score"], 1.5);
}

#[tokio::test]
async fn discovery_sweep_finds_backend_under_port_contention() {
    // Hold the first two ports of a private range, then start the backend on
    // the range and probe it the way the frontend does.
    let held_a = tokio::net::TcpListener::bind(("127.0.0.1", 19460)).await.unwrap();
    let held_b = tokio::net::TcpListener::bind(("127.0.0.1", 19461)).await.unwrap();

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("disc.db");
    let store = Arc::new(ProjectionStore::new(db_path.to_str().unwrap()).unwrap());
    let http = reqwest::Client::new();
    let mut config = test_config();
    config.port_range = (19460, 19470);
    let config = Arc::new(config);

    let state = AppState {
        store,
        ingestion: IngestionStatusHandle::default(),
        governor: Arc::new(RateGovernor::new(
            config.request_min_spacing,
            config.backoff_schedule.clone(),
        )),
        cache: Arc::new(ResponseCache::new(config.cache_ttl)),
        manager: Arc::new(ModelManager::with_default_scorers()),
        explainer: Arc::new(ExplanationService::new(
            OllamaClient::new(http.clone(), config.llm_url.clone()),
            ExplanationConfig::default(),
        )),
        config: config.clone(),
        started_at: tokio::time::Instant::now(),
        bound_port: Arc::new(AtomicU16::new(0)),
    };

    let (listener, port) = supervisor::bind_port_in_range(config.port_range).await.unwrap();
    assert_eq!(port, 19462);
    state.set_port(port);
    let app = api::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Frontend probe sweep: first 200 with ok/degraded status wins.
    let probe = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let mut discovered = None;
    for p in 19460..=19470u16 {
        let url = format!("http://127.0.0.1:{p}/health");
        if let Ok(resp) = probe.get(&url).send().await {
            if resp.status() == 200 {
                let body: Value = resp.json().await.unwrap();
                let status = body["status"].as_str().unwrap();
                if status == "ok" || status == "degraded" {
                    discovered = Some((p, body["port"].as_u64().unwrap() as u16));
                    break;
                }
            }
        }
    }

    let (probe_port, reported_port) = discovered.expect("discovery sweep found no backend");
    assert_eq!(probe_port, 19462);
    assert_eq!(reported_port, 19462);

    drop(held_a);
    drop(held_b);
}
