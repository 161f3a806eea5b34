//! Endpoint handlers and wire types.
//!
//! The serving contract favors 200-with-degraded over errors: 4xx is for
//! genuine client mistakes, 5xx only for storage unavailability.

use std::time::Duration;

use axum::{
    extract::{Json as AxumJson, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::api::AppState;
use crate::ensemble::manager::TrainingStatus;
use crate::explain::{Busy, ExplainRequest};
use crate::ingest::engine::LeagueIngest;
use crate::ingest::governor::GovernorSnapshot;
use crate::models::{Explanation, PredictionResult, Projection};
use crate::store::BettableFilter;

const DEFAULT_LIMIT: usize = 500;
const MAX_LIMIT: usize = 2000;
const DEFAULT_K: usize = 50;
/// Local LLMs are slow; chat gets a longer deadline than the rest.
const CHAT_DEADLINE: Duration = Duration::from_secs(30);
/// Cap on projections hydrated into one chat context.
const CHAT_CONTEXT_CAP: usize = 10;

// ── Wire types ──────────────────────────────────────────────────────────────

/// A projection as served to clients; `raw` only on request.
#[derive(Debug, Serialize)]
pub struct ApiProjection {
    pub projection_id: String,
    pub league_id: String,
    pub league_name: Option<String>,
    pub player_id: Option<String>,
    pub player_name: Option<String>,
    pub team: Option<String>,
    pub stat_type: String,
    pub line_score: f64,
    pub start_time: DateTime<Utc>,
    pub status: &'static str,
    pub source: &'static str,
    pub fetched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl ApiProjection {
    fn from_projection(p: &Projection, include_raw: bool) -> Self {
        Self {
            projection_id: p.projection_id.clone(),
            league_id: p.league_id.clone(),
            league_name: p.league_name.clone(),
            player_id: p.player_id.clone(),
            player_name: p.player_name.clone(),
            team: p.team.clone(),
            stat_type: p.stat_type.clone(),
            line_score: p.line_score,
            start_time: p.start_time,
            status: p.status.as_str(),
            source: p.source.as_str(),
            fetched_at: p.fetched_at,
            updated_at: p.updated_at,
            raw: include_raw.then(|| p.raw.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthIngestion {
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_ok: bool,
    pub degraded: bool,
    pub projections_total: i64,
    pub projections_last_24h: i64,
    pub oldest_fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HealthModels {
    pub ready_count: usize,
    pub total_count: usize,
    pub ensemble_accuracy: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct HealthLlm {
    pub available_models: Vec<String>,
    pub primary: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub port: u16,
    pub uptime_seconds: u64,
    pub ingestion: HealthIngestion,
    pub models: HealthModels,
    pub llm: HealthLlm,
}

#[derive(Debug, Serialize)]
pub struct IngestionStatusResponse {
    pub running: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_ok: bool,
    pub last_cycle_duration_ms: u64,
    pub degraded: bool,
    pub conversion_errors_total: u64,
    pub leagues: Vec<LeagueIngest>,
    pub rate_governor: GovernorSnapshot,
    pub cache: crate::ingest::cache::CacheStats,
}

#[derive(Debug, Deserialize)]
pub struct ProjectionsQuery {
    pub league_id: Option<String>,
    pub stat_type: Option<String>,
    pub player: Option<String>,
    pub limit: Option<usize>,
    pub include_raw: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ProjectionsResponse {
    pub success: bool,
    pub count: usize,
    pub projections: Vec<ApiProjection>,
    pub status: &'static str,
    pub oldest_fetched_at: Option<DateTime<Utc>>,
    pub conversion_errors: u64,
}

#[derive(Debug, Deserialize)]
pub struct EnhancedQuery {
    pub league_id: Option<String>,
    pub stat_type: Option<String>,
    pub player: Option<String>,
    pub limit: Option<usize>,
    pub k: Option<usize>,
    pub min_confidence: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct EnhancedPrediction {
    #[serde(flatten)]
    pub prediction: PredictionResult,
    pub projection: ApiProjection,
}

#[derive(Debug, Serialize)]
pub struct EnhancedResponse {
    pub success: bool,
    pub count: usize,
    pub predictions: Vec<EnhancedPrediction>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatContext {
    #[serde(default)]
    pub projection_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
    pub context: Option<ChatContext>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: Explanation,
    pub model_used: String,
    pub latency_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
}

fn storage_unavailable(e: anyhow::Error) -> (StatusCode, Json<ErrorBody>) {
    warn!(component = "api", kind = "storage", error = %e, "store unreachable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody {
            success: false,
            error: "storage_unavailable",
            message: "projection store is unreachable".to_string(),
        }),
    )
}

// ── Handlers ────────────────────────────────────────────────────────────────

/// Cheap and side-effect-free: the frontend discovery protocol probes this
/// across the port range.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let ingestion = state.ingestion.snapshot();
    let (stats_ok, stats) = match state.store.stats() {
        Ok(s) => (true, Some(s)),
        Err(e) => {
            warn!(component = "api", error = %e, "health stats read failed");
            (false, None)
        }
    };

    let cycle_failed = ingestion.last_cycle_at.is_some() && !ingestion.last_cycle_ok;
    let status = if !stats_ok || cycle_failed || ingestion.degraded {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        port: state.port(),
        uptime_seconds: state.uptime_seconds(),
        ingestion: HealthIngestion {
            last_cycle_at: ingestion.last_cycle_at,
            last_cycle_ok: ingestion.last_cycle_ok,
            degraded: ingestion.degraded,
            projections_total: stats.as_ref().map(|s| s.total).unwrap_or(0),
            projections_last_24h: stats.as_ref().map(|s| s.last_24h).unwrap_or(0),
            oldest_fetched_at: stats.as_ref().and_then(|s| s.oldest_fetched_at),
        },
        models: HealthModels {
            ready_count: state.manager.ready_count(),
            total_count: state.manager.total_count(),
            ensemble_accuracy: state.manager.ensemble_accuracy(),
        },
        llm: HealthLlm {
            available_models: state.explainer.available_models(),
            primary: state.explainer.primary_model(),
        },
    })
}

pub async fn status_training(State(state): State<AppState>) -> Json<TrainingStatus> {
    Json(state.manager.training_status())
}

pub async fn status_ingestion(State(state): State<AppState>) -> Json<IngestionStatusResponse> {
    let snapshot = state.ingestion.snapshot();
    Json(IngestionStatusResponse {
        running: snapshot.running,
        last_cycle_at: snapshot.last_cycle_at,
        last_cycle_ok: snapshot.last_cycle_ok,
        last_cycle_duration_ms: snapshot.last_cycle_duration_ms,
        degraded: snapshot.degraded,
        conversion_errors_total: snapshot.conversion_errors_total,
        leagues: snapshot.leagues,
        rate_governor: state.governor.snapshot(),
        cache: state.cache.stats(),
    })
}

/// The props board. Answers from the store only; staleness is reported, not
/// hidden, and upstream state never blocks this path.
pub async fn get_projections(
    State(state): State<AppState>,
    Query(query): Query<ProjectionsQuery>,
) -> Result<Json<ProjectionsResponse>, (StatusCode, Json<ErrorBody>)> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let include_raw = query.include_raw.unwrap_or(false);
    let filter = BettableFilter {
        league_id: query.league_id,
        stat_type: query.stat_type,
        player: query.player,
    };

    let now = Utc::now();
    let rows = state
        .store
        .get_bettable(now, limit, &filter)
        .map_err(storage_unavailable)?;

    let oldest_fetched_at = rows.iter().map(|p| p.fetched_at).min();
    let status = board_status(&rows, oldest_fetched_at, now, &state);

    Ok(Json(ProjectionsResponse {
        success: true,
        count: rows.len(),
        projections: rows
            .iter()
            .map(|p| ApiProjection::from_projection(p, include_raw))
            .collect(),
        status,
        oldest_fetched_at,
        conversion_errors: state.ingestion.conversion_errors_total(),
    }))
}

fn board_status(
    rows: &[Projection],
    oldest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    state: &AppState,
) -> &'static str {
    if rows.is_empty() {
        return "empty";
    }
    let threshold = chrono::Duration::from_std(state.config.stale_threshold)
        .unwrap_or_else(|_| chrono::Duration::seconds(900));
    match oldest {
        Some(o) if now - o > threshold => "stale",
        _ => "fresh",
    }
}

/// Ranked predictions over the current board. Honors the per-request
/// deadline inside the manager; over-deadline responses come back partial
/// with `degraded=true`.
pub async fn get_enhanced_predictions(
    State(state): State<AppState>,
    Query(query): Query<EnhancedQuery>,
) -> Result<Json<EnhancedResponse>, (StatusCode, Json<ErrorBody>)> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let k = query.k.unwrap_or(DEFAULT_K).min(MAX_LIMIT);
    let filter = BettableFilter {
        league_id: query.league_id,
        stat_type: query.stat_type,
        player: query.player,
    };

    let rows = state
        .store
        .get_bettable(Utc::now(), limit, &filter)
        .map_err(storage_unavailable)?;

    let generation = state.store.generation();
    let ranked = state
        .manager
        .clone()
        .rank(rows.clone(), k, query.min_confidence, generation)
        .await;

    let by_id: std::collections::HashMap<&str, &Projection> = rows
        .iter()
        .map(|p| (p.projection_id.as_str(), p))
        .collect();

    let predictions: Vec<EnhancedPrediction> = ranked
        .predictions
        .into_iter()
        .filter_map(|prediction| {
            by_id.get(prediction.projection_id.as_str()).map(|p| {
                EnhancedPrediction {
                    projection: ApiProjection::from_projection(p, false),
                    prediction,
                }
            })
        })
        .collect();

    Ok(Json(EnhancedResponse {
        success: true,
        count: predictions.len(),
        predictions,
        degraded: ranked.degraded,
        degraded_reason: ranked.degraded_reason,
    }))
}

/// PropOllama chat. LLM unavailability degrades to the deterministic
/// fallback and still answers 200; only queue saturation is a 503.
pub async fn propollama_chat(
    State(state): State<AppState>,
    AxumJson(request): AxumJson<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ErrorBody>)> {
    if request.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                success: false,
                error: "empty_message",
                message: "message must not be empty".to_string(),
            }),
        ));
    }

    let started = std::time::Instant::now();
    let session_id = request
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ids: Vec<String> = request
        .context
        .map(|c| c.projection_ids)
        .unwrap_or_default()
        .into_iter()
        .take(CHAT_CONTEXT_CAP)
        .collect();

    let projections = match state.store.get_by_ids(&ids) {
        Ok(p) => p,
        Err(e) => {
            // Chat can proceed without context; note it and continue.
            warn!(component = "api", error = %e, "chat context lookup failed");
            Vec::new()
        }
    };
    let predictions = if projections.is_empty() {
        Vec::new()
    } else {
        state.manager.predict(&projections)
    };

    let explain = state.explainer.explain(ExplainRequest {
        projections: &projections,
        predictions: &predictions,
        question: Some(&request.message),
        session_id: Some(&session_id),
    });

    let reply = match tokio::time::timeout(CHAT_DEADLINE, explain).await {
        Ok(Ok(explanation)) => explanation,
        Ok(Err(Busy)) => {
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    success: false,
                    error: "degraded",
                    message: "explanation queue is saturated, retry shortly".to_string(),
                }),
            ));
        }
        Err(_) => {
            warn!(component = "api", kind = "llm_failure", "chat deadline hit");
            state
                .explainer
                .fallback_for(projections.first(), predictions.first())
        }
    };

    let model_used = reply.model_used.clone();
    Ok(Json(ChatResponse {
        session_id,
        reply,
        model_used,
        latency_ms: started.elapsed().as_millis() as u64,
    }))
}
