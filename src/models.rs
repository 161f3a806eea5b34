use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Upstream projection status.
///
/// `pre_game` and `in_progress` are both bettable; anything the upstream
/// sends that we do not recognize maps to `Unknown` and is kept (not served).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    PreGame,
    InProgress,
    Final,
    Void,
    Unknown,
}

impl ProjectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionStatus::PreGame => "pre_game",
            ProjectionStatus::InProgress => "in_progress",
            ProjectionStatus::Final => "final",
            ProjectionStatus::Void => "void",
            ProjectionStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            // The upstream uses both "pre_game" and "active" for not-yet-started
            // board entries. Both count as bettable.
            "pre_game" | "active" => ProjectionStatus::PreGame,
            "in_progress" | "live" => ProjectionStatus::InProgress,
            "final" | "settled" | "completed" => ProjectionStatus::Final,
            "void" | "refunded" | "cancelled" | "canceled" => ProjectionStatus::Void,
            _ => ProjectionStatus::Unknown,
        }
    }

    pub fn is_bettable(&self) -> bool {
        matches!(self, ProjectionStatus::PreGame | ProjectionStatus::InProgress)
    }
}

/// Provenance of a projection at the moment it was materialized into a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionSource {
    UpstreamLive,
    UpstreamCached,
    StoreOnly,
}

impl ProjectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionSource::UpstreamLive => "upstream_live",
            ProjectionSource::UpstreamCached => "upstream_cached",
            ProjectionSource::StoreOnly => "store_only",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "upstream_live" => ProjectionSource::UpstreamLive,
            "upstream_cached" => ProjectionSource::UpstreamCached,
            _ => ProjectionSource::StoreOnly,
        }
    }
}

/// One player-prop projection: player, stat, line, game start.
///
/// `projection_id` is the upstream's opaque id and is unique in the current
/// view; the store deduplicates by keeping the most recent `fetched_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    pub projection_id: String,
    pub league_id: String,
    pub league_name: Option<String>,
    pub player_id: Option<String>,
    pub player_name: Option<String>,
    pub team: Option<String>,
    /// Normalized lowercase for matching, e.g. "pitcher strikeouts".
    pub stat_type: String,
    pub line_score: f64,
    pub start_time: DateTime<Utc>,
    pub status: ProjectionStatus,
    pub source: ProjectionSource,
    pub fetched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Original upstream JSON fragment, kept for audit/reprocessing.
    #[serde(skip_serializing, default)]
    pub raw: serde_json::Value,
}

/// Grace applied to `start_time` when deciding bettability, to tolerate
/// clock skew between us, the upstream, and the venue.
pub const BETTABLE_GRACE_MINUTES: i64 = 15;

impl Projection {
    pub fn is_bettable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_bettable()
            && self.start_time >= now - Duration::minutes(BETTABLE_GRACE_MINUTES)
    }

    /// True if any scalar field differs from `other` (ignores `raw`,
    /// `fetched_at`, `updated_at`, `source`). Drives `updated_at` semantics.
    pub fn scalars_differ(&self, other: &Projection) -> bool {
        self.league_id != other.league_id
            || self.league_name != other.league_name
            || self.player_id != other.player_id
            || self.player_name != other.player_name
            || self.team != other.team
            || self.stat_type != other.stat_type
            || (self.line_score - other.line_score).abs() > f64::EPSILON
            || self.start_time != other.start_time
            || self.status != other.status
    }
}

/// Normalize an upstream stat-type label for matching: trimmed, lowercase,
/// single-spaced. Unknown vocabulary is kept as-is, never dropped.
pub fn normalize_stat_type(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// League lookup entry. `active` controls whether the ingestion engine
/// walks the league.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct League {
    pub league_id: String,
    pub league_name: String,
    pub active: bool,
}

/// Final call for one projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Over,
    Under,
    Pass,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Over => "over",
            Recommendation::Under => "under",
            Recommendation::Pass => "pass",
        }
    }
}

/// Per-scorer contribution recorded in a `PredictionResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerScorer {
    pub scorer_name: String,
    pub value: f64,
    pub weight_used: f64,
}

/// Output of the ensemble for a single projection. Computed on demand,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub projection_id: String,
    pub ensemble_prediction: f64,
    pub confidence: f64,
    pub expected_value: f64,
    pub recommendation: Recommendation,
    /// Feature-name → contribution; also carries structured notes such as
    /// `{"reason": "no_scorers_ready"}` on degraded results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shap_values: Option<BTreeMap<String, serde_json::Value>>,
    pub per_scorer: Vec<PerScorer>,
}

/// One structured factor in an explanation, derived from SHAP contributions
/// or the heuristic fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredFactor {
    pub factor: String,
    pub impact: f64,
    pub direction: String,
}

/// Natural-language analysis produced by the explanation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub text: String,
    pub structured_factors: Vec<StructuredFactor>,
    pub model_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn projection(status: ProjectionStatus, start_offset_min: i64) -> Projection {
        let now = Utc::now();
        Projection {
            projection_id: "p1".to_string(),
            league_id: "7".to_string(),
            league_name: Some("NBA".to_string()),
            player_id: Some("pl1".to_string()),
            player_name: Some("Test Player".to_string()),
            team: Some("TST".to_string()),
            stat_type: "points".to_string(),
            line_score: 25.5,
            start_time: now + Duration::minutes(start_offset_min),
            status,
            source: ProjectionSource::StoreOnly,
            fetched_at: now,
            updated_at: now,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn pre_game_and_in_progress_are_bettable() {
        let now = Utc::now();
        assert!(projection(ProjectionStatus::PreGame, 60).is_bettable(now));
        assert!(projection(ProjectionStatus::InProgress, -5).is_bettable(now));
        assert!(!projection(ProjectionStatus::Final, 60).is_bettable(now));
        assert!(!projection(ProjectionStatus::Void, 60).is_bettable(now));
    }

    #[test]
    fn grace_boundary_is_inclusive() {
        let now = Utc::now();
        let mut p = projection(ProjectionStatus::PreGame, 0);
        p.start_time = now - Duration::minutes(BETTABLE_GRACE_MINUTES);
        assert!(p.is_bettable(now));
        p.start_time = now - Duration::minutes(BETTABLE_GRACE_MINUTES) - Duration::seconds(1);
        assert!(!p.is_bettable(now));
    }

    #[test]
    fn status_parse_treats_active_as_pre_game() {
        // Historical bug: only "active" counted as bettable and the board
        // looked empty. Both labels must land on PreGame.
        assert_eq!(ProjectionStatus::parse("active"), ProjectionStatus::PreGame);
        assert_eq!(ProjectionStatus::parse("pre_game"), ProjectionStatus::PreGame);
        assert_eq!(ProjectionStatus::parse("LIVE"), ProjectionStatus::InProgress);
        assert_eq!(ProjectionStatus::parse("weird"), ProjectionStatus::Unknown);
    }

    #[test]
    fn normalize_stat_type_collapses_whitespace() {
        assert_eq!(normalize_stat_type("  Pitcher  Strikeouts "), "pitcher strikeouts");
        assert_eq!(normalize_stat_type("Points"), "points");
    }

    #[test]
    fn scalars_differ_ignores_fetch_metadata() {
        let a = projection(ProjectionStatus::PreGame, 60);
        let mut b = a.clone();
        b.fetched_at = b.fetched_at + Duration::minutes(10);
        b.source = ProjectionSource::UpstreamLive;
        assert!(!a.scalars_differ(&b));

        b.line_score = 26.5;
        assert!(a.scalars_differ(&b));
    }
}
