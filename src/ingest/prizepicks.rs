//! Upstream envelope parsing.
//!
//! The provider speaks a JSON:API dialect: `{data: [...], included: [...]}`
//! where each projection resource points at player / league / stat_type
//! resources in `included`. Rows that fail validation are reported as
//! conversion errors (and quarantined by the caller), never silently dropped
//! and never served.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::models::{normalize_stat_type, League, Projection, ProjectionSource, ProjectionStatus};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Vec<Resource>,
    #[serde(default)]
    included: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: Value,
    #[serde(default)]
    relationships: Value,
}

impl Resource {
    fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Relationship id, e.g. `relationships.new_player.data.id`.
    fn rel_id(&self, name: &str) -> Option<&str> {
        self.relationships
            .get(name)
            .and_then(|r| r.get("data"))
            .and_then(|d| d.get("id"))
            .and_then(Value::as_str)
    }
}

/// A row the upstream sent that we refuse to store as a projection.
#[derive(Debug, Clone)]
pub struct ConversionError {
    pub projection_id: Option<String>,
    pub league_id: Option<String>,
    pub reason: String,
    pub raw: Value,
}

#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub projections: Vec<Projection>,
    pub conversion_errors: Vec<ConversionError>,
}

/// Parse a projections envelope for one league. `league_id_hint` is the id
/// the request was made with; it backstops rows whose league relationship is
/// missing.
pub fn parse_projections(
    body: &Value,
    league_id_hint: &str,
    fetched_at: DateTime<Utc>,
    source: ProjectionSource,
) -> ParsedBatch {
    let envelope: Envelope = match serde_json::from_value(body.clone()) {
        Ok(e) => e,
        Err(e) => {
            return ParsedBatch {
                projections: Vec::new(),
                conversion_errors: vec![ConversionError {
                    projection_id: None,
                    league_id: Some(league_id_hint.to_string()),
                    reason: format!("envelope shape: {e}"),
                    raw: truncate_raw(body),
                }],
            }
        }
    };

    let mut players: HashMap<&str, &Resource> = HashMap::new();
    let mut leagues: HashMap<&str, &Resource> = HashMap::new();
    let mut stat_types: HashMap<&str, &Resource> = HashMap::new();
    for inc in &envelope.included {
        match inc.kind.as_str() {
            "new_player" => {
                players.insert(inc.id.as_str(), inc);
            }
            "league" => {
                leagues.insert(inc.id.as_str(), inc);
            }
            "stat_type" => {
                stat_types.insert(inc.id.as_str(), inc);
            }
            _ => {}
        }
    }

    let mut batch = ParsedBatch::default();
    for res in &envelope.data {
        if res.kind != "projection" {
            continue;
        }
        match convert_projection(
            res,
            &players,
            &leagues,
            &stat_types,
            league_id_hint,
            fetched_at,
            source,
        ) {
            Ok(p) => batch.projections.push(p),
            Err(reason) => batch.conversion_errors.push(ConversionError {
                projection_id: Some(res.id.clone()),
                league_id: Some(league_id_hint.to_string()),
                reason,
                raw: truncate_raw(&res.attributes),
            }),
        }
    }
    batch
}

fn convert_projection(
    res: &Resource,
    players: &HashMap<&str, &Resource>,
    leagues: &HashMap<&str, &Resource>,
    stat_types: &HashMap<&str, &Resource>,
    league_id_hint: &str,
    fetched_at: DateTime<Utc>,
    source: ProjectionSource,
) -> Result<Projection, String> {
    let line_score = parse_line_score(res.attributes.get("line_score"))?;

    let start_time = res
        .attr_str("start_time")
        .ok_or_else(|| "missing start_time".to_string())
        .and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| format!("unparseable start_time {s:?}: {e}"))
        })?;

    let status = res
        .attr_str("status")
        .map(ProjectionStatus::parse)
        .unwrap_or(ProjectionStatus::Unknown);

    let player = res.rel_id("new_player").and_then(|id| players.get(id));
    let player_name = player
        .and_then(|p| p.attr_str("display_name").or_else(|| p.attr_str("name")))
        .map(str::to_string);
    let team = player.and_then(|p| p.attr_str("team")).map(str::to_string);

    let league = res.rel_id("league").and_then(|id| leagues.get(id));
    let league_id = res
        .rel_id("league")
        .unwrap_or(league_id_hint)
        .to_string();
    let league_name = league.and_then(|l| l.attr_str("name")).map(str::to_string);

    // Prefer the attribute label; fall back to the related stat_type resource.
    let stat_type_raw = res
        .attr_str("stat_type")
        .map(str::to_string)
        .or_else(|| {
            res.rel_id("stat_type")
                .and_then(|id| stat_types.get(id))
                .and_then(|s| s.attr_str("name"))
                .map(str::to_string)
        })
        .ok_or_else(|| "missing stat_type".to_string())?;

    Ok(Projection {
        projection_id: res.id.clone(),
        league_id,
        league_name,
        player_id: res.rel_id("new_player").map(str::to_string),
        player_name,
        team,
        stat_type: normalize_stat_type(&stat_type_raw),
        line_score,
        start_time,
        status,
        source,
        fetched_at,
        updated_at: fetched_at,
        raw: res.attributes.clone(),
    })
}

/// The line arrives as a JSON number or a string numeric ("92.5"); both must
/// parse to a finite decimal or the row is quarantined.
fn parse_line_score(value: Option<&Value>) -> Result<f64, String> {
    let v = value.ok_or_else(|| "missing line_score".to_string())?;
    let parsed = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(f) if f.is_finite() => Ok(f),
        Some(f) => Err(format!("non-finite line_score {f}")),
        None => Err(format!("unparseable line_score {v}")),
    }
}

/// Parse the `/leagues` envelope into lookup entries.
pub fn parse_leagues(body: &Value) -> Vec<League> {
    let envelope: Envelope = match serde_json::from_value(body.clone()) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    envelope
        .data
        .iter()
        .filter(|r| r.kind == "league")
        .filter_map(|r| {
            let name = r.attr_str("name")?;
            Some(League {
                league_id: r.id.clone(),
                league_name: name.to_string(),
                active: r
                    .attributes
                    .get("active")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
            })
        })
        .collect()
}

/// Leagues walked before the first successful `/leagues` refresh.
pub const DEFAULT_LEAGUES: &[(&str, &str)] = &[
    ("2", "MLB"),
    ("3", "WNBA"),
    ("7", "NBA"),
    ("8", "NHL"),
    ("9", "NFL"),
    ("82", "SOCCER"),
];

fn truncate_raw(v: &Value) -> Value {
    // Keep a bounded sample for logs and quarantine rows.
    let s = v.to_string();
    if s.len() <= 2048 {
        v.clone()
    } else {
        let sample: String = s.chars().take(2048).collect();
        Value::String(format!("{sample}…"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_envelope() -> Value {
        json!({
            "data": [
                {
                    "type": "projection",
                    "id": "101",
                    "attributes": {
                        "line_score": 7.5,
                        "start_time": "2026-08-01T23:10:00Z",
                        "status": "pre_game",
                        "stat_type": "Pitcher Strikeouts"
                    },
                    "relationships": {
                        "new_player": {"data": {"type": "new_player", "id": "p9"}},
                        "league": {"data": {"type": "league", "id": "2"}}
                    }
                },
                {
                    "type": "projection",
                    "id": "102",
                    "attributes": {
                        "line_score": "92.5",
                        "start_time": "2026-08-02T00:00:00Z",
                        "status": "active",
                        "stat_type": "Points"
                    },
                    "relationships": {}
                },
                {
                    "type": "projection",
                    "id": "103",
                    "attributes": {
                        "start_time": "2026-08-02T00:00:00Z",
                        "status": "pre_game",
                        "stat_type": "Hits"
                    },
                    "relationships": {}
                }
            ],
            "included": [
                {
                    "type": "new_player",
                    "id": "p9",
                    "attributes": {"display_name": "Mookie Betts", "team": "LAD"}
                },
                {
                    "type": "league",
                    "id": "2",
                    "attributes": {"name": "MLB", "active": true}
                }
            ]
        })
    }

    #[test]
    fn parses_rows_and_resolves_included() {
        let batch = parse_projections(
            &sample_envelope(),
            "2",
            Utc::now(),
            ProjectionSource::UpstreamLive,
        );

        assert_eq!(batch.projections.len(), 2);
        let p = &batch.projections[0];
        assert_eq!(p.projection_id, "101");
        assert_eq!(p.player_name.as_deref(), Some("Mookie Betts"));
        assert_eq!(p.team.as_deref(), Some("LAD"));
        assert_eq!(p.league_name.as_deref(), Some("MLB"));
        assert_eq!(p.stat_type, "pitcher strikeouts");
        assert_eq!(p.status, ProjectionStatus::PreGame);
    }

    #[test]
    fn string_line_score_is_accepted() {
        let batch = parse_projections(
            &sample_envelope(),
            "2",
            Utc::now(),
            ProjectionSource::UpstreamLive,
        );
        let p = batch
            .projections
            .iter()
            .find(|p| p.projection_id == "102")
            .unwrap();
        assert_eq!(p.line_score, 92.5);
        // "active" is the historical label for pre-game board entries.
        assert_eq!(p.status, ProjectionStatus::PreGame);
    }

    #[test]
    fn missing_line_score_quarantines_only_that_row() {
        let batch = parse_projections(
            &sample_envelope(),
            "2",
            Utc::now(),
            ProjectionSource::UpstreamLive,
        );

        assert_eq!(batch.conversion_errors.len(), 1);
        let err = &batch.conversion_errors[0];
        assert_eq!(err.projection_id.as_deref(), Some("103"));
        assert!(err.reason.contains("line_score"));
        // The healthy rows in the same response are unaffected.
        assert_eq!(batch.projections.len(), 2);
    }

    #[test]
    fn garbage_envelope_is_one_conversion_error() {
        let batch = parse_projections(
            &json!({"data": "nope"}),
            "7",
            Utc::now(),
            ProjectionSource::UpstreamLive,
        );
        assert!(batch.projections.is_empty());
        assert_eq!(batch.conversion_errors.len(), 1);
        assert!(batch.conversion_errors[0].reason.contains("envelope"));
    }

    #[test]
    fn leagues_envelope_parses() {
        let body = json!({
            "data": [
                {"type": "league", "id": "7", "attributes": {"name": "NBA", "active": true}},
                {"type": "league", "id": "99", "attributes": {"name": "Dormant", "active": false}}
            ]
        });
        let leagues = parse_leagues(&body);
        assert_eq!(leagues.len(), 2);
        assert!(leagues[0].active);
        assert!(!leagues[1].active);
    }
}
