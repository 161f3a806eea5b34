//! Explanation service ("PropOllama").
//!
//! Turns a projection plus its ensemble output into a structured analysis via
//! the local LLM, with a deterministic fallback built from the structured
//! fields alone. LLM failure is never surfaced as an HTTP error; only
//! backpressure is.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::explain::ollama::OllamaClient;
use crate::models::{Explanation, PredictionResult, Projection, StructuredFactor};

#[derive(Debug, Clone)]
pub struct ExplanationConfig {
    pub model_preference: Vec<String>,
    /// Local LLMs are slow; this bounds one generation.
    pub llm_timeout: Duration,
    /// Concurrent in-flight generations; local models are memory-bound.
    pub generation_concurrency: usize,
    /// Beyond this many callers waiting, new requests are rejected instead of
    /// queueing indefinitely.
    pub queue_threshold: usize,
    /// Messages kept per session ring buffer.
    pub session_capacity: usize,
    pub session_ttl: Duration,
}

impl Default for ExplanationConfig {
    fn default() -> Self {
        Self {
            model_preference: vec!["llama3:8b".into(), "llama3".into(), "mistral".into()],
            llm_timeout: Duration::from_secs(60),
            generation_concurrency: 2,
            queue_threshold: 8,
            session_capacity: 8,
            session_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// The one error the chat endpoint maps to a non-200: too many callers
/// already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

struct SessionHistory {
    turns: VecDeque<(String, String)>,
    last_active: Instant,
}

struct Session {
    // Serializes concurrent requests for the same session id.
    history: AsyncMutex<SessionHistory>,
}

pub struct ExplanationService {
    client: OllamaClient,
    cfg: ExplanationConfig,
    primary: RwLock<Option<String>>,
    available: RwLock<Vec<String>>,
    sessions: parking_lot::Mutex<HashMap<String, Arc<Session>>>,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
}

pub struct ExplainRequest<'a> {
    pub projections: &'a [Projection],
    pub predictions: &'a [PredictionResult],
    pub question: Option<&'a str>,
    pub session_id: Option<&'a str>,
}

impl ExplanationService {
    pub fn new(client: OllamaClient, cfg: ExplanationConfig) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.generation_concurrency.max(1)));
        Self {
            client,
            cfg,
            primary: RwLock::new(None),
            available: RwLock::new(Vec::new()),
            sessions: parking_lot::Mutex::new(HashMap::new()),
            permits,
            queued: AtomicUsize::new(0),
        }
    }

    pub fn available_models(&self) -> Vec<String> {
        self.available.read().clone()
    }

    pub fn primary_model(&self) -> Option<String> {
        self.primary.read().clone()
    }

    /// Ask the model server what it has and pick a primary by the preference
    /// list: exact name first, then prefix match, then whatever is installed.
    pub async fn discover_models(&self, timeout: Duration) {
        let models = match self.client.list_models(timeout).await {
            Ok(m) => m,
            Err(e) => {
                debug!(component = "explain", error = %e, "model discovery failed");
                return;
            }
        };

        let primary = self
            .cfg
            .model_preference
            .iter()
            .find_map(|pref| models.iter().find(|m| *m == pref))
            .or_else(|| {
                self.cfg
                    .model_preference
                    .iter()
                    .find_map(|pref| models.iter().find(|m| m.starts_with(pref.as_str())))
            })
            .or_else(|| models.first())
            .cloned();

        if let Some(model) = &primary {
            info!(component = "explain", model, "primary generation model selected");
        }
        *self.available.write() = models;
        *self.primary.write() = primary;
    }

    /// Produce an explanation. All LLM failures degrade to the deterministic
    /// fallback; `Err(Busy)` is returned only when the queue is saturated.
    pub async fn explain(&self, req: ExplainRequest<'_>) -> Result<Explanation, Busy> {
        let Some(primary) = self.projection_primary(&req) else {
            // Nothing to explain against: answer from the question alone.
            return self.generate_or_fallback(None, None, &req).await;
        };
        let prediction = req
            .predictions
            .iter()
            .find(|p| p.projection_id == primary.projection_id);

        self.generate_or_fallback(Some(primary), prediction, &req)
            .await
    }

    fn projection_primary<'a>(&self, req: &ExplainRequest<'a>) -> Option<&'a Projection> {
        req.projections.first()
    }

    async fn generate_or_fallback(
        &self,
        projection: Option<&Projection>,
        prediction: Option<&PredictionResult>,
        req: &ExplainRequest<'_>,
    ) -> Result<Explanation, Busy> {
        // Backpressure check happens before anything queues.
        if self.queued.load(Ordering::Acquire) >= self.cfg.queue_threshold {
            return Err(Busy);
        }

        let session = req.session_id.map(|id| self.session(id));
        // Hold the per-session lock across the generation so same-session
        // requests queue rather than race.
        let mut history_guard = match &session {
            Some(s) => Some(s.history.lock().await),
            None => None,
        };
        let history: Vec<(String, String)> = history_guard
            .as_ref()
            .map(|h| h.turns.iter().cloned().collect())
            .unwrap_or_default();

        let explanation = match self.primary_model() {
            None => {
                // One cheap discovery attempt before giving up on the model.
                self.discover_models(Duration::from_secs(2)).await;
                match self.primary_model() {
                    None => self.fallback(projection, prediction),
                    Some(model) => {
                        self.run_generation(&model, projection, prediction, req, &history)
                            .await?
                    }
                }
            }
            Some(model) => {
                self.run_generation(&model, projection, prediction, req, &history)
                    .await?
            }
        };

        if let Some(h) = history_guard.as_mut() {
            if let Some(q) = req.question {
                push_turn(h, self.cfg.session_capacity, "user", q);
            }
            push_turn(h, self.cfg.session_capacity, "assistant", &explanation.text);
            h.last_active = Instant::now();
        }

        Ok(explanation)
    }

    async fn run_generation(
        &self,
        model: &str,
        projection: Option<&Projection>,
        prediction: Option<&PredictionResult>,
        req: &ExplainRequest<'_>,
        history: &[(String, String)],
    ) -> Result<Explanation, Busy> {
        self.queued.fetch_add(1, Ordering::AcqRel);
        let permit = self.permits.clone().acquire_owned().await;
        self.queued.fetch_sub(1, Ordering::AcqRel);
        let _permit = match permit {
            Ok(p) => p,
            Err(_) => return Ok(self.fallback(projection, prediction)),
        };

        let prompt = build_prompt(projection, prediction, req.projections, req.question, history);
        match self.client.generate(model, &prompt, self.cfg.llm_timeout).await {
            Ok(text) if !text.trim().is_empty() => {
                let (narrative, factors) = parse_model_response(&text);
                Ok(Explanation {
                    text: narrative,
                    structured_factors: factors,
                    model_used: model.to_string(),
                    confidence: prediction.map(|p| p.confidence),
                })
            }
            Ok(_) => {
                warn!(component = "explain", model, "model returned empty response");
                Ok(self.fallback(projection, prediction))
            }
            Err(e) => {
                warn!(component = "explain", kind = "llm_failure", model, error = %e, "generation failed");
                Ok(self.fallback(projection, prediction))
            }
        }
    }

    /// Fallback shaping for callers that hit their own deadline while a
    /// generation was still in flight.
    pub fn fallback_for(
        &self,
        projection: Option<&Projection>,
        prediction: Option<&PredictionResult>,
    ) -> Explanation {
        self.fallback(projection, prediction)
    }

    /// Deterministic explanation from the structured fields alone. No
    /// invented facts: only numbers we already hold appear in the text.
    fn fallback(
        &self,
        projection: Option<&Projection>,
        prediction: Option<&PredictionResult>,
    ) -> Explanation {
        let Some(p) = projection else {
            return Explanation {
                text: "No projection context is available for this question. \
                       Ask about a specific prop on the current board."
                    .to_string(),
                structured_factors: Vec::new(),
                model_used: "fallback".to_string(),
                confidence: None,
            };
        };

        let player = p.player_name.as_deref().unwrap_or("this player");
        let league = p.league_name.as_deref().unwrap_or(&p.league_id);
        let mut text = format!(
            "{player} has a {stat} line of {line} in {league}, starting at {start}.",
            stat = p.stat_type,
            line = p.line_score,
            start = p.start_time.to_rfc3339(),
        );

        let mut factors = Vec::new();
        if let Some(pred) = prediction {
            text.push_str(&format!(
                " The ensemble projects {:.2} with {:.0}% confidence and recommends {} \
                 (expected value {:+.3} per unit).",
                pred.ensemble_prediction,
                pred.confidence * 100.0,
                pred.recommendation.as_str(),
                pred.expected_value,
            ));
            factors = factors_from_prediction(pred);
        } else {
            text.push_str(" No model output is available yet; scorers may still be training.");
        }

        Explanation {
            text,
            structured_factors: factors,
            model_used: "fallback".to_string(),
            confidence: prediction.map(|p| p.confidence),
        }
    }

    fn session(&self, id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Session {
                    history: AsyncMutex::new(SessionHistory {
                        turns: VecDeque::new(),
                        last_active: Instant::now(),
                    }),
                })
            })
            .clone()
    }

    /// Drop sessions idle past the TTL. Returns how many were removed.
    pub fn sweep_sessions(&self) -> usize {
        let ttl = self.cfg.session_ttl;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| match s.history.try_lock() {
            Ok(h) => h.last_active.elapsed() < ttl,
            // In use right now; clearly not idle.
            Err(_) => true,
        });
        before - sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn push_turn(history: &mut SessionHistory, capacity: usize, role: &str, text: &str) {
    history.turns.push_back((role.to_string(), text.to_string()));
    while history.turns.len() > capacity {
        history.turns.pop_front();
    }
}

fn build_prompt(
    projection: Option<&Projection>,
    prediction: Option<&PredictionResult>,
    context: &[Projection],
    question: Option<&str>,
    history: &[(String, String)],
) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(
        "You are a sports betting analyst. Reason only about the numbers supplied below \
         and general sports context. Do not invent statistics and do not claim to have \
         looked anything up. Answer with a short narrative paragraph followed by a \
         bulleted list of the key factors.\n\n",
    );

    if let Some(p) = projection {
        prompt.push_str(&format!(
            "Projection:\n- player: {}\n- team: {}\n- league: {}\n- stat: {}\n- line: {}\n- start: {}\n",
            p.player_name.as_deref().unwrap_or("unknown"),
            p.team.as_deref().unwrap_or("unknown"),
            p.league_name.as_deref().unwrap_or(&p.league_id),
            p.stat_type,
            p.line_score,
            p.start_time.to_rfc3339(),
        ));
    }

    if let Some(pred) = prediction {
        prompt.push_str(&format!(
            "\nEnsemble output:\n- prediction: {:.3}\n- confidence: {:.3}\n- recommendation: {}\n- expected_value: {:+.4}\n",
            pred.ensemble_prediction,
            pred.confidence,
            pred.recommendation.as_str(),
            pred.expected_value,
        ));
        if let Some(shap) = &pred.shap_values {
            let mut top: Vec<(&String, f64)> = shap
                .iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k, f)))
                .collect();
            top.sort_by(|a, b| {
                b.1.abs()
                    .partial_cmp(&a.1.abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            if !top.is_empty() {
                prompt.push_str("\nTop factors (SHAP):\n");
                for (name, value) in top.into_iter().take(5) {
                    prompt.push_str(&format!("- {name}: {value:+.4}\n"));
                }
            }
        }
    }

    // Further props from the request context, so the model can compare.
    let others: Vec<&Projection> = context
        .iter()
        .filter(|c| projection.map_or(true, |p| c.projection_id != p.projection_id))
        .collect();
    if !others.is_empty() {
        prompt.push_str("\nOther props in this conversation:\n");
        for c in others.iter().take(9) {
            prompt.push_str(&format!(
                "- {} {} {} (starts {})\n",
                c.player_name.as_deref().unwrap_or("unknown"),
                c.stat_type,
                c.line_score,
                c.start_time.to_rfc3339(),
            ));
        }
    }

    if !history.is_empty() {
        prompt.push_str("\nConversation so far:\n");
        for (role, text) in history {
            prompt.push_str(&format!("{role}: {text}\n"));
        }
    }

    prompt.push_str("\nQuestion: ");
    prompt.push_str(question.unwrap_or("Is this prop worth a bet, and which side?"));
    prompt.push('\n');
    prompt
}

/// Best-effort parse of the model output into a narrative paragraph and
/// bullet factors; when the shape does not match, the whole response becomes
/// the narrative.
fn parse_model_response(text: &str) -> (String, Vec<StructuredFactor>) {
    let mut narrative_lines: Vec<&str> = Vec::new();
    let mut factors: Vec<StructuredFactor> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        let bullet = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
            .or_else(|| trimmed.strip_prefix("• "));

        match bullet {
            Some(item) if !item.is_empty() => {
                let lowered = item.to_lowercase();
                let direction = if ["under", "negative", "down", "against", "concern"]
                    .iter()
                    .any(|w| lowered.contains(w))
                {
                    "negative"
                } else {
                    "positive"
                };
                let impact = first_number(item).unwrap_or(1.0 / (factors.len() + 1) as f64);
                factors.push(StructuredFactor {
                    factor: item.trim_end_matches(['.', ':']).to_string(),
                    impact,
                    direction: direction.to_string(),
                });
            }
            _ => {
                if !trimmed.is_empty() && factors.is_empty() {
                    narrative_lines.push(trimmed);
                }
            }
        }
    }

    let narrative = narrative_lines.join(" ");
    if narrative.is_empty() {
        (text.trim().to_string(), factors)
    } else {
        (narrative, factors)
    }
}

fn first_number(s: &str) -> Option<f64> {
    let mut start = None;
    for (i, c) in s.char_indices() {
        if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(b) = start {
            if let Ok(f) = s[b..i].parse::<f64>() {
                return Some(f);
            }
            start = None;
        }
    }
    start.and_then(|b| s[b..].parse::<f64>().ok())
}

fn factors_from_prediction(pred: &PredictionResult) -> Vec<StructuredFactor> {
    let mut factors: Vec<StructuredFactor> = pred
        .shap_values
        .iter()
        .flat_map(|shap| shap.iter())
        .filter_map(|(name, value)| {
            let impact = value.as_f64()?;
            Some(StructuredFactor {
                factor: name.clone(),
                impact,
                direction: if impact >= 0.0 { "positive" } else { "negative" }.to_string(),
            })
        })
        .collect();

    factors.sort_by(|a, b| {
        b.impact
            .abs()
            .partial_cmp(&a.impact.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    factors.truncate(3);

    if factors.is_empty() {
        for s in pred.per_scorer.iter().take(3) {
            factors.push(StructuredFactor {
                factor: format!("{} scorer output", s.scorer_name),
                impact: s.weight_used,
                direction: "positive".to_string(),
            });
        }
    }
    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        PerScorer, ProjectionSource, ProjectionStatus, Recommendation,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn service(queue_threshold: usize) -> ExplanationService {
        let client = OllamaClient::new(
            reqwest::Client::new(),
            // Nothing listens here: every generation fails fast.
            "http://127.0.0.1:9".to_string(),
        );
        let cfg = ExplanationConfig {
            queue_threshold,
            llm_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        ExplanationService::new(client, cfg)
    }

    fn projection() -> Projection {
        Projection {
            projection_id: "mlb-1".to_string(),
            league_id: "2".to_string(),
            league_name: Some("MLB".to_string()),
            player_id: Some("p9".to_string()),
            player_name: Some("Mookie Betts".to_string()),
            team: Some("LAD".to_string()),
            stat_type: "hits".to_string(),
            line_score: 1.5,
            start_time: Utc::now(),
            status: ProjectionStatus::PreGame,
            source: ProjectionSource::StoreOnly,
            fetched_at: Utc::now(),
            updated_at: Utc::now(),
            raw: serde_json::Value::Null,
        }
    }

    fn prediction() -> PredictionResult {
        let mut shap = BTreeMap::new();
        shap.insert("recent_form".to_string(), serde_json::Value::from(0.4));
        shap.insert("opponent_strength".to_string(), serde_json::Value::from(-0.2));
        PredictionResult {
            projection_id: "mlb-1".to_string(),
            ensemble_prediction: 1.8,
            confidence: 0.7,
            expected_value: 0.05,
            recommendation: Recommendation::Over,
            shap_values: Some(shap),
            per_scorer: vec![PerScorer {
                scorer_name: "recent_form".to_string(),
                value: 1.8,
                weight_used: 1.0,
            }],
        }
    }

    #[tokio::test]
    async fn offline_llm_degrades_to_fallback() {
        let svc = service(8);
        let projections = [projection()];
        let predictions = [prediction()];

        let started = std::time::Instant::now();
        let explanation = svc
            .explain(ExplainRequest {
                projections: &projections,
                predictions: &predictions,
                question: Some("why is the Mookie Betts hits prop interesting?"),
                session_id: None,
            })
            .await
            .unwrap();

        assert_eq!(explanation.model_used, "fallback");
        assert!(explanation.text.contains("Mookie Betts"));
        assert!(explanation.text.contains("hits"));
        assert!(explanation.text.contains("1.5"));
        assert_eq!(explanation.confidence, Some(0.7));
        assert!(!explanation.structured_factors.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn saturated_queue_rejects_immediately() {
        let svc = service(0);
        let projections = [projection()];
        let result = svc
            .explain(ExplainRequest {
                projections: &projections,
                predictions: &[],
                question: Some("anything"),
                session_id: None,
            })
            .await;
        // queue_threshold of zero means no caller may wait.
        assert_eq!(result.unwrap_err(), Busy);
    }

    #[tokio::test]
    async fn session_ring_buffer_is_bounded() {
        let svc = service(8);
        let projections = [projection()];

        for i in 0..10 {
            let q = format!("question {i}");
            let _ = svc
                .explain(ExplainRequest {
                    projections: &projections,
                    predictions: &[],
                    question: Some(&q),
                    session_id: Some("s-1"),
                })
                .await
                .unwrap();
        }

        let session = svc.session("s-1");
        let history = session.history.lock().await;
        assert_eq!(history.turns.len(), 8);
        // Oldest turns were evicted.
        assert!(history.turns.iter().all(|(_, t)| !t.contains("question 0")));
    }

    #[tokio::test]
    async fn sweep_drops_idle_sessions() {
        let svc = service(8);
        let projections = [projection()];
        let _ = svc
            .explain(ExplainRequest {
                projections: &projections,
                predictions: &[],
                question: Some("hello"),
                session_id: Some("stale"),
            })
            .await;
        assert_eq!(svc.session_count(), 1);
        // TTL has not elapsed; nothing is swept.
        assert_eq!(svc.sweep_sessions(), 0);
        assert_eq!(svc.session_count(), 1);
    }

    #[test]
    fn parse_extracts_narrative_and_bullets() {
        let text = "The over looks strong here given the matchup.\n\n\
                    - Recent form trending up 0.4\n\
                    - Opponent bullpen is a concern\n";
        let (narrative, factors) = parse_model_response(text);
        assert!(narrative.starts_with("The over looks strong"));
        assert_eq!(factors.len(), 2);
        assert_eq!(factors[0].impact, 0.4);
        assert_eq!(factors[0].direction, "positive");
        assert_eq!(factors[1].direction, "negative");
    }

    #[test]
    fn unparsable_response_becomes_plain_text() {
        let (narrative, factors) = parse_model_response("");
        assert_eq!(narrative, "");
        assert!(factors.is_empty());

        let (narrative, factors) = parse_model_response("just one line, no bullets");
        assert_eq!(narrative, "just one line, no bullets");
        assert!(factors.is_empty());
    }

    #[test]
    fn prompt_lists_other_context_props_for_comparison() {
        let p = projection();
        let mut other = projection();
        other.projection_id = "mlb-2".to_string();
        other.player_name = Some("Freddie Freeman".to_string());
        let context = vec![p.clone(), other];

        let prompt = build_prompt(Some(&p), None, &context, Some("compare these two"), &[]);
        assert!(prompt.contains("Other props in this conversation"));
        assert!(prompt.contains("Freddie Freeman"));
        // The primary prop is not repeated in the comparison list.
        assert_eq!(prompt.matches("Mookie Betts").count(), 1);
    }

    #[test]
    fn prompt_contains_only_supplied_numbers() {
        let p = projection();
        let pred = prediction();
        let prompt = build_prompt(Some(&p), Some(&pred), &[], Some("thoughts?"), &[]);
        assert!(prompt.contains("Mookie Betts"));
        assert!(prompt.contains("1.5"));
        assert!(prompt.contains("recommendation: over"));
        assert!(prompt.contains("Do not invent statistics"));
    }
}
