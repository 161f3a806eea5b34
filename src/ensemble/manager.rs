//! Ensemble manager.
//!
//! Owns the scorer registry, launches their background training, and turns
//! the current projections into ranked predictions on demand. Weights are
//! proportional to measured accuracy among ready scorers of one kind; an
//! ensemble never mixes predicted-value and probability scorers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use statrs::function::erf::erf;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ensemble::scorer::{stable_hash, Scorer, ScorerKind};
use crate::models::{PerScorer, PredictionResult, Projection, Recommendation};

/// Payout per unit staked at the assumed symmetric -110 line.
const PAYOUT_PER_UNIT: f64 = 100.0 / 110.0;

const PREDICT_CHUNK: usize = 32;

#[derive(Debug, Clone)]
pub struct ModelManagerConfig {
    /// Recommendation margin as a fraction of the stat sigma, floored.
    pub margin_sigma_frac: f64,
    pub min_margin: f64,
    /// Dead zone around 0.5 for probability ensembles.
    pub probability_tau: f64,
    /// Confidence penalty per unit of normalized weighted variance.
    pub dispersion_penalty: f64,
    /// Below this many ready scorers the enhanced endpoint reports degraded.
    pub min_ready_scorers: usize,
    pub deadline: Duration,
    pub prediction_cache_ttl: Duration,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            margin_sigma_frac: 0.25,
            min_margin: 0.5,
            probability_tau: 0.05,
            dispersion_penalty: 1.0,
            min_ready_scorers: 3,
            deadline: Duration::from_secs(10),
            prediction_cache_ttl: Duration::from_secs(30),
        }
    }
}

/// Per-stat-type spread constants used to standardize the gap between the
/// ensemble value and the line.
pub struct SigmaTable {
    table: BTreeMap<&'static str, f64>,
}

impl Default for SigmaTable {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        table.insert("points", 6.0);
        table.insert("rebounds", 2.6);
        table.insert("assists", 2.2);
        table.insert("3-pt made", 1.2);
        table.insert("pitcher strikeouts", 1.8);
        table.insert("hits", 0.9);
        table.insert("total bases", 1.4);
        table.insert("shots on goal", 1.3);
        table.insert("goals", 0.7);
        table.insert("passing yards", 48.0);
        table.insert("rushing yards", 26.0);
        table.insert("receiving yards", 24.0);
        table.insert("receptions", 1.9);
        Self { table }
    }
}

impl SigmaTable {
    pub fn sigma_for(&self, stat_type: &str, line: f64) -> f64 {
        match self.table.get(stat_type) {
            Some(&s) => s,
            // Unknown vocabulary still scores; scale with the line.
            None => (0.15 * line.abs()).max(1.0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScorerStatusEntry {
    pub name: String,
    pub ready: bool,
    pub accuracy: f64,
    pub state: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingStatus {
    pub scorers: Vec<ScorerStatusEntry>,
    pub ready_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Clone)]
pub struct RankedPredictions {
    pub predictions: Vec<PredictionResult>,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

struct RankCacheEntry {
    key: u64,
    computed_at: Instant,
    ranked: RankedPredictions,
}

pub struct ModelManager {
    scorers: Vec<Arc<dyn Scorer>>,
    cfg: ModelManagerConfig,
    sigma: SigmaTable,
    cache: Mutex<Option<RankCacheEntry>>,
}

impl ModelManager {
    pub fn new(scorers: Vec<Arc<dyn Scorer>>, cfg: ModelManagerConfig) -> Self {
        Self {
            scorers,
            cfg,
            sigma: SigmaTable::default(),
            cache: Mutex::new(None),
        }
    }

    pub fn with_default_scorers() -> Self {
        Self::new(
            crate::ensemble::scorer::default_scorers(),
            ModelManagerConfig::default(),
        )
    }

    pub fn config(&self) -> &ModelManagerConfig {
        &self.cfg
    }

    /// Launch every scorer's initialization as a background task. The
    /// manager answers status queries immediately; readiness arrives as
    /// training completes.
    pub fn spawn_training(&self, cancel: &CancellationToken) {
        for scorer in &self.scorers {
            let scorer = scorer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = scorer.initialize() => {
                        if let Err(e) = result {
                            warn!(scorer = scorer.name(), error = %e, "scorer training failed");
                            scorer.mark_failed();
                        }
                    }
                }
            });
        }
        info!(scorers = self.scorers.len(), "scorer training launched");
    }

    pub fn training_status(&self) -> TrainingStatus {
        let scorers: Vec<ScorerStatusEntry> = self
            .scorers
            .iter()
            .map(|s| ScorerStatusEntry {
                name: s.name().to_string(),
                ready: s.ready(),
                accuracy: s.accuracy(),
                state: s.state().as_str(),
            })
            .collect();
        let ready_count = scorers.iter().filter(|s| s.ready).count();
        TrainingStatus {
            total_count: scorers.len(),
            ready_count,
            scorers,
        }
    }

    pub fn ready_count(&self) -> usize {
        self.scorers.iter().filter(|s| s.ready()).count()
    }

    pub fn total_count(&self) -> usize {
        self.scorers.len()
    }

    /// Mean measured accuracy across ready scorers; None until the first
    /// scorer is trained.
    pub fn ensemble_accuracy(&self) -> Option<f64> {
        let ready: Vec<f64> = self
            .scorers
            .iter()
            .filter(|s| s.ready())
            .map(|s| s.accuracy())
            .collect();
        if ready.is_empty() {
            None
        } else {
            Some(ready.iter().sum::<f64>() / ready.len() as f64)
        }
    }

    /// Ready scorers of the ensemble kind with renormalized weights. The
    /// kind with the larger total accuracy wins; predicted-value breaks ties.
    fn active_ensemble(&self) -> Vec<(Arc<dyn Scorer>, f64)> {
        let ready: Vec<&Arc<dyn Scorer>> = self.scorers.iter().filter(|s| s.ready()).collect();
        if ready.is_empty() {
            return Vec::new();
        }

        let total_for = |kind: ScorerKind| -> f64 {
            ready
                .iter()
                .filter(|s| s.kind() == kind)
                .map(|s| s.accuracy())
                .sum()
        };
        let value_total = total_for(ScorerKind::PredictedValue);
        let prob_total = total_for(ScorerKind::ProbabilityOfOver);
        let kind = if prob_total > value_total {
            ScorerKind::ProbabilityOfOver
        } else {
            ScorerKind::PredictedValue
        };

        let members: Vec<&Arc<dyn Scorer>> =
            ready.into_iter().filter(|s| s.kind() == kind).collect();
        let total: f64 = members.iter().map(|s| s.accuracy()).sum();
        members
            .into_iter()
            .map(|s| (s.clone(), s.accuracy() / total))
            .collect()
    }

    /// Synchronous full-batch prediction; runs on the caller's thread.
    /// The async path wraps this in chunks on the blocking pool.
    pub fn predict(&self, projections: &[Projection]) -> Vec<PredictionResult> {
        let ensemble = self.active_ensemble();
        if ensemble.is_empty() {
            return projections.iter().map(|p| self.degraded_result(p)).collect();
        }
        self.predict_chunk(projections, &ensemble)
    }

    fn predict_chunk(
        &self,
        chunk: &[Projection],
        ensemble: &[(Arc<dyn Scorer>, f64)],
    ) -> Vec<PredictionResult> {
        // One batch call per scorer, scorers in parallel. A scorer that
        // errors is excluded for the rest of the process.
        let outputs: Vec<Option<Vec<crate::ensemble::scorer::ScorerOutput>>> = ensemble
            .par_iter()
            .map(|(scorer, _)| match scorer.predict_batch(chunk) {
                Ok(out) if out.len() == chunk.len() => Some(out),
                Ok(_) => {
                    warn!(scorer = scorer.name(), "scorer returned wrong batch size");
                    scorer.mark_failed();
                    None
                }
                Err(e) => {
                    warn!(scorer = scorer.name(), error = %e, "scorer failed during predict");
                    scorer.mark_failed();
                    None
                }
            })
            .collect();

        let survivors: Vec<(&(Arc<dyn Scorer>, f64), &Vec<crate::ensemble::scorer::ScorerOutput>)> =
            ensemble
                .iter()
                .zip(outputs.iter())
                .filter_map(|(member, out)| out.as_ref().map(|o| (member, o)))
                .collect();

        if survivors.is_empty() {
            return chunk.iter().map(|p| self.degraded_result(p)).collect();
        }

        // Renormalize after exclusions.
        let weight_total: f64 = survivors.iter().map(|((_, w), _)| w).sum();
        let kind = survivors[0].0 .0.kind();

        chunk
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let contributions: Vec<(&str, f64, f64, &crate::ensemble::scorer::ScorerOutput)> =
                    survivors
                        .iter()
                        .map(|((scorer, w), out)| {
                            (scorer.name(), w / weight_total, out[i].value, &out[i])
                        })
                        .collect();
                self.combine(p, kind, &contributions)
            })
            .collect()
    }

    fn combine(
        &self,
        p: &Projection,
        kind: ScorerKind,
        contributions: &[(&str, f64, f64, &crate::ensemble::scorer::ScorerOutput)],
    ) -> PredictionResult {
        let ensemble_value: f64 = contributions.iter().map(|(_, w, v, _)| w * v).sum();
        let sigma = self.sigma.sigma_for(&p.stat_type, p.line_score);

        let (recommendation, p_over, ensemble_prediction) = match kind {
            ScorerKind::PredictedValue => {
                let margin = (self.cfg.margin_sigma_frac * sigma).max(self.cfg.min_margin);
                let rec = if ensemble_value > p.line_score + margin {
                    Recommendation::Over
                } else if ensemble_value < p.line_score - margin {
                    Recommendation::Under
                } else {
                    Recommendation::Pass
                };
                let z = (ensemble_value - p.line_score) / sigma;
                (rec, std_normal_cdf(z).clamp(0.01, 0.99), ensemble_value)
            }
            ScorerKind::ProbabilityOfOver => {
                let p_over = ensemble_value.clamp(0.0, 1.0);
                let rec = if p_over > 0.5 + self.cfg.probability_tau {
                    Recommendation::Over
                } else if p_over < 0.5 - self.cfg.probability_tau {
                    Recommendation::Under
                } else {
                    Recommendation::Pass
                };
                (rec, p_over.clamp(0.01, 0.99), p_over)
            }
        };

        let expected_value = match recommendation {
            Recommendation::Over => side_ev(p_over),
            Recommendation::Under => side_ev(1.0 - p_over),
            Recommendation::Pass => side_ev(p_over).max(side_ev(1.0 - p_over)),
        };

        // Weighted mean confidence, penalized by normalized dispersion of the
        // per-scorer values.
        let mean_conf: f64 = contributions
            .iter()
            .map(|(_, w, _, out)| w * out.confidence)
            .sum();
        let variance: f64 = contributions
            .iter()
            .map(|(_, w, v, _)| w * (v - ensemble_value).powi(2))
            .sum();
        let scale = match kind {
            ScorerKind::PredictedValue => sigma * sigma,
            ScorerKind::ProbabilityOfOver => 0.25,
        };
        let confidence =
            (mean_conf - self.cfg.dispersion_penalty * (variance / scale)).clamp(0.0, 1.0);

        let mut shap: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for (_, w, _, out) in contributions {
            if let Some(parts) = &out.shap {
                for (feature, contribution) in parts {
                    let entry = shap
                        .entry(feature.clone())
                        .or_insert_with(|| serde_json::Value::from(0.0));
                    let current = entry.as_f64().unwrap_or(0.0);
                    *entry = serde_json::Value::from(current + w * contribution);
                }
            }
        }

        PredictionResult {
            projection_id: p.projection_id.clone(),
            ensemble_prediction,
            confidence,
            expected_value,
            recommendation,
            shap_values: (!shap.is_empty()).then_some(shap),
            per_scorer: contributions
                .iter()
                .map(|(name, w, v, _)| PerScorer {
                    scorer_name: name.to_string(),
                    value: *v,
                    weight_used: *w,
                })
                .collect(),
        }
    }

    /// Shape returned while no scorer is ready: an explicit pass, never an
    /// error.
    fn degraded_result(&self, p: &Projection) -> PredictionResult {
        let mut shap = BTreeMap::new();
        shap.insert(
            "reason".to_string(),
            serde_json::Value::from("no_scorers_ready"),
        );
        PredictionResult {
            projection_id: p.projection_id.clone(),
            ensemble_prediction: p.line_score,
            confidence: 0.0,
            expected_value: 0.0,
            recommendation: Recommendation::Pass,
            shap_values: Some(shap),
            per_scorer: Vec::new(),
        }
    }

    /// Rank the top-k predictions under the request deadline. Over-deadline
    /// responses return whatever chunks finished, flagged degraded.
    pub async fn rank(
        self: Arc<Self>,
        projections: Vec<Projection>,
        k: usize,
        min_confidence: Option<f64>,
        store_generation: u64,
    ) -> RankedPredictions {
        let cache_key = self.cache_key(&projections, k, min_confidence, store_generation);
        if let Some(cached) = self.cached(cache_key) {
            return cached;
        }

        let ready = self.ready_count();
        let total = self.total_count();
        let readiness_degraded = ready < self.cfg.min_ready_scorers;

        let partial: Arc<Mutex<Vec<PredictionResult>>> = Arc::new(Mutex::new(Vec::new()));
        let worker_partial = partial.clone();
        let manager = self.clone();
        let work = tokio::task::spawn_blocking(move || {
            let ensemble = manager.active_ensemble();
            for chunk in projections.chunks(PREDICT_CHUNK) {
                let results = if ensemble.is_empty() {
                    chunk.iter().map(|p| manager.degraded_result(p)).collect()
                } else {
                    manager.predict_chunk(chunk, &ensemble)
                };
                worker_partial.lock().extend(results);
            }
        });

        let (mut predictions, deadline_hit) =
            match tokio::time::timeout(self.cfg.deadline, work).await {
                Ok(_) => (std::mem::take(&mut *partial.lock()), false),
                Err(_) => {
                    warn!(
                        component = "ensemble",
                        deadline_ms = self.cfg.deadline.as_millis() as u64,
                        "prediction deadline hit, returning partial result"
                    );
                    (partial.lock().clone(), true)
                }
            };

        if let Some(mc) = min_confidence {
            predictions.retain(|p| p.confidence >= mc);
        }
        rank_predictions(&mut predictions);
        predictions.truncate(k);

        let degraded = readiness_degraded || deadline_hit;
        let degraded_reason = if deadline_hit {
            Some(format!(
                "prediction deadline of {}ms exceeded",
                self.cfg.deadline.as_millis()
            ))
        } else if readiness_degraded {
            Some(format!("only {ready} of {total} scorers ready"))
        } else {
            None
        };

        let ranked = RankedPredictions {
            predictions,
            degraded,
            degraded_reason,
        };

        if !deadline_hit {
            *self.cache.lock() = Some(RankCacheEntry {
                key: cache_key,
                computed_at: Instant::now(),
                ranked: ranked.clone(),
            });
        }
        ranked
    }

    fn cache_key(
        &self,
        projections: &[Projection],
        k: usize,
        min_confidence: Option<f64>,
        store_generation: u64,
    ) -> u64 {
        let mut key = String::with_capacity(projections.len() * 8 + 64);
        for p in projections {
            key.push_str(&p.projection_id);
            key.push('|');
        }
        key.push_str(&format!(
            "k={k}|mc={:?}|gen={store_generation}|ready={}",
            min_confidence,
            self.ready_count()
        ));
        stable_hash(key.as_bytes())
    }

    fn cached(&self, key: u64) -> Option<RankedPredictions> {
        let cache = self.cache.lock();
        match cache.as_ref() {
            Some(entry)
                if entry.key == key
                    && entry.computed_at.elapsed() < self.cfg.prediction_cache_ttl =>
            {
                Some(entry.ranked.clone())
            }
            _ => None,
        }
    }
}

/// Lexicographic ranking: actionable first, then expected value, then
/// confidence, then id for stability.
fn rank_predictions(predictions: &mut [PredictionResult]) {
    predictions.sort_by(|a, b| {
        let a_action = a.recommendation != Recommendation::Pass;
        let b_action = b.recommendation != Recommendation::Pass;
        b_action
            .cmp(&a_action)
            .then_with(|| {
                b.expected_value
                    .partial_cmp(&a.expected_value)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.projection_id.cmp(&b.projection_id))
    });
}

/// EV per unit staked on a side with win probability `p`, at -110 juice.
fn side_ev(p: f64) -> f64 {
    p * PAYOUT_PER_UNIT - (1.0 - p)
}

fn std_normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}
