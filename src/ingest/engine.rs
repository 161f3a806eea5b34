//! Ingestion engine.
//!
//! Walks the active leagues on a schedule and keeps the projection store
//! fresh. Per-league failure is isolated; the serving path never waits on
//! this loop. The engine is the sole writer of projections, cache entries,
//! and governor state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingest::cache::{CacheStats, ResponseCache};
use crate::ingest::fetcher::{FetchOutcome, UpstreamClient, UPSTREAM_API_BASE};
use crate::ingest::governor::{GovernorSnapshot, RateGovernor};
use crate::ingest::prizepicks::{self, ConversionError, DEFAULT_LEAGUES};
use crate::models::{League, ProjectionSource};
use crate::store::ProjectionStore;

/// Whole-cycle failures before `/health` reports ingestion as degraded.
const DEGRADED_CYCLE_THRESHOLD: u32 = 3;
/// Minimum gap between repeated ingestion alerts.
const ALERT_COOLDOWN: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize)]
pub struct LeagueIngest {
    pub league_id: String,
    pub league_name: String,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_status: String,
    pub projections: u64,
}

#[derive(Debug, Default)]
struct StatusInner {
    running: bool,
    last_cycle_at: Option<DateTime<Utc>>,
    last_cycle_ok: bool,
    last_cycle_duration_ms: u64,
    consecutive_cycle_failures: u32,
    conversion_errors_total: u64,
    leagues: BTreeMap<String, LeagueIngest>,
}

/// Shared, cheaply readable view of the engine. Handlers read this; only the
/// engine writes it.
#[derive(Clone, Default)]
pub struct IngestionStatusHandle {
    inner: Arc<RwLock<StatusInner>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionStatus {
    pub running: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_ok: bool,
    pub last_cycle_duration_ms: u64,
    pub consecutive_cycle_failures: u32,
    pub degraded: bool,
    pub conversion_errors_total: u64,
    pub leagues: Vec<LeagueIngest>,
}

impl IngestionStatusHandle {
    pub fn snapshot(&self) -> IngestionStatus {
        let inner = self.inner.read();
        IngestionStatus {
            running: inner.running,
            last_cycle_at: inner.last_cycle_at,
            last_cycle_ok: inner.last_cycle_ok,
            last_cycle_duration_ms: inner.last_cycle_duration_ms,
            consecutive_cycle_failures: inner.consecutive_cycle_failures,
            degraded: inner.consecutive_cycle_failures >= DEGRADED_CYCLE_THRESHOLD,
            conversion_errors_total: inner.conversion_errors_total,
            leagues: inner.leagues.values().cloned().collect(),
        }
    }

    pub fn conversion_errors_total(&self) -> u64 {
        self.inner.read().conversion_errors_total
    }

    fn set_league(&self, league: &League, status: &str, ok: bool, projections: Option<u64>) {
        let mut inner = self.inner.write();
        let entry = inner
            .leagues
            .entry(league.league_id.clone())
            .or_insert_with(|| LeagueIngest {
                league_id: league.league_id.clone(),
                league_name: league.league_name.clone(),
                last_ok_at: None,
                last_status: String::new(),
                projections: 0,
            });
        entry.league_name = league.league_name.clone();
        entry.last_status = status.to_string();
        if ok {
            entry.last_ok_at = Some(Utc::now());
        }
        if let Some(n) = projections {
            entry.projections = n;
        }
    }
}

pub struct IngestionEngine {
    upstream: Arc<dyn UpstreamClient>,
    cache: Arc<ResponseCache>,
    governor: Arc<RateGovernor>,
    store: Arc<ProjectionStore>,
    status: IngestionStatusHandle,
    interval: Duration,
    alert_webhook: Option<String>,
    alert_client: reqwest::Client,
    last_alert_at: parking_lot::Mutex<Option<Instant>>,
}

/// What one cycle did, for the CLI and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleOutcome {
    pub leagues_ok: usize,
    pub leagues_failed: usize,
    pub projections_upserted: usize,
    pub conversion_errors: usize,
}

impl IngestionEngine {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        cache: Arc<ResponseCache>,
        governor: Arc<RateGovernor>,
        store: Arc<ProjectionStore>,
        interval: Duration,
        alert_webhook: Option<String>,
        alert_client: reqwest::Client,
    ) -> Self {
        Self {
            upstream,
            cache,
            governor,
            store,
            status: IngestionStatusHandle::default(),
            interval,
            alert_webhook,
            alert_client,
            last_alert_at: parking_lot::Mutex::new(None),
        }
    }

    pub fn status_handle(&self) -> IngestionStatusHandle {
        self.status.clone()
    }

    pub fn governor_snapshot(&self) -> GovernorSnapshot {
        self.governor.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Main loop. Startup is non-blocking to the HTTP listener: the caller
    /// spawns this and serves from the existing store meanwhile.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_s = self.interval.as_secs(), "ingestion engine started");
        self.status.inner.write().running = true;

        loop {
            let _ = self.run_cycle(&cancel).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.status.inner.write().running = false;
        info!("ingestion engine stopped");
    }

    /// One full pass over the active leagues. Cancellation is honored at
    /// league boundaries: the league in flight finishes, then we exit.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleOutcome {
        let started = Instant::now();
        let mut outcome = CycleOutcome::default();

        self.refresh_leagues().await;
        let leagues = self.load_leagues();

        for league in &leagues {
            if cancel.is_cancelled() {
                break;
            }
            match self.ingest_league(league).await {
                LeagueResult::Ok {
                    upserted,
                    conversion_errors,
                } => {
                    outcome.leagues_ok += 1;
                    outcome.projections_upserted += upserted;
                    outcome.conversion_errors += conversion_errors;
                }
                LeagueResult::Failed => outcome.leagues_failed += 1,
            }
        }

        let cycle_ok = outcome.leagues_ok > 0 || leagues.is_empty();
        {
            let mut inner = self.status.inner.write();
            inner.last_cycle_at = Some(Utc::now());
            inner.last_cycle_ok = cycle_ok;
            inner.last_cycle_duration_ms = started.elapsed().as_millis() as u64;
            inner.conversion_errors_total += outcome.conversion_errors as u64;
            if cycle_ok {
                inner.consecutive_cycle_failures = 0;
            } else {
                inner.consecutive_cycle_failures =
                    inner.consecutive_cycle_failures.saturating_add(1);
            }
        }
        counter!("ingest_cycles_total", 1);

        if !cycle_ok {
            let failures = self.status.inner.read().consecutive_cycle_failures;
            warn!(
                component = "ingestion",
                consecutive_failures = failures,
                "ingestion cycle produced no successful league"
            );
            if failures == DEGRADED_CYCLE_THRESHOLD {
                self.send_alert(failures).await;
            }
        } else {
            debug!(
                leagues_ok = outcome.leagues_ok,
                upserted = outcome.projections_upserted,
                duration_ms = started.elapsed().as_millis() as u64,
                "ingestion cycle complete"
            );
        }

        outcome
    }

    /// Active leagues in deterministic (numeric, then lexicographic) order;
    /// bootstraps the defaults list into the store on first run.
    fn load_leagues(&self) -> Vec<League> {
        match self.store.get_active_leagues() {
            Ok(leagues) if !leagues.is_empty() => leagues,
            Ok(_) => {
                let defaults: Vec<League> = DEFAULT_LEAGUES
                    .iter()
                    .map(|(id, name)| League {
                        league_id: id.to_string(),
                        league_name: name.to_string(),
                        active: true,
                    })
                    .collect();
                if let Err(e) = self.store.upsert_leagues(&defaults) {
                    warn!(component = "ingestion", error = %e, "failed to bootstrap leagues");
                }
                self.store.get_active_leagues().unwrap_or(defaults)
            }
            Err(e) => {
                warn!(component = "ingestion", error = %e, "failed to load leagues");
                Vec::new()
            }
        }
    }

    /// Opportunistic `/leagues` refresh. Failure here never fails the cycle.
    async fn refresh_leagues(&self) {
        let key = ResponseCache::canonical_key(&format!("{UPSTREAM_API_BASE}/leagues"), &[]);
        if self.cache.get(&key).is_some() {
            return;
        }

        self.governor.acquire().await;
        match self.upstream.fetch_leagues().await {
            FetchOutcome::Ok { body, status } if (200..300).contains(&status) => {
                self.governor.record_success();
                let leagues = prizepicks::parse_leagues(&body);
                if !leagues.is_empty() {
                    if let Err(e) = self.store.upsert_leagues(&leagues) {
                        warn!(component = "ingestion", error = %e, "league refresh upsert failed");
                    }
                }
                self.cache.put(key, body);
            }
            FetchOutcome::Ok { status, .. } => {
                debug!(component = "ingestion", status, "league refresh got non-2xx");
            }
            FetchOutcome::ParseError(e) => {
                warn!(component = "ingestion", kind = "malformed_upstream", error = %e, "league refresh unparsable");
            }
            other => {
                self.governor.record_failure();
                debug!(component = "ingestion", kind = other.kind(), "league refresh failed");
            }
        }
    }

    async fn ingest_league(&self, league: &League) -> LeagueResult {
        let key = ResponseCache::canonical_key(
            &format!("{UPSTREAM_API_BASE}/projections"),
            &crate::ingest::fetcher::HttpFetcher::projections_query(&league.league_id),
        );

        // Fresh cached body: skip the network, re-materialize from cache.
        if let Some((body, cached_at)) = self.cache.get(&key) {
            counter!("ingest_cache_hits_total", 1);
            return self.absorb_body(league, &body, cached_at, ProjectionSource::UpstreamCached);
        }

        let max_attempts = self.governor.max_attempts();
        for attempt in 1..=max_attempts {
            self.governor.acquire().await;

            match self.upstream.fetch_projections(&league.league_id).await {
                FetchOutcome::Ok { body, status } if (200..300).contains(&status) => {
                    self.governor.record_success();
                    let result =
                        self.absorb_body(league, &body, Utc::now(), ProjectionSource::UpstreamLive);
                    if matches!(result, LeagueResult::Ok { .. }) {
                        self.cache.put(key, body);
                    }
                    return result;
                }
                FetchOutcome::Ok { status, .. } => {
                    // e.g. 404 on a league the upstream retired.
                    warn!(
                        component = "ingestion",
                        league_id = %league.league_id,
                        status,
                        "upstream answered non-2xx for league"
                    );
                    self.status
                        .set_league(league, &format!("http_{status}"), false, None);
                    return LeagueResult::Failed;
                }
                FetchOutcome::RateLimited { retry_after } => {
                    let backoff = self.governor.record_failure();
                    counter!("ingest_rate_limited_total", 1);
                    warn!(
                        component = "ingestion",
                        kind = "rate_limited",
                        league_id = %league.league_id,
                        attempt,
                        retry_after,
                        backoff_s = backoff.as_secs(),
                        "upstream rate limited"
                    );
                    self.status.set_league(league, "rate_limited", false, None);
                }
                FetchOutcome::Blocked => {
                    let backoff = self.governor.record_failure();
                    counter!("ingest_blocked_total", 1);
                    warn!(
                        component = "ingestion",
                        kind = "blocked",
                        league_id = %league.league_id,
                        attempt,
                        backoff_s = backoff.as_secs(),
                        "upstream challenge page"
                    );
                    self.status.set_league(league, "blocked", false, None);
                }
                FetchOutcome::TransportError(e) => {
                    let backoff = self.governor.record_failure();
                    warn!(
                        component = "ingestion",
                        kind = "transient_upstream",
                        league_id = %league.league_id,
                        attempt,
                        backoff_s = backoff.as_secs(),
                        error = %e,
                        "upstream transport error"
                    );
                    self.status.set_league(league, "transport_error", false, None);
                }
                FetchOutcome::ParseError(e) => {
                    // Malformed 2xx: quarantine and move on, no retry.
                    warn!(
                        component = "ingestion",
                        kind = "malformed_upstream",
                        league_id = %league.league_id,
                        error = %e,
                        "unparsable upstream body"
                    );
                    let _ = self.store.quarantine(&[ConversionError {
                        projection_id: None,
                        league_id: Some(league.league_id.clone()),
                        reason: format!("unparsable body: {e}"),
                        raw: serde_json::Value::Null,
                    }]);
                    self.status.set_league(league, "parse_error", false, None);
                    return LeagueResult::Failed;
                }
            }
        }

        warn!(
            component = "ingestion",
            league_id = %league.league_id,
            attempts = max_attempts,
            "league abandoned for this cycle"
        );
        LeagueResult::Failed
    }

    /// Parse an envelope and push it into the store; bad rows are quarantined
    /// and counted, good rows in the same response are unaffected.
    fn absorb_body(
        &self,
        league: &League,
        body: &serde_json::Value,
        fetched_at: DateTime<Utc>,
        source: ProjectionSource,
    ) -> LeagueResult {
        let batch = prizepicks::parse_projections(body, &league.league_id, fetched_at, source);

        for err in &batch.conversion_errors {
            warn!(
                component = "ingestion",
                kind = "bad_projection_record",
                league_id = %league.league_id,
                projection_id = err.projection_id.as_deref().unwrap_or("-"),
                reason = %err.reason,
                "projection row quarantined"
            );
        }
        counter!(
            "ingest_conversion_errors_total",
            batch.conversion_errors.len() as u64
        );
        if let Err(e) = self.store.quarantine(&batch.conversion_errors) {
            warn!(component = "ingestion", error = %e, "quarantine write failed");
        }

        match self.store.upsert_many(&batch.projections) {
            Ok(upsert) => {
                counter!("ingest_projections_upserted_total", batch.projections.len() as u64);
                self.status.set_league(
                    league,
                    "ok",
                    true,
                    Some(batch.projections.len() as u64),
                );
                debug!(
                    league_id = %league.league_id,
                    inserted = upsert.inserted,
                    updated = upsert.updated,
                    unchanged = upsert.unchanged,
                    "league ingested"
                );
                LeagueResult::Ok {
                    upserted: batch.projections.len(),
                    conversion_errors: batch.conversion_errors.len(),
                }
            }
            Err(e) => {
                warn!(
                    component = "ingestion",
                    kind = "storage",
                    league_id = %league.league_id,
                    error = %e,
                    "store upsert failed"
                );
                self.status.set_league(league, "storage_error", false, None);
                LeagueResult::Failed
            }
        }
    }

    async fn send_alert(&self, failures: u32) {
        let Some(webhook) = &self.alert_webhook else {
            return;
        };
        {
            let mut last = self.last_alert_at.lock();
            let now = Instant::now();
            if matches!(*last, Some(t) if now.duration_since(t) < ALERT_COOLDOWN) {
                return;
            }
            *last = Some(now);
        }

        let payload = serde_json::json!({
            "text": format!(
                "propboard ingestion degraded: {failures} consecutive cycles without a successful league"
            )
        });
        if let Err(e) = self
            .alert_client
            .post(webhook)
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            warn!(component = "ingestion", error = %e, "alert webhook failed");
        }
    }
}

enum LeagueResult {
    Ok {
        upserted: usize,
        conversion_errors: usize,
    },
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Scripted upstream: each league has a queue of outcomes; the last entry
    /// repeats once the queue drains.
    struct ScriptedUpstream {
        projections: Mutex<HashMap<String, Vec<FetchOutcome>>>,
        leagues: Mutex<Vec<FetchOutcome>>,
    }

    impl ScriptedUpstream {
        fn new() -> Self {
            Self {
                projections: Mutex::new(HashMap::new()),
                leagues: Mutex::new(vec![FetchOutcome::TransportError("not scripted".into())]),
            }
        }

        fn script(&self, league_id: &str, outcomes: Vec<FetchOutcome>) {
            self.projections
                .lock()
                .insert(league_id.to_string(), outcomes);
        }

        fn pop(queue: &mut Vec<FetchOutcome>) -> FetchOutcome {
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue
                    .first()
                    .cloned()
                    .unwrap_or(FetchOutcome::TransportError("script exhausted".into()))
            }
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedUpstream {
        async fn fetch_projections(&self, league_id: &str) -> FetchOutcome {
            let mut scripts = self.projections.lock();
            match scripts.get_mut(league_id) {
                Some(queue) => Self::pop(queue),
                None => FetchOutcome::TransportError(format!("no script for league {league_id}")),
            }
        }

        async fn fetch_leagues(&self) -> FetchOutcome {
            Self::pop(&mut self.leagues.lock())
        }
    }

    fn envelope(league_id: &str, ids: &[&str]) -> Value {
        let data: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "type": "projection",
                    "id": id,
                    "attributes": {
                        "line_score": 9.5,
                        "start_time": (Utc::now() + chrono::Duration::hours(4)).to_rfc3339(),
                        "status": "pre_game",
                        "stat_type": "Points"
                    },
                    "relationships": {
                        "league": {"data": {"type": "league", "id": league_id}}
                    }
                })
            })
            .collect();
        json!({"data": data, "included": []})
    }

    fn ok(body: Value) -> FetchOutcome {
        FetchOutcome::Ok { body, status: 200 }
    }

    struct Fixture {
        _dir: TempDir,
        engine: IngestionEngine,
        upstream: Arc<ScriptedUpstream>,
        store: Arc<ProjectionStore>,
    }

    fn fixture(leagues: &[(&str, &str)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.db");
        let store = Arc::new(ProjectionStore::new(path.to_str().unwrap()).unwrap());

        let seeded: Vec<League> = leagues
            .iter()
            .map(|(id, name)| League {
                league_id: id.to_string(),
                league_name: name.to_string(),
                active: true,
            })
            .collect();
        store.upsert_leagues(&seeded).unwrap();

        let upstream = Arc::new(ScriptedUpstream::new());
        let governor = Arc::new(RateGovernor::new(
            Duration::from_secs(3),
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40),
            ],
        ));
        // Zero TTL so every cycle goes back to the (scripted) network.
        let cache = Arc::new(ResponseCache::new(Duration::ZERO));

        let engine = IngestionEngine::new(
            upstream.clone(),
            cache,
            governor,
            store.clone(),
            Duration::from_secs(60),
            None,
            reqwest::Client::new(),
        );

        Fixture {
            _dir: dir,
            engine,
            upstream,
            store,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_leagues_recover_across_cycles() {
        let fx = fixture(&[("1", "NCAAF"), ("2", "MLB"), ("82", "SOCCER")]);

        // Cycle 1: leagues 1 and 2 are throttled, 82 succeeds.
        fx.upstream
            .script("1", vec![FetchOutcome::RateLimited { retry_after: None }]);
        fx.upstream
            .script("2", vec![FetchOutcome::RateLimited { retry_after: None }]);
        fx.upstream.script("82", vec![ok(envelope("82", &["s1", "s2"]))]);

        let cancel = CancellationToken::new();
        let outcome = fx.engine.run_cycle(&cancel).await;
        assert_eq!(outcome.leagues_ok, 1);
        assert_eq!(outcome.leagues_failed, 2);

        let after_one = fx
            .store
            .get_bettable(Utc::now(), 100, &Default::default())
            .unwrap();
        assert_eq!(after_one.len(), 2);
        assert!(after_one.iter().all(|p| p.league_id == "82"));

        // Cycle 2: everyone answers.
        fx.upstream.script("1", vec![ok(envelope("1", &["a1"]))]);
        fx.upstream.script("2", vec![ok(envelope("2", &["b1"]))]);
        fx.upstream.script("82", vec![ok(envelope("82", &["s1", "s2"]))]);

        let outcome = fx.engine.run_cycle(&cancel).await;
        assert_eq!(outcome.leagues_ok, 3);

        let after_two = fx
            .store
            .get_bettable(Utc::now(), 100, &Default::default())
            .unwrap();
        assert_eq!(after_two.len(), 4);
        let mut ids: Vec<&str> = after_two.iter().map(|p| p.projection_id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4, "no duplicate projection ids");

        assert_eq!(fx.engine.governor_snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_league_failure_is_isolated() {
        let fx = fixture(&[("2", "MLB"), ("7", "NBA")]);
        fx.upstream
            .script("2", vec![FetchOutcome::TransportError("connect refused".into())]);
        fx.upstream.script("7", vec![ok(envelope("7", &["n1"]))]);

        let outcome = fx.engine.run_cycle(&CancellationToken::new()).await;
        assert_eq!(outcome.leagues_ok, 1);
        assert_eq!(outcome.leagues_failed, 1);

        let status = fx.engine.status_handle().snapshot();
        assert!(status.last_cycle_ok);
        let mlb = status.leagues.iter().find(|l| l.league_id == "2").unwrap();
        assert_eq!(mlb.last_status, "transport_error");
        let nba = status.leagues.iter().find(|l| l.league_id == "7").unwrap();
        assert_eq!(nba.last_status, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn bad_rows_are_quarantined_and_counted() {
        let fx = fixture(&[("2", "MLB")]);

        let mut body = envelope("2", &["good-1"]);
        body["data"].as_array_mut().unwrap().push(json!({
            "type": "projection",
            "id": "bad-1",
            "attributes": {
                "start_time": (Utc::now() + chrono::Duration::hours(2)).to_rfc3339(),
                "status": "pre_game",
                "stat_type": "Hits"
            },
            "relationships": {}
        }));
        fx.upstream.script("2", vec![ok(body)]);

        let outcome = fx.engine.run_cycle(&CancellationToken::new()).await;
        assert_eq!(outcome.conversion_errors, 1);
        assert_eq!(outcome.projections_upserted, 1);
        assert!(fx.store.get_by_id("good-1").unwrap().is_some());
        assert!(fx.store.get_by_id("bad-1").unwrap().is_none());
        assert_eq!(fx.store.stats().unwrap().quarantined, 1);
        assert_eq!(fx.engine.status_handle().conversion_errors_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_leagues_failing_marks_cycle_failed() {
        let fx = fixture(&[("7", "NBA")]);
        fx.upstream
            .script("7", vec![FetchOutcome::TransportError("503".into())]);

        let cancel = CancellationToken::new();
        for _ in 0..DEGRADED_CYCLE_THRESHOLD {
            fx.engine.run_cycle(&cancel).await;
        }

        let status = fx.engine.status_handle().snapshot();
        assert!(!status.last_cycle_ok);
        assert!(status.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_cycles_are_idempotent() {
        let fx = fixture(&[("7", "NBA")]);
        fx.upstream.script("7", vec![ok(envelope("7", &["n1", "n2"]))]);

        let cancel = CancellationToken::new();
        fx.engine.run_cycle(&cancel).await;
        let first = fx
            .store
            .get_bettable(Utc::now(), 100, &Default::default())
            .unwrap();

        fx.engine.run_cycle(&cancel).await;
        let second = fx
            .store
            .get_bettable(Utc::now(), 100, &Default::default())
            .unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.projection_id, b.projection_id);
            assert_eq!(a.line_score, b.line_score);
            assert_eq!(a.updated_at, b.updated_at);
        }
    }
}
