//! Durable projection storage.
//!
//! SQLite in WAL mode behind a single guarded connection, with prepared
//! statement caching and batched transactions. The current view is deduped by
//! `projection_id`; history and quarantine tables are append-only. The
//! serving path only ever reads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::Serialize;
use tracing::{info, warn};

use crate::ingest::prizepicks::ConversionError;
use crate::models::{League, Projection, ProjectionSource, ProjectionStatus};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS projections (
    projection_id TEXT PRIMARY KEY,
    league_id TEXT NOT NULL,
    league_name TEXT,
    player_id TEXT,
    player_name TEXT,
    team TEXT,
    stat_type TEXT NOT NULL,
    line_score REAL NOT NULL,
    start_time INTEGER NOT NULL,
    status TEXT NOT NULL,
    source TEXT NOT NULL,
    fetched_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    raw_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_projections_status_start
    ON projections(status, start_time);

CREATE INDEX IF NOT EXISTS idx_projections_league
    ON projections(league_id);

CREATE INDEX IF NOT EXISTS idx_projections_updated
    ON projections(updated_at DESC);

CREATE INDEX IF NOT EXISTS idx_projections_fetched
    ON projections(fetched_at);

-- Append-only audit of snapshots that changed the current view.
CREATE TABLE IF NOT EXISTS projection_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    projection_id TEXT NOT NULL,
    snapshot_at INTEGER NOT NULL,
    raw_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_projection_history_pid
    ON projection_history(projection_id, snapshot_at DESC);

CREATE TABLE IF NOT EXISTS leagues (
    league_id TEXT PRIMARY KEY,
    league_name TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
) WITHOUT ROWID;

-- Rows that failed validation; kept for reprocessing, never served.
CREATE TABLE IF NOT EXISTS quarantined_projections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    projection_id TEXT,
    league_id TEXT,
    reason TEXT NOT NULL,
    raw_json TEXT NOT NULL,
    quarantined_at INTEGER NOT NULL
);
"#;

pub struct ProjectionStore {
    conn: Mutex<Connection>,
    /// Bumped on every write batch; readers use it as a cheap cache key.
    generation: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub last_24h: i64,
    pub oldest_fetched_at: Option<DateTime<Utc>>,
    pub newest_fetched_at: Option<DateTime<Utc>>,
    pub quarantined: i64,
}

/// Optional restrictions on the bettable query.
#[derive(Debug, Default, Clone)]
pub struct BettableFilter {
    pub league_id: Option<String>,
    pub stat_type: Option<String>,
    /// Case-insensitive substring on player name.
    pub player: Option<String>,
}

impl ProjectionStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {db_path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM projections", [], |row| row.get(0))
            .unwrap_or(0);
        info!(db_path, existing = count, "projection store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            generation: AtomicU64::new(0),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Atomic batch upsert. A snapshot only replaces the current row when its
    /// `fetched_at` is not older; two concurrent upserts therefore converge on
    /// the same final state regardless of arrival order. `updated_at` moves
    /// only when a scalar field actually changed.
    pub fn upsert_many(&self, projections: &[Projection]) -> Result<UpsertOutcome> {
        if projections.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let mut outcome = UpsertOutcome::default();
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])
            .context("begin upsert batch")?;

        let result: Result<()> = (|| {
            for p in projections {
                let existing = Self::get_locked(&conn, &p.projection_id)?;
                match existing {
                    None => {
                        Self::insert_locked(&conn, p, p.updated_at)?;
                        Self::append_history_locked(&conn, p)?;
                        outcome.inserted += 1;
                    }
                    Some(old) if p.fetched_at < old.fetched_at => {
                        // Late-arriving older snapshot; the newer row wins.
                        outcome.unchanged += 1;
                    }
                    Some(old) => {
                        if old.scalars_differ(p) {
                            Self::insert_locked(&conn, p, p.fetched_at)?;
                            Self::append_history_locked(&conn, p)?;
                            outcome.updated += 1;
                        } else {
                            let mut stmt = conn.prepare_cached(
                                "UPDATE projections
                                 SET fetched_at = ?2, source = ?3
                                 WHERE projection_id = ?1",
                            )?;
                            stmt.execute(params![
                                p.projection_id,
                                p.fetched_at.timestamp(),
                                p.source.as_str(),
                            ])?;
                            outcome.unchanged += 1;
                        }
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", []).context("commit upsert batch")?;
                self.generation.fetch_add(1, Ordering::Release);
                Ok(outcome)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    fn insert_locked(conn: &Connection, p: &Projection, updated_at: DateTime<Utc>) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO projections (
                projection_id, league_id, league_name, player_id, player_name,
                team, stat_type, line_score, start_time, status, source,
                fetched_at, updated_at, raw_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(projection_id) DO UPDATE SET
                league_id = excluded.league_id,
                league_name = excluded.league_name,
                player_id = excluded.player_id,
                player_name = excluded.player_name,
                team = excluded.team,
                stat_type = excluded.stat_type,
                line_score = excluded.line_score,
                start_time = excluded.start_time,
                status = excluded.status,
                source = excluded.source,
                fetched_at = excluded.fetched_at,
                updated_at = excluded.updated_at,
                raw_json = excluded.raw_json",
        )?;
        stmt.execute(params![
            p.projection_id,
            p.league_id,
            p.league_name,
            p.player_id,
            p.player_name,
            p.team,
            p.stat_type,
            p.line_score,
            p.start_time.timestamp(),
            p.status.as_str(),
            p.source.as_str(),
            p.fetched_at.timestamp(),
            updated_at.timestamp(),
            p.raw.to_string(),
        ])?;
        Ok(())
    }

    fn append_history_locked(conn: &Connection, p: &Projection) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO projection_history (projection_id, snapshot_at, raw_json)
             VALUES (?1, ?2, ?3)",
        )?;
        stmt.execute(params![
            p.projection_id,
            p.fetched_at.timestamp(),
            p.raw.to_string(),
        ])?;
        Ok(())
    }

    /// Currently bettable projections: status pre_game or in_progress, start
    /// time no further in the past than the grace window. Ordered by start
    /// time, then id for stability. Never touches the network.
    pub fn get_bettable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        filter: &BettableFilter,
    ) -> Result<Vec<Projection>> {
        let cutoff = (now - Duration::minutes(crate::models::BETTABLE_GRACE_MINUTES)).timestamp();

        let mut sql = String::from(
            "SELECT projection_id, league_id, league_name, player_id, player_name,
                    team, stat_type, line_score, start_time, status, source,
                    fetched_at, updated_at, raw_json
             FROM projections
             WHERE status IN ('pre_game', 'in_progress') AND start_time >= ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(cutoff)];

        if let Some(league_id) = &filter.league_id {
            args.push(Box::new(league_id.clone()));
            sql.push_str(&format!(" AND league_id = ?{}", args.len()));
        }
        if let Some(stat_type) = &filter.stat_type {
            args.push(Box::new(crate::models::normalize_stat_type(stat_type)));
            sql.push_str(&format!(" AND stat_type = ?{}", args.len()));
        }
        if let Some(player) = &filter.player {
            args.push(Box::new(player.to_lowercase()));
            sql.push_str(&format!(
                " AND player_name IS NOT NULL AND instr(lower(player_name), ?{}) > 0",
                args.len()
            ));
        }

        args.push(Box::new(limit as i64));
        sql.push_str(&format!(
            " ORDER BY start_time ASC, projection_id ASC LIMIT ?{}",
            args.len()
        ));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            Self::row_to_projection,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get_by_id(&self, projection_id: &str) -> Result<Option<Projection>> {
        let conn = self.conn.lock();
        Self::get_locked(&conn, projection_id)
    }

    pub fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Projection>> {
        let conn = self.conn.lock();
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = Self::get_locked(&conn, id)? {
                found.push(p);
            }
        }
        Ok(found)
    }

    fn get_locked(conn: &Connection, projection_id: &str) -> Result<Option<Projection>> {
        let mut stmt = conn.prepare_cached(
            "SELECT projection_id, league_id, league_name, player_id, player_name,
                    team, stat_type, line_score, start_time, status, source,
                    fetched_at, updated_at, raw_json
             FROM projections WHERE projection_id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([projection_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_projection(row)?)),
            None => Ok(None),
        }
    }

    pub fn count_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT status, COUNT(*) FROM projections GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn count_by_league(&self) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT league_id, COUNT(*) FROM projections GROUP BY league_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM projections", [], |r| r.get(0))?;
        let day_ago = (Utc::now() - Duration::hours(24)).timestamp();
        let last_24h: i64 = conn.query_row(
            "SELECT COUNT(*) FROM projections WHERE fetched_at >= ?1",
            [day_ago],
            |r| r.get(0),
        )?;
        let (oldest, newest): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(fetched_at), MAX(fetched_at) FROM projections",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let quarantined: i64 =
            conn.query_row("SELECT COUNT(*) FROM quarantined_projections", [], |r| {
                r.get(0)
            })?;

        Ok(StoreStats {
            total,
            last_24h,
            oldest_fetched_at: oldest.and_then(|t| DateTime::from_timestamp(t, 0)),
            newest_fetched_at: newest.and_then(|t| DateTime::from_timestamp(t, 0)),
            quarantined,
        })
    }

    /// Oldest `fetched_at` among currently bettable rows; what the board
    /// reports as its aggregate freshness.
    pub fn oldest_bettable_fetched_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let cutoff = (now - Duration::minutes(crate::models::BETTABLE_GRACE_MINUTES)).timestamp();
        let conn = self.conn.lock();
        let oldest: Option<i64> = conn.query_row(
            "SELECT MIN(fetched_at) FROM projections
             WHERE status IN ('pre_game', 'in_progress') AND start_time >= ?1",
            [cutoff],
            |r| r.get(0),
        )?;
        Ok(oldest.and_then(|t| DateTime::from_timestamp(t, 0)))
    }

    pub fn upsert_leagues(&self, leagues: &[League]) -> Result<()> {
        if leagues.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        for league in leagues {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO leagues (league_id, league_name, active) VALUES (?1, ?2, ?3)
                 ON CONFLICT(league_id) DO UPDATE SET
                    league_name = excluded.league_name,
                    active = excluded.active",
            )?;
            stmt.execute(params![
                league.league_id,
                league.league_name,
                league.active as i64
            ])?;
        }
        conn.execute("COMMIT", [])?;
        Ok(())
    }

    pub fn get_active_leagues(&self) -> Result<Vec<League>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT league_id, league_name, active FROM leagues
             WHERE active = 1
             ORDER BY CAST(league_id AS INTEGER), league_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(League {
                league_id: row.get(0)?,
                league_name: row.get(1)?,
                active: row.get::<_, i64>(2)? != 0,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn quarantine(&self, errors: &[ConversionError]) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        for e in errors {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO quarantined_projections
                    (projection_id, league_id, reason, raw_json, quarantined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            stmt.execute(params![
                e.projection_id,
                e.league_id,
                e.reason,
                e.raw.to_string(),
                now
            ])?;
        }
        conn.execute("COMMIT", [])?;
        Ok(())
    }

    /// Retention sweep: move projections whose game started before `cutoff`
    /// into history, then drop them from the current view. Returns how many
    /// rows were archived.
    pub fn archive_started_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let ts = cutoff.timestamp();
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<usize> = (|| {
            conn.execute(
                "INSERT INTO projection_history (projection_id, snapshot_at, raw_json)
                 SELECT projection_id, fetched_at, raw_json
                 FROM projections WHERE start_time < ?1",
                [ts],
            )?;
            let deleted = conn.execute("DELETE FROM projections WHERE start_time < ?1", [ts])?;
            Ok(deleted)
        })();

        match result {
            Ok(deleted) => {
                conn.execute("COMMIT", [])?;
                if deleted > 0 {
                    self.generation.fetch_add(1, Ordering::Release);
                }
                Ok(deleted)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }

    fn row_to_projection(row: &Row<'_>) -> rusqlite::Result<Projection> {
        let status: String = row.get(9)?;
        let source: String = row.get(10)?;
        let raw_json: String = row.get(13)?;
        Ok(Projection {
            projection_id: row.get(0)?,
            league_id: row.get(1)?,
            league_name: row.get(2)?,
            player_id: row.get(3)?,
            player_name: row.get(4)?,
            team: row.get(5)?,
            stat_type: row.get(6)?,
            line_score: row.get(7)?,
            start_time: DateTime::from_timestamp(row.get::<_, i64>(8)?, 0).unwrap_or_default(),
            status: ProjectionStatus::parse(&status),
            source: ProjectionSource::parse(&source),
            fetched_at: DateTime::from_timestamp(row.get::<_, i64>(11)?, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.get::<_, i64>(12)?, 0).unwrap_or_default(),
            raw: serde_json::from_str(&raw_json).unwrap_or(serde_json::Value::Null),
        })
    }
}
