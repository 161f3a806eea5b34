//! Per-host request governor.
//!
//! Enforces a minimum spacing between successive upstream requests and an
//! exponential backoff schedule across failures. One shared instance per
//! upstream host; all league requests draw from the same budget. State is
//! process-memory only.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

struct GovernorState {
    last_request_at: Option<Instant>,
    next_allowed_at: Option<Instant>,
    consecutive_failures: u32,
    current_backoff: Option<Duration>,
    // Wall-clock mirror of next_allowed_at for status reporting.
    next_allowed_wall: Option<DateTime<Utc>>,
}

pub struct RateGovernor {
    min_spacing: Duration,
    backoff_schedule: Vec<Duration>,
    state: Mutex<GovernorState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernorSnapshot {
    pub next_allowed_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub current_backoff_s: Option<u64>,
}

impl RateGovernor {
    pub fn new(min_spacing: Duration, backoff_schedule: Vec<Duration>) -> Self {
        assert!(!backoff_schedule.is_empty(), "backoff schedule cannot be empty");
        Self {
            min_spacing,
            backoff_schedule,
            state: Mutex::new(GovernorState {
                last_request_at: None,
                next_allowed_at: None,
                consecutive_failures: 0,
                current_backoff: None,
                next_allowed_wall: None,
            }),
        }
    }

    /// Number of attempts a caller gets before abandoning a request for the
    /// cycle: one initial try plus one retry per backoff step.
    pub fn max_attempts(&self) -> u32 {
        self.backoff_schedule.len() as u32
    }

    /// Waits until a request to the host may proceed, then claims the slot.
    /// When two callers race, one claims the slot and the other re-waits on
    /// the updated spacing.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();

                let mut earliest = now;
                if let Some(last) = state.last_request_at {
                    earliest = earliest.max(last + self.min_spacing);
                }
                if let Some(next) = state.next_allowed_at {
                    earliest = earliest.max(next);
                }

                if earliest <= now {
                    state.last_request_at = Some(now);
                    None
                } else {
                    Some(earliest - now)
                }
            };

            match wait {
                None => return,
                Some(d) => {
                    debug!(wait_ms = d.as_millis() as u64, "rate governor holding request");
                    tokio::time::sleep(d).await;
                }
            }
        }
    }

    /// Records a failed attempt and schedules the next allowed instant per
    /// the backoff schedule. Returns the applied backoff.
    pub fn record_failure(&self) -> Duration {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        let idx = (state.consecutive_failures as usize - 1).min(self.backoff_schedule.len() - 1);
        let backoff = self.backoff_schedule[idx];

        state.current_backoff = Some(backoff);
        state.next_allowed_at = Some(Instant::now() + backoff);
        state.next_allowed_wall = Some(
            Utc::now()
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        backoff
    }

    /// Resets the backoff after a successful request. Minimum spacing still
    /// applies from the moment the slot was claimed.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.current_backoff = None;
        state.next_allowed_at = None;
        state.next_allowed_wall = None;
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let state = self.state.lock();
        GovernorSnapshot {
            next_allowed_at: state.next_allowed_wall,
            consecutive_failures: state.consecutive_failures,
            current_backoff_s: state.current_backoff.map(|d| d.as_secs()),
        }
    }
}
