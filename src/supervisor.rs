//! Process lifecycle.
//!
//! Owns the cancellation token handed to every background task, binds the
//! HTTP listener on the first free port in the configured range, and winds
//! tasks down with a grace period on shutdown.

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bind the first available port in the inclusive range. The frontend's
/// discovery protocol sweeps the same range, so any port in it is reachable.
pub async fn bind_port_in_range(range: (u16, u16)) -> Result<(TcpListener, u16)> {
    let (lo, hi) = range;
    for port in lo..=hi {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                info!(port, "listener bound");
                return Ok((listener, port));
            }
            Err(e) => {
                info!(port, error = %e, "port unavailable, trying next");
            }
        }
    }
    bail!("no free port in range {lo}-{hi}")
}

pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a named background task tied to the supervisor's lifetime.
    pub fn spawn<F>(&mut self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name.to_string(), tokio::spawn(future)));
    }

    /// Cancel everything and wait up to `grace` for tasks to finish; anything
    /// still running after that is aborted.
    pub async fn shutdown(self, grace: Duration) {
        info!(grace_s = grace.as_secs(), "shutting down background tasks");
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        for (name, mut handle) in self.tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(task = %name, error = %e, "background task panicked"),
                Err(_) => {
                    warn!(task = %name, "background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("shutdown complete");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
