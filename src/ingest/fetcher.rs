//! Upstream HTTP fetcher.
//!
//! Single place that talks to the projections provider. Executes one GET with
//! browser-like headers and classifies the outcome so callers can branch on
//! rate-limit / blocked / transport / parse without string matching. No other
//! component calls the upstream directly.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

pub const UPSTREAM_API_BASE: &str = "https://api.prizepicks.com";
pub const UPSTREAM_SITE: &str = "https://app.prizepicks.com/";

/// The minimum headers the public endpoint needs to answer with JSON.
/// This is not an evasion mechanism; backoff handles everything else.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Classified result of one upstream GET.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Got a response we could classify as payload. `status` may still be a
    /// 4xx the caller wants to inspect (e.g. 404 on a league); the body is
    /// `Value::Null` when a non-2xx response had no JSON body.
    Ok { body: Value, status: u16 },
    /// HTTP 429, or a 200 whose body is an anti-bot challenge page.
    RateLimited { retry_after: Option<u64> },
    /// HTTP 403 carrying challenge markers.
    Blocked,
    /// Network, TLS, DNS, timeout, or 5xx.
    TransportError(String),
    /// 2xx whose body is not valid JSON.
    ParseError(String),
}

impl FetchOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchOutcome::Ok { .. } => "ok",
            FetchOutcome::RateLimited { .. } => "rate_limited",
            FetchOutcome::Blocked => "blocked",
            FetchOutcome::TransportError(_) => "transport_error",
            FetchOutcome::ParseError(_) => "parse_error",
        }
    }
}

/// Seam between the ingestion engine and the wire. The production
/// implementation is [`HttpFetcher`]; tests script their own.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch_projections(&self, league_id: &str) -> FetchOutcome;
    async fn fetch_leagues(&self) -> FetchOutcome;
}

pub struct HttpFetcher {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, UPSTREAM_API_BASE.to_string())
    }

    pub fn with_base_url(client: Client, base_url: String) -> Self {
        Self {
            client,
            base_url,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Canonical query for the projections endpoint of one league.
    pub fn projections_query(league_id: &str) -> Vec<(String, String)> {
        vec![
            ("include".to_string(), "new_player,league,stat_type".to_string()),
            ("per_page".to_string(), "250".to_string()),
            ("single_stat".to_string(), "true".to_string()),
            ("league_id".to_string(), league_id.to_string()),
        ]
    }

    pub fn projections_url(&self) -> String {
        format!("{}/projections", self.base_url)
    }

    pub fn leagues_url(&self) -> String {
        format!("{}/leagues", self.base_url)
    }

    pub async fn get_json(&self, url: &str, query: &[(String, String)]) -> FetchOutcome {
        let request = self
            .client
            .get(url)
            .query(query)
            .timeout(self.timeout)
            .header(header::USER_AGENT, BROWSER_USER_AGENT)
            .header(header::ACCEPT, "application/json")
            .header(header::ACCEPT_LANGUAGE, ACCEPT_LANGUAGE)
            .header(header::REFERER, UPSTREAM_SITE);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url, error = %e, "upstream request failed");
                return FetchOutcome::TransportError(e.to_string());
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return FetchOutcome::RateLimited { retry_after };
        }
        if status.is_server_error() {
            return FetchOutcome::TransportError(format!("upstream {}", status.as_u16()));
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return FetchOutcome::TransportError(e.to_string()),
        };

        if status == StatusCode::FORBIDDEN {
            if looks_like_challenge(&content_type, &body) {
                return FetchOutcome::Blocked;
            }
            warn!(url, "upstream 403 without challenge markers");
        }

        // A 200 serving the challenge interstitial is a rate limit in
        // disguise, not a payload.
        if status.is_success() && looks_like_challenge(&content_type, &body) {
            return FetchOutcome::RateLimited { retry_after };
        }

        match serde_json::from_str::<Value>(&body) {
            Ok(parsed) => FetchOutcome::Ok {
                body: parsed,
                status: status.as_u16(),
            },
            Err(e) if status.is_success() => {
                let sample: String = body.chars().take(200).collect();
                debug!(url, sample, "unparsable 2xx body");
                FetchOutcome::ParseError(e.to_string())
            }
            // Non-2xx with a non-JSON body: surface the status, callers decide.
            Err(_) => FetchOutcome::Ok {
                body: Value::Null,
                status: status.as_u16(),
            },
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpFetcher {
    async fn fetch_projections(&self, league_id: &str) -> FetchOutcome {
        self.get_json(&self.projections_url(), &Self::projections_query(league_id))
            .await
    }

    async fn fetch_leagues(&self) -> FetchOutcome {
        self.get_json(&self.leagues_url(), &[]).await
    }
}

/// Known marker strings from Cloudflare-style interstitials.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "challenge-platform",
    "Just a moment",
    "Attention Required!",
    "_cf_chl_opt",
];

pub fn looks_like_challenge(content_type: &str, body: &str) -> bool {
    if !content_type.to_ascii_lowercase().contains("text/html") {
        return false;
    }
    CHALLENGE_MARKERS.iter().any(|m| body.contains(m))
}
