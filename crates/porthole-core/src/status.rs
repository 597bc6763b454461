//! Status polling of the ngrok agent's local API.
//!
//! The agent serves `GET /api/tunnels` on `127.0.0.1:4040` once it has come
//! up; readiness after spawn is asynchronous, so callers warm up through the
//! bounded retry wrapper instead of a fixed sleep.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

/// Default base URL of the agent's local status API.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:4040";

/// Errors from status API queries.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// The connection itself could not be established (agent not listening
    /// yet, or already stopped).
    #[error("tunnel agent unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    /// The agent answered with a non-success HTTP status.
    #[error("status query failed with HTTP {status}")]
    QueryFailed { status: u16 },

    /// The agent answered 200 with a body that does not decode.
    #[error("malformed agent response: {0}")]
    Malformed(#[source] reqwest::Error),
}

/// Reported state of the active tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    #[default]
    Unknown,
    Online,
}

impl TunnelState {
    fn from_report(status: &str) -> Self {
        if status.eq_ignore_ascii_case("online") {
            Self::Online
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Online => write!(f, "online"),
        }
    }
}

/// Snapshot of the first active tunnel, recomputed on each poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    /// Publicly reachable URL of the tunnel.
    pub public_url: Option<String>,
    /// HTTP requests served through the tunnel so far.
    pub request_count: u64,
    /// State the agent reports for the tunnel.
    pub state: TunnelState,
}

/// Bounded retry configuration for the warm-up poll.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Maximum number of queries (at least 1).
    pub max_attempts: u32,
    /// Sleep between attempts (not after the last).
    pub delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

// Wire shape of the agent's tunnel listing. Only the fields we consume.
#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<TunnelEntry>,
}

#[derive(Debug, Deserialize)]
struct TunnelEntry {
    public_url: Option<String>,
    status: Option<String>,
    metrics: Option<Metrics>,
}

#[derive(Debug, Deserialize)]
struct Metrics {
    http: Option<HttpMetrics>,
}

#[derive(Debug, Deserialize)]
struct HttpMetrics {
    #[serde(default)]
    count: u64,
}

/// Client for the agent's local status API.
#[derive(Debug, Clone)]
pub struct StatusClient {
    http: reqwest::Client,
    base_url: String,
}

impl StatusClient {
    /// Client against the default local agent address.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_API_URL)
    }

    /// Client against a specific base URL (e.g. a test server).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn api_url(&self) -> String {
        format!("{}/api/tunnels", self.base_url)
    }

    /// Fetch the listing of active tunnels.
    async fn fetch_tunnels(&self) -> Result<Vec<TunnelEntry>, StatusError> {
        let resp = self
            .http
            .get(self.api_url())
            .send()
            .await
            .map_err(StatusError::Unreachable)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(StatusError::QueryFailed {
                status: status.as_u16(),
            });
        }

        let list: TunnelList = resp.json().await.map_err(StatusError::Malformed)?;
        Ok(list.tunnels)
    }

    /// Fetch the public URL of the active tunnel.
    ///
    /// `Ok(None)` when the agent responds but reports zero active tunnels.
    pub async fn fetch_url(&self) -> Result<Option<String>, StatusError> {
        let tunnels = self.fetch_tunnels().await?;
        let Some(first) = tunnels.into_iter().next() else {
            debug!("No active tunnels reported");
            return Ok(None);
        };
        Ok(first.public_url)
    }

    /// Fetch URL, request count, and reported state of the active tunnel.
    ///
    /// Only the first tunnel entry is consulted; `Ok(None)` when there is
    /// none.
    pub async fn fetch_info(&self) -> Result<Option<TunnelStatus>, StatusError> {
        let tunnels = self.fetch_tunnels().await?;
        let Some(first) = tunnels.into_iter().next() else {
            debug!("No active tunnels reported");
            return Ok(None);
        };

        let request_count = first
            .metrics
            .and_then(|m| m.http)
            .map_or(0, |http| http.count);
        let state = first
            .status
            .as_deref()
            .map_or(TunnelState::Unknown, TunnelState::from_report);

        Ok(Some(TunnelStatus {
            public_url: first.public_url,
            request_count,
            state,
        }))
    }

    /// Poll for the public URL until the agent is ready.
    ///
    /// Queries up to `policy.max_attempts` times, sleeping `policy.delay`
    /// between attempts. Errors are swallowed as "not ready yet": the agent's
    /// API comes up an unpredictable interval after the process spawn, and
    /// polling is the only way to synchronize on it. Returns `None` when every
    /// attempt yields no URL.
    pub async fn fetch_url_with_retry(&self, policy: &PollPolicy) -> Option<String> {
        let attempts = policy.max_attempts.max(1);
        for attempt in 0..attempts {
            match self.fetch_url().await {
                Ok(Some(url)) => {
                    debug!(attempt, %url, "Tunnel URL resolved");
                    return Some(url);
                }
                Ok(None) => {
                    debug!(attempt, "Agent up, no active tunnel yet");
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Status API not ready");
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }
        warn!(attempts, "Tunnel URL not available after warm-up poll");
        None
    }
}

impl Default for StatusClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_poll_policy() {
        let policy = PollPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.delay, Duration::from_millis(500));
    }

    #[test]
    fn state_parses_agent_report() {
        assert_eq!(TunnelState::from_report("online"), TunnelState::Online);
        assert_eq!(TunnelState::from_report("Online"), TunnelState::Online);
        assert_eq!(TunnelState::from_report("closed"), TunnelState::Unknown);
        assert_eq!(TunnelState::from_report(""), TunnelState::Unknown);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = StatusClient::with_base_url("http://127.0.0.1:4040/");
        assert_eq!(client.api_url(), "http://127.0.0.1:4040/api/tunnels");
    }
}
