use std::time::Duration;

/// Per-session relay policy. Fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Retries after the first attempt; `N` allows `N + 1` attempts in total.
    pub max_retries: u32,
    /// Skip capability and deny-list gating entirely.
    pub bypass_capability_check: bool,
    /// Retry `k` (0-based) sleeps `(k + 1) * backoff_unit` first.
    pub backoff_unit: Duration,
    /// Deadline for a single upstream attempt. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Name and version announced to the upstream during the handshake.
    pub client_name: String,
    pub client_version: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            bypass_capability_check: false,
            backoff_unit: Duration::from_millis(500),
            request_timeout: Some(Duration::from_secs(60)),
            client_name: "mcp-relay".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl SessionConfig {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt.saturating_add(1))
    }
}
