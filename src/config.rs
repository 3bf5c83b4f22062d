// Call configuration.
// Verbose logging is only the default in debug builds.

use crate::error::Result;
use crate::peer::types::IceServer;
use serde::Deserialize;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Delay between the end of one event fetch and the start of the next.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive failed fetches after which polling gives up.
pub const MAX_FETCH_FAILURES: u32 = 10;

/// Per-participant cap on candidates buffered before a remote description exists.
pub const MAX_EARLY_CANDIDATES: usize = 128;

/// Room lifetime requested on creation (30 days).
pub const DEFAULT_ROOM_TTL_SECS: u64 = 2_592_000;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    /// Signaling API host, e.g. `kurento.example.com`.
    pub api_server: String,
    /// Sent verbatim as the `Authorization` header.
    pub token: Option<String>,
    /// Use https rather than http.
    pub secure: bool,
    pub poll_interval_ms: u64,
    pub max_fetch_failures: u32,
    pub max_early_candidates: usize,
    pub room_ttl_secs: u64,
    /// Ask for remote audio when subscribing.
    pub enable_audio: bool,
    /// Ask for remote video when subscribing.
    pub enable_video: bool,
    pub ice_servers: Vec<IceServer>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            api_server: String::new(),
            token: None,
            secure: true,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            max_fetch_failures: MAX_FETCH_FAILURES,
            max_early_candidates: MAX_EARLY_CANDIDATES,
            room_ttl_secs: DEFAULT_ROOM_TTL_SECS,
            enable_audio: true,
            enable_video: true,
            ice_servers: Vec::new(),
        }
    }
}

impl CallConfig {
    pub fn new(api_server: impl Into<String>, token: Option<String>) -> Self {
        Self {
            api_server: api_server.into(),
            token,
            ..Default::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.api_server.trim_end_matches('/'))
    }
}
