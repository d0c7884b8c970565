use std::path::PathBuf;
use std::time::Duration;

/// Relay URL: checked at compile time via env!, falls back to runtime env var, then default
const DEFAULT_RELAY_URL: &str = "ws://localhost:9001";

/// Conversation-list re-fetch interval while the event channel is down
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket relay endpoint for the event channel
    pub relay_url: String,
    /// Polling-fallback interval
    pub poll_interval: Duration,
    /// Where the read-state ledger lives; `None` keeps it in memory
    pub ledger_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        // Priority: build-time env -> runtime env -> default
        let build_time_url = option_env!("RIPPLE_RELAY_URL");
        let runtime_url = std::env::var("RIPPLE_RELAY_URL").ok();

        let relay_url = build_time_url
            .map(String::from)
            .or(runtime_url)
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

        Self {
            relay_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ledger_path: None,
        }
    }
}
