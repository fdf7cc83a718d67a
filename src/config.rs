//! Connection configuration and environment-driven binary configuration.
//!
//! [`ConnectionConfig`] describes one transport session (broker URL, connect
//! headers, heart-beats, reconnect policy). [`ConnectionOptions`] is the
//! smaller set of knobs callers pass to
//! [`crate::service::ConnectionManager::create_connection`]; they are merged
//! into the config before the connection is built.
//!
//! [`LinkConfig`] follows 12-factor style for the `realtime-link` binary: all
//! settings come from environment variables (or a `.env` file via `dotenvy`).

use std::collections::BTreeMap;
use std::time::Duration;

/// Automatic reconnection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether dropped sessions are re-established automatically.
    pub enabled: bool,
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound for any single backoff delay.
    pub max_delay: Duration,
    /// Number of reconnects scheduled before giving up.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Returns the backoff delay for the zero-based `attempt`:
    /// `min(base_delay * 2^attempt, max_delay)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Returns `true` if another reconnect may be scheduled after
    /// `attempts` reconnects have already been scheduled.
    #[must_use]
    pub const fn allows(&self, attempts: u32) -> bool {
        self.enabled && attempts < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

/// Transport configuration for a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Broker endpoint, e.g. `ws://localhost:15674/ws`.
    pub url: String,
    /// Extra headers sent on the STOMP `CONNECT` frame (login, passcode, ...).
    pub connect_headers: BTreeMap<String, String>,
    /// Expected interval between inbound heart-beats. Zero disables
    /// heartbeat monitoring.
    pub heartbeat_incoming: Duration,
    /// Interval between outbound heart-beats. Zero disables them.
    pub heartbeat_outgoing: Duration,
    /// Reconnect policy.
    pub reconnect: ReconnectPolicy,
    /// How long a dial plus handshake may take before it is abandoned.
    pub connect_timeout: Duration,
    /// Log individual frames at `debug` instead of `trace`.
    pub debug: bool,
}

impl ConnectionConfig {
    /// Creates a config for `url` with default heart-beats and reconnect
    /// policy.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_headers: BTreeMap::new(),
            heartbeat_incoming: Duration::from_millis(10_000),
            heartbeat_outgoing: Duration::from_millis(10_000),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_millis(10_000),
            debug: false,
        }
    }

    /// Adds a `CONNECT` header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_headers.insert(name.into(), value.into());
        self
    }

    /// Merges caller-provided [`ConnectionOptions`] into this config. Only
    /// options that are set override the config.
    #[must_use]
    pub fn merge_options(mut self, options: &ConnectionOptions) -> Self {
        if let Some(enabled) = options.auto_reconnect {
            self.reconnect.enabled = enabled;
        }
        if let Some(max_attempts) = options.max_reconnect_attempts {
            self.reconnect.max_attempts = max_attempts;
        }
        if let Some(delay) = options.reconnect_delay {
            self.reconnect.base_delay = delay;
        }
        if let Some(interval) = options.heartbeat_interval {
            self.heartbeat_incoming = interval;
            self.heartbeat_outgoing = interval;
        }
        self
    }
}

/// Per-connection overrides accepted by the connection manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Overrides [`ReconnectPolicy::enabled`].
    pub auto_reconnect: Option<bool>,
    /// Overrides [`ReconnectPolicy::max_attempts`].
    pub max_reconnect_attempts: Option<u32>,
    /// Overrides [`ReconnectPolicy::base_delay`].
    pub reconnect_delay: Option<Duration>,
    /// Overrides both heart-beat directions.
    pub heartbeat_interval: Option<Duration>,
}

/// Configuration of the `realtime-link` binary.
///
/// Loaded once at startup via [`LinkConfig::from_env`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Connection id registered with the manager.
    pub connection_id: String,
    /// Human-readable connection name.
    pub connection_name: String,
    /// Topics mirrored into live datasets.
    pub topics: Vec<String>,
    /// Row key field used by the reconciler.
    pub key_field: String,
    /// Optional delivery throttle applied to every topic.
    pub throttle: Option<Duration>,
    /// Capacity of the manager's event bus.
    pub event_bus_capacity: usize,
    /// Transport configuration.
    pub connection: ConnectionConfig,
}

impl LinkConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set. Calls
    /// `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `TOPICS` resolves to an empty list.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let url = std::env::var("BROKER_URL")
            .unwrap_or_else(|_| "ws://localhost:15674/ws".to_string());
        let connection_id =
            std::env::var("CONNECTION_ID").unwrap_or_else(|_| "default".to_string());
        let connection_name =
            std::env::var("CONNECTION_NAME").unwrap_or_else(|_| connection_id.clone());

        let topics: Vec<String> = std::env::var("TOPICS")
            .unwrap_or_else(|_| "/topic/prices".to_string())
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect();
        if topics.is_empty() {
            return Err("TOPICS must name at least one destination".into());
        }

        let key_field = std::env::var("KEY_FIELD").unwrap_or_else(|_| "id".to_string());
        let throttle_ms: u64 = parse_env("THROTTLE_MS", 0);
        let throttle = (throttle_ms > 0).then(|| Duration::from_millis(throttle_ms));

        let reconnect = ReconnectPolicy {
            enabled: parse_env_bool("RECONNECT_ENABLED", true),
            base_delay: Duration::from_millis(parse_env("RECONNECT_BASE_DELAY_MS", 1_000)),
            max_delay: Duration::from_millis(parse_env("RECONNECT_MAX_DELAY_MS", 30_000)),
            max_attempts: parse_env("RECONNECT_MAX_ATTEMPTS", 10),
        };

        let mut connection = ConnectionConfig::new(url);
        connection.heartbeat_incoming =
            Duration::from_millis(parse_env("HEARTBEAT_INCOMING_MS", 10_000));
        connection.heartbeat_outgoing =
            Duration::from_millis(parse_env("HEARTBEAT_OUTGOING_MS", 10_000));
        connection.connect_timeout =
            Duration::from_millis(parse_env("CONNECT_TIMEOUT_MS", 10_000));
        connection.reconnect = reconnect;
        connection.debug = parse_env_bool("DEBUG", false);
        if let Ok(login) = std::env::var("CONNECT_LOGIN") {
            connection = connection.with_header("login", login);
        }
        if let Ok(passcode) = std::env::var("CONNECT_PASSCODE") {
            connection = connection.with_header("passcode", passcode);
        }

        Ok(Self {
            connection_id,
            connection_name,
            topics,
            key_field,
            throttle,
            event_bus_capacity: parse_env("EVENT_BUS_CAPACITY", 10_000),
            connection,
        })
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true" | "1") => true,
        Some("false" | "0") => false,
        _ => default,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            max_attempts: 10,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy(1_000, 30_000);
        let delays: Vec<u128> = (0..8).map(|a| p.delay_for(a).as_millis()).collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]
        );
    }

    #[test]
    fn backoff_saturates_on_huge_attempts() {
        let p = policy(1_000, 30_000);
        assert_eq!(p.delay_for(40), Duration::from_millis(30_000));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn allows_respects_budget_and_flag() {
        let mut p = policy(1_000, 30_000);
        p.max_attempts = 2;
        assert!(p.allows(0));
        assert!(p.allows(1));
        assert!(!p.allows(2));
        p.enabled = false;
        assert!(!p.allows(0));
    }

    #[test]
    fn merge_options_overrides_only_set_fields() {
        let base = ConnectionConfig::new("ws://broker/ws");
        let merged = base.clone().merge_options(&ConnectionOptions {
            auto_reconnect: Some(false),
            max_reconnect_attempts: None,
            reconnect_delay: Some(Duration::from_millis(250)),
            heartbeat_interval: Some(Duration::from_millis(4_000)),
        });
        assert!(!merged.reconnect.enabled);
        assert_eq!(merged.reconnect.max_attempts, base.reconnect.max_attempts);
        assert_eq!(merged.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(merged.heartbeat_incoming, Duration::from_millis(4_000));
        assert_eq!(merged.heartbeat_outgoing, Duration::from_millis(4_000));
        assert_eq!(merged.url, "ws://broker/ws");
    }

    #[test]
    fn with_header_accumulates() {
        let cfg = ConnectionConfig::new("ws://broker/ws")
            .with_header("login", "guest")
            .with_header("passcode", "guest");
        assert_eq!(cfg.connect_headers.len(), 2);
        assert_eq!(
            cfg.connect_headers.get("login").map(String::as_str),
            Some("guest")
        );
    }

    #[test]
    fn parse_env_falls_back_on_missing() {
        let value: u64 = parse_env("REALTIME_LINK_TEST_SURELY_UNSET", 42);
        assert_eq!(value, 42);
        assert!(parse_env_bool("REALTIME_LINK_TEST_SURELY_UNSET", true));
    }
}
