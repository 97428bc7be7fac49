//! Server configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::BufferPoolKind;
use crate::buffer_pool::DEFAULT_BUFFER_SIZE;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Server configuration.
///
/// Build from [`Default`] or [`ServerConfig::from_env`] and adjust with the
/// `with_*` methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Whether clients may create and restore sessions.
    pub sessions_enabled: bool,
    /// Maximum concurrent connections per session key. 0 means unlimited.
    pub max_session_connections: usize,
    /// Per-frame read deadline, renewed after each frame.
    pub read_timeout: Duration,
    /// Capacity of each inbound message buffer, i.e. the largest frame
    /// accepted.
    pub message_buffer_size: usize,
    pub buffer_pool: BufferPoolKind,
    /// Default handler concurrency per connection. 0 means unlimited, 1
    /// serializes handlers.
    pub connection_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sessions_enabled: true,
            max_session_connections: 0,
            read_timeout: DEFAULT_READ_TIMEOUT,
            message_buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_pool: BufferPoolKind::FreeList,
            connection_concurrency: 0,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TETHER_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `TETHER_SESSIONS_ENABLED` | `sessions_enabled` |
    /// | `TETHER_MAX_SESSION_CONNECTIONS` | `max_session_connections` |
    /// | `TETHER_READ_TIMEOUT_MS` | `read_timeout` |
    /// | `TETHER_MESSAGE_BUFFER_SIZE` | `message_buffer_size` |
    /// | `TETHER_BUFFER_POOL` | `buffer_pool` (`free_list` or `object_pool`) |
    /// | `TETHER_CONNECTION_CONCURRENCY` | `connection_concurrency` |
    ///
    /// Unparseable values are skipped with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = parse_knob(&lookup, "TETHER_SESSIONS_ENABLED", parse_bool) {
            config.sessions_enabled = v;
        }
        if let Some(v) = parse_knob(&lookup, "TETHER_MAX_SESSION_CONNECTIONS", usize::from_str) {
            config.max_session_connections = v;
        }
        if let Some(v) = parse_knob(&lookup, "TETHER_READ_TIMEOUT_MS", u64::from_str) {
            config.read_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_knob(&lookup, "TETHER_MESSAGE_BUFFER_SIZE", usize::from_str) {
            config.message_buffer_size = v;
        }
        if let Some(v) = parse_knob(&lookup, "TETHER_BUFFER_POOL", BufferPoolKind::from_str) {
            config.buffer_pool = v;
        }
        if let Some(v) = parse_knob(&lookup, "TETHER_CONNECTION_CONCURRENCY", usize::from_str) {
            config.connection_concurrency = v;
        }
        config
    }

    #[must_use]
    pub fn with_sessions_enabled(mut self, enabled: bool) -> Self {
        self.sessions_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_max_session_connections(mut self, max: usize) -> Self {
        self.max_session_connections = max;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_message_buffer_size(mut self, size: usize) -> Self {
        self.message_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_buffer_pool(mut self, kind: BufferPoolKind) -> Self {
        self.buffer_pool = kind;
        self
    }

    #[must_use]
    pub fn with_connection_concurrency(mut self, limit: usize) -> Self {
        self.connection_concurrency = limit;
        self
    }
}

fn parse_knob<T, E: std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Result<T, E>,
) -> Option<T> {
    let raw = lookup(name)?;
    match parse(raw.trim()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, error = %e, "ignoring malformed setting");
            None
        }
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got {other:?}")),
    }
}

/// Per-connection options, overriding [`ServerConfig`] defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Handler concurrency for this connection. 0 means unlimited.
    pub concurrency: usize,
}

impl From<&ServerConfig> for ConnectionOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            concurrency: config.connection_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert!(config.sessions_enabled);
        assert_eq!(config.max_session_connections, 0);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.message_buffer_size, 64 * 1024);
        assert_eq!(config.buffer_pool, BufferPoolKind::FreeList);
        assert_eq!(config.connection_concurrency, 0);
        assert_eq!(from_vars(&[]), config);
    }

    #[test]
    fn env_overrides() {
        let config = from_vars(&[
            ("TETHER_SESSIONS_ENABLED", "false"),
            ("TETHER_MAX_SESSION_CONNECTIONS", "3"),
            ("TETHER_READ_TIMEOUT_MS", "1500"),
            ("TETHER_MESSAGE_BUFFER_SIZE", "4096"),
            ("TETHER_BUFFER_POOL", "object_pool"),
            ("TETHER_CONNECTION_CONCURRENCY", " 8 "),
        ]);
        assert!(!config.sessions_enabled);
        assert_eq!(config.max_session_connections, 3);
        assert_eq!(config.read_timeout, Duration::from_millis(1500));
        assert_eq!(config.message_buffer_size, 4096);
        assert_eq!(config.buffer_pool, BufferPoolKind::ObjectPool);
        assert_eq!(config.connection_concurrency, 8);
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let config = from_vars(&[
            ("TETHER_SESSIONS_ENABLED", "maybe"),
            ("TETHER_MAX_SESSION_CONNECTIONS", "-1"),
            ("TETHER_BUFFER_POOL", "slab"),
        ]);
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn builder() {
        let config = ServerConfig::default()
            .with_sessions_enabled(false)
            .with_max_session_connections(2)
            .with_read_timeout(Duration::from_millis(10))
            .with_message_buffer_size(128)
            .with_buffer_pool(BufferPoolKind::ObjectPool)
            .with_connection_concurrency(1);
        assert_eq!(ConnectionOptions::from(&config).concurrency, 1);
        assert_eq!(config.message_buffer_size, 128);
    }
}
