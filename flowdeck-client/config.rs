use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8009/v1";
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub state_dir: PathBuf,
    pub session: SessionConfig,
    pub log_capacity: usize,
    pub save_debounce: Duration,
    pub sentry_dsn: Option<String>,
    pub environment: String,
}

/// Timing knobs for task stream sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long `open()` waits for the socket before letting the caller go on.
    pub connect_timeout: Duration,
    /// Consecutive failed attempts tolerated before the session gives up.
    pub max_reconnects: u32,
    /// Delay before reconnect attempt `n` is `n * reconnect_backoff`.
    pub reconnect_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1500),
            max_reconnects: 3,
            reconnect_backoff: Duration::from_millis(1000),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(RawValues {
            api_url: std::env::var("FLOWDECK_API_URL").ok(),
            state_dir: std::env::var("FLOWDECK_STATE_DIR").ok(),
            connect_timeout_ms: std::env::var("FLOWDECK_CONNECT_TIMEOUT_MS").ok(),
            max_reconnects: std::env::var("FLOWDECK_MAX_RECONNECTS").ok(),
            reconnect_backoff_ms: std::env::var("FLOWDECK_RECONNECT_BACKOFF_MS").ok(),
            log_capacity: std::env::var("FLOWDECK_LOG_CAPACITY").ok(),
            save_debounce_ms: std::env::var("FLOWDECK_SAVE_DEBOUNCE_MS").ok(),
            sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            environment: std::env::var("ENVIRONMENT").ok(),
        })
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(raw: RawValues) -> Self {
        let defaults = SessionConfig::default();

        let api_url = non_empty(raw.api_url)
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let state_dir = non_empty(raw.state_dir)
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir);

        let session = SessionConfig {
            connect_timeout: parse_millis(raw.connect_timeout_ms)
                .unwrap_or(defaults.connect_timeout),
            max_reconnects: raw
                .max_reconnects
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_reconnects),
            reconnect_backoff: parse_millis(raw.reconnect_backoff_ms)
                .unwrap_or(defaults.reconnect_backoff),
        };

        let log_capacity = raw
            .log_capacity
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_LOG_CAPACITY);

        let save_debounce =
            parse_millis(raw.save_debounce_ms).unwrap_or(Duration::from_millis(300));

        let environment = non_empty(raw.environment).unwrap_or_else(|| "local".to_string());

        Config {
            api_url,
            state_dir,
            session,
            log_capacity,
            save_debounce,
            sentry_dsn: non_empty(raw.sentry_dsn),
            environment,
        }
    }
}

/// Unparsed configuration values, one per environment variable.
#[derive(Debug, Default, Clone)]
pub struct RawValues {
    pub api_url: Option<String>,
    pub state_dir: Option<String>,
    pub connect_timeout_ms: Option<String>,
    pub max_reconnects: Option<String>,
    pub reconnect_backoff_ms: Option<String>,
    pub log_capacity: Option<String>,
    pub save_debounce_ms: Option<String>,
    pub sentry_dsn: Option<String>,
    pub environment: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn parse_millis(value: Option<String>) -> Option<Duration> {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".flowdeck")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::from_raw_values(RawValues::default());
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.log_capacity, DEFAULT_LOG_CAPACITY);
        assert_eq!(config.save_debounce, Duration::from_millis(300));
        assert!(config.state_dir.ends_with(".flowdeck"));
    }

    #[test]
    fn test_config_api_url_trailing_slash_trimmed() {
        let config = Config::from_raw_values(RawValues {
            api_url: Some("http://localhost:9000/v1/".into()),
            ..Default::default()
        });
        assert_eq!(config.api_url, "http://localhost:9000/v1");
    }

    #[test]
    fn test_config_invalid_numbers_use_defaults() {
        let config = Config::from_raw_values(RawValues {
            connect_timeout_ms: Some("soon".into()),
            max_reconnects: Some("-1".into()),
            log_capacity: Some("0".into()),
            ..Default::default()
        });
        assert_eq!(config.session.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.session.max_reconnects, 3);
        assert_eq!(config.log_capacity, DEFAULT_LOG_CAPACITY);
    }

    #[test]
    fn test_config_session_overrides() {
        let config = Config::from_raw_values(RawValues {
            connect_timeout_ms: Some("250".into()),
            max_reconnects: Some("5".into()),
            reconnect_backoff_ms: Some("40".into()),
            ..Default::default()
        });
        assert_eq!(config.session.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.session.max_reconnects, 5);
        assert_eq!(config.session.reconnect_backoff, Duration::from_millis(40));
    }

    #[test]
    fn test_config_empty_sentry_dsn_is_none() {
        let config = Config::from_raw_values(RawValues {
            sentry_dsn: Some("".into()),
            ..Default::default()
        });
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn test_config_custom_environment_and_state_dir() {
        let config = Config::from_raw_values(RawValues {
            environment: Some("production".into()),
            state_dir: Some("/tmp/fd".into()),
            ..Default::default()
        });
        assert_eq!(config.environment, "production");
        assert_eq!(config.state_dir, PathBuf::from("/tmp/fd"));
    }
}
