use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub dispatch_api_url: String,
    pub dispatch_socket_url: String,
    pub api_token: Option<String>,
    pub session: SessionConfig,
}

/// Timings and bounds for one driver session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub location_push_interval: Duration,
    pub degraded_after: Duration,
    pub location_timeout: Duration,
    pub request_timeout: Duration,
    /// `None` disables background refreshes of the active order.
    pub order_poll_interval: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    pub event_buffer_size: usize,
    pub order_history_limit: usize,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            location_push_interval: Duration::from_secs(60),
            degraded_after: Duration::from_secs(90),
            location_timeout: Duration::from_millis(5_000),
            request_timeout: Duration::from_millis(10_000),
            order_poll_interval: Some(Duration::from_secs(15)),
            reconnect: ReconnectPolicy::default(),
            event_buffer_size: 256,
            order_history_limit: 50,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(15_000),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let order_poll_secs: u64 = parse_or_default("ORDER_POLL_INTERVAL_SECS", 15)?;

        let session = SessionConfig {
            heartbeat_interval: Duration::from_secs(positive("HEARTBEAT_INTERVAL_SECS", 30)?),
            location_push_interval: Duration::from_secs(positive(
                "LOCATION_PUSH_INTERVAL_SECS",
                60,
            )?),
            degraded_after: Duration::from_secs(positive("HEARTBEAT_DEGRADED_AFTER_SECS", 90)?),
            location_timeout: Duration::from_millis(positive("LOCATION_TIMEOUT_MS", 5_000)?),
            request_timeout: Duration::from_millis(positive("REQUEST_TIMEOUT_MS", 10_000)?),
            order_poll_interval: (order_poll_secs > 0)
                .then(|| Duration::from_secs(order_poll_secs)),
            reconnect: ReconnectPolicy {
                max_attempts: parse_or_default("RECONNECT_MAX_ATTEMPTS", 8)?,
                initial_delay: Duration::from_millis(positive("RECONNECT_INITIAL_DELAY_MS", 500)?),
                max_delay: Duration::from_millis(positive("RECONNECT_MAX_DELAY_MS", 15_000)?),
            },
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 256)?,
            order_history_limit: parse_or_default("ORDER_HISTORY_LIMIT", 50)?,
        };

        if session.event_buffer_size == 0 {
            return Err(AppError::Internal(
                "invalid EVENT_BUFFER_SIZE: must be > 0".to_string(),
            ));
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dispatch_api_url: env::var("DISPATCH_API_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            dispatch_socket_url: env::var("DISPATCH_SOCKET_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8080".to_string()),
            api_token: env::var("DISPATCH_API_TOKEN").ok().filter(|t| !t.is_empty()),
            session,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| AppError::Internal(format!("invalid {key}: {err}")))
}

fn positive(key: &str, default: u64) -> Result<u64, AppError> {
    let value: u64 = parse_or_default(key, default)?;
    if value == 0 {
        return Err(AppError::Internal(format!("invalid {key}: must be > 0")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::{SessionConfig, parse_value};

    #[test]
    fn parse_value_trims_and_reports_key() {
        let parsed: u16 = parse_value("HTTP_PORT", " 4000 ").unwrap();
        assert_eq!(parsed, 4000);

        let err = parse_value::<u16>("HTTP_PORT", "eighty").unwrap_err();
        assert!(err.to_string().contains("HTTP_PORT"));
    }

    #[test]
    fn defaults_keep_degraded_threshold_above_heartbeat_interval() {
        let config = SessionConfig::default();
        assert!(config.degraded_after > config.heartbeat_interval);
        assert!(config.location_push_interval > config.heartbeat_interval);
    }
}
