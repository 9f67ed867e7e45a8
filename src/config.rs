//! Client and server options.
//!
//! Settings resolve in this order (highest priority first):
//!
//! 1. **Programmatic** — fields set on the options struct
//! 2. **Environment variables** — `WIRECALL_*` overrides applied by
//!    [`ClientOptions::from_env`] / [`ServerOptions::from_env`]
//! 3. **Defaults** — built-in values
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `WIRECALL_REQUEST_TIMEOUT_MS` | `u64` (`0` = none) | `ClientOptions::request_timeout` |
//! | `WIRECALL_EVENT_QUEUE_DEPTH` | `usize` | `ClientOptions::event_queue_depth` |
//! | `WIRECALL_MAX_PACKET_SIZE` | `usize` | both `max_packet_size` fields |
//! | `WIRECALL_ACCEPT_BACKLOG` | `i32` | `ServerOptions::backlog` |
//! | `WIRECALL_EXECUTOR_THREADS` | `usize` | `ServerOptions::executor_threads` |

use crate::transport::DEFAULT_MAX_PACKET_SIZE;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable for the per-request timeout in milliseconds.
pub const ENV_REQUEST_TIMEOUT_MS: &str = "WIRECALL_REQUEST_TIMEOUT_MS";
/// Environment variable for the client event queue depth.
pub const ENV_EVENT_QUEUE_DEPTH: &str = "WIRECALL_EVENT_QUEUE_DEPTH";
/// Environment variable for the maximum packet size.
pub const ENV_MAX_PACKET_SIZE: &str = "WIRECALL_MAX_PACKET_SIZE";
/// Environment variable for the server accept backlog.
pub const ENV_ACCEPT_BACKLOG: &str = "WIRECALL_ACCEPT_BACKLOG";
/// Environment variable for the server executor thread count.
pub const ENV_EXECUTOR_THREADS: &str = "WIRECALL_EXECUTOR_THREADS";

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Per-connection client options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Timeout applied to each request. `None` disables the default.
    pub request_timeout: Option<Duration>,
    /// Depth of the best-effort signal queues feeding the scavenger.
    pub event_queue_depth: usize,
    /// Maximum size of one framed packet.
    pub max_packet_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(60 * 60)),
            event_queue_depth: 256,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl ClientOptions {
    /// Defaults with `WIRECALL_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(ms) = env_parse::<u64>(ENV_REQUEST_TIMEOUT_MS) {
            options.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(depth) = env_parse(ENV_EVENT_QUEUE_DEPTH) {
            options.event_queue_depth = depth;
        }
        if let Some(size) = env_parse(ENV_MAX_PACKET_SIZE) {
            options.max_packet_size = size;
        }
        options
    }
}

/// Server options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Listen backlog.
    pub backlog: i32,
    /// Number of executor threads handling requests.
    pub executor_threads: usize,
    /// Maximum size of one framed packet.
    pub max_packet_size: usize,
    /// Depth of the executor's job queue.
    pub job_queue_depth: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            backlog: crate::net::channel::DEFAULT_BACKLOG,
            executor_threads: 4,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            job_queue_depth: 256,
        }
    }
}

impl ServerOptions {
    /// Defaults with `WIRECALL_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(backlog) = env_parse(ENV_ACCEPT_BACKLOG) {
            options.backlog = backlog;
        }
        if let Some(threads) = env_parse(ENV_EXECUTOR_THREADS) {
            options.executor_threads = threads;
        }
        if let Some(size) = env_parse(ENV_MAX_PACKET_SIZE) {
            options.max_packet_size = size;
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.request_timeout, Some(Duration::from_secs(3600)));
        assert_eq!(options.event_queue_depth, 256);
        assert_eq!(options.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
    }

    #[test]
    fn server_defaults() {
        let options = ServerOptions::default();
        assert_eq!(options.backlog, 10);
        assert!(options.executor_threads >= 1);
    }
}
