// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transport configuration with environment overrides.

use std::time::Duration;

use tracing::warn;

/// Well-known bootstrap port of the daemon.
pub const DEFAULT_PORT: u16 = 42000;
/// Largest request payload the client may send (10 KiB).
pub const REQUEST_CAPACITY: usize = 10 * 1024;
/// Largest response payload the daemon may send (1 MiB).
pub const RESPONSE_CAPACITY: usize = 1024 * 1024;

/// Settings shared by the client and the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub handshake_timeout: Duration,
    /// Default deadline for synchronous calls. `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub alive_timeout: Duration,
    pub request_capacity: usize,
    pub response_capacity: usize,
    /// Depth of the outbound and inbound worker queues.
    pub queue_depth: usize,
    /// How long disconnect lets queued requests drain before cancelling.
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            handshake_timeout: Duration::from_secs(5),
            call_timeout: Some(Duration::from_secs(30)),
            alive_timeout: Duration::from_secs(5),
            request_capacity: REQUEST_CAPACITY,
            response_capacity: RESPONSE_CAPACITY,
            queue_depth: 64,
            drain_timeout: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Defaults overridden by `CAPIPC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(host) = lookup("CAPIPC_HOST") {
            cfg.host = host;
        }
        if let Some(port) = parse_var::<u16>(&lookup, "CAPIPC_PORT") {
            cfg.port = port;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CAPIPC_HANDSHAKE_TIMEOUT_MS") {
            cfg.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CAPIPC_CALL_TIMEOUT_MS") {
            cfg.call_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CAPIPC_ALIVE_TIMEOUT_MS") {
            cfg.alive_timeout = Duration::from_millis(ms);
        }
        cfg
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_alive_timeout(mut self, timeout: Duration) -> Self {
        self.alive_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// `host:port` of the bootstrap socket.
    pub fn bootstrap_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable configuration override");
            None
        }
    }
}
