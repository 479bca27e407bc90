//! Runtime configuration shared by both ends of a session.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::version::PROTOCOL_VERSION;

/// Environment variable carrying the JSON endpoint descriptor to the child.
pub const DEFAULT_ENDPOINT_ENV: &str = "TESTHOST_ENDPOINT";

pub const ENV_MAX_FRAME_SIZE: &str = "TESTHOST_MAX_FRAME_SIZE";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "TESTHOST_CONNECT_TIMEOUT_MS";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "TESTHOST_HANDSHAKE_TIMEOUT_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "TESTHOST_REQUEST_TIMEOUT_MS";
pub const ENV_KILL_GRACE_MS: &str = "TESTHOST_KILL_GRACE_MS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid {expected}")]
    InvalidValue {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("environment variable {0} is not set")]
    Missing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub max_frame_size: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Applied by `send_request`; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    pub kill_grace_period: Duration,
    pub endpoint_env_var: String,
    /// Peer protocol majors this side accepts.
    pub supported_majors: RangeInclusive<u16>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: None,
            kill_grace_period: Duration::from_secs(5),
            endpoint_env_var: DEFAULT_ENDPOINT_ENV.to_string(),
            supported_majors: PROTOCOL_VERSION.major..=PROTOCOL_VERSION.major,
        }
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `TESTHOST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(size) = parse_var(&lookup, ENV_MAX_FRAME_SIZE, "frame size in bytes")? {
            config.max_frame_size = size;
        }
        if let Some(ms) = parse_var(&lookup, ENV_CONNECT_TIMEOUT_MS, "timeout in milliseconds")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, ENV_HANDSHAKE_TIMEOUT_MS, "timeout in milliseconds")? {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_REQUEST_TIMEOUT_MS, "timeout in milliseconds")? {
            // 0 disables the default request timeout
            config.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var(&lookup, ENV_KILL_GRACE_MS, "grace period in milliseconds")? {
            config.kill_grace_period = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_kill_grace_period(mut self, grace: Duration) -> Self {
        self.kill_grace_period = grace;
        self
    }

    pub fn with_endpoint_env_var(mut self, var: impl Into<String>) -> Self {
        self.endpoint_env_var = var.into();
        self
    }

    pub fn with_supported_majors(mut self, majors: RangeInclusive<u16>) -> Self {
        self.supported_majors = majors;
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            var,
            value: raw.clone(),
            expected,
        })
}
