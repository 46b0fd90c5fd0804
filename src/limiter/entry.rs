//! Limiter state records.

use serde::{Deserialize, Serialize};

/// Per-endpoint window and block state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEntry {
    pub endpoint: String,
    /// Requests counted in the current window.
    pub count: u32,
    /// Epoch ms at which the current window ends.
    pub reset_at: i64,
    pub blocked: bool,
    #[serde(default)]
    pub blocked_until: i64,
    #[serde(default)]
    pub block_reason: Option<String>,
}

impl RateLimitEntry {
    pub fn new(endpoint: &str, now: i64, window_ms: i64) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            count: 0,
            reset_at: now.saturating_add(window_ms),
            blocked: false,
            blocked_until: 0,
            block_reason: None,
        }
    }

    /// Whether a block is in force at `now`.
    #[inline]
    pub fn is_blocked_at(&self, now: i64) -> bool {
        self.blocked && now < self.blocked_until
    }

    pub(crate) fn start_window(&mut self, now: i64, window_ms: i64) {
        self.count = 0;
        self.reset_at = now.saturating_add(window_ms);
    }

    pub(crate) fn block(&mut self, until: i64, reason: Option<String>) {
        self.blocked = true;
        self.blocked_until = until;
        self.block_reason = reason;
    }

    pub(crate) fn unblock(&mut self) {
        self.blocked = false;
        self.blocked_until = 0;
        self.block_reason = None;
    }
}

/// One completed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub endpoint: String,
    pub method: String,
    /// Epoch ms.
    pub timestamp: i64,
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Milliseconds.
    #[serde(default)]
    pub response_time: Option<u64>,
}

impl RequestRecord {
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>, timestamp: i64) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            timestamp,
            status_code: None,
            response_time: None,
        }
    }

    #[must_use]
    pub fn status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    #[must_use]
    pub fn response_time(mut self, ms: u64) -> Self {
        self.response_time = Some(ms);
        self
    }

    /// Whether the request ended in a client or server error.
    pub fn is_error(&self) -> bool {
        self.status_code.is_some_and(|code| code >= 400)
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Blocked,
    RateLimitExceeded,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::RateLimitExceeded => "rate_limit_exceeded",
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    /// Seconds until a retry may succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after: None,
        }
    }

    pub fn deny(reason: DenyReason, retry_after_ms: i64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after: Some(ceil_secs(retry_after_ms)),
        }
    }
}

/// Current block on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    /// The entry holding the block: the endpoint itself or the global key.
    pub endpoint: String,
    pub blocked_until: i64,
    pub retry_after: u64,
    pub reason: Option<String>,
}

/// Milliseconds to whole seconds, rounded up.
pub(crate) fn ceil_secs(ms: i64) -> u64 {
    (ms.max(0) as u64).div_ceil(1000)
}
