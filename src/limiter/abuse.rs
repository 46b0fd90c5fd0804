//! Abuse pattern detection over the request history.
//!
//! Every tracked request re-evaluates all patterns from scratch against the
//! whole ledger. Patterns either flag (log + security event) or ask the
//! limiter to block the global endpoint.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::RequestRecord;
use super::policy::is_auth_endpoint;

/// How many security events are retained.
pub const SECURITY_LOG_CAPACITY: usize = 100;
/// How many history records a security event carries.
pub const EVENT_CONTEXT_RECORDS: usize = 20;

const RAPID_AUTH_WINDOW: Duration = Duration::from_secs(5 * 60);
const RAPID_AUTH_FAILURES: usize = 3;
const RAPID_AUTH_BLOCK: Duration = Duration::from_secs(30 * 60);

const FLOOD_WINDOW: Duration = Duration::from_secs(10);
const FLOOD_REQUESTS: usize = 20;
const FLOOD_BLOCK: Duration = Duration::from_secs(5 * 60);

const SCAN_WINDOW: Duration = Duration::from_secs(30);
const SCAN_ENDPOINTS: usize = 15;

const ERROR_WINDOW: Duration = Duration::from_secs(60);
const ERROR_REQUESTS: usize = 5;

/// Known abuse patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbusePattern {
    /// Repeated failed requests against auth endpoints.
    RapidAuthFailures,
    /// Too many requests of any kind in a short window.
    ApiFlooding,
    /// Many distinct endpoints hit in a short window.
    EndpointScanning,
    /// A run of error responses.
    SequentialErrors,
}

impl AbusePattern {
    pub const ALL: [Self; 4] = [
        Self::RapidAuthFailures,
        Self::ApiFlooding,
        Self::EndpointScanning,
        Self::SequentialErrors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RapidAuthFailures => "rapid-auth-failures",
            Self::ApiFlooding => "api-flooding",
            Self::EndpointScanning => "endpoint-scanning",
            Self::SequentialErrors => "sequential-errors",
        }
    }

    /// What the limiter does when this pattern matches.
    pub fn response(&self) -> AbuseResponse {
        match self {
            Self::RapidAuthFailures => AbuseResponse::Block(RAPID_AUTH_BLOCK),
            Self::ApiFlooding => AbuseResponse::Block(FLOOD_BLOCK),
            Self::EndpointScanning | Self::SequentialErrors => AbuseResponse::Flag,
        }
    }

    /// Whether the pattern holds over `records` at `now`.
    pub fn matches<'a, I>(&self, records: I, now: i64) -> bool
    where
        I: IntoIterator<Item = &'a RequestRecord>,
    {
        let within = |record: &RequestRecord, window: Duration| {
            now - record.timestamp < crate::clock::duration_ms(window)
        };

        match self {
            Self::RapidAuthFailures => {
                records
                    .into_iter()
                    .filter(|&r| within(r, RAPID_AUTH_WINDOW) && r.is_error() && is_auth_endpoint(&r.endpoint))
                    .count()
                    >= RAPID_AUTH_FAILURES
            }
            Self::ApiFlooding => {
                records.into_iter().filter(|&r| within(r, FLOOD_WINDOW)).count() > FLOOD_REQUESTS
            }
            Self::EndpointScanning => {
                let endpoints: HashSet<&str> = records
                    .into_iter()
                    .filter(|&r| within(r, SCAN_WINDOW))
                    .map(|r| r.endpoint.as_str())
                    .collect();
                endpoints.len() > SCAN_ENDPOINTS
            }
            Self::SequentialErrors => {
                records
                    .into_iter()
                    .filter(|&r| within(r, ERROR_WINDOW) && r.is_error())
                    .count()
                    >= ERROR_REQUESTS
            }
        }
    }
}

impl fmt::Display for AbusePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consequence of a matched pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseResponse {
    Flag,
    /// Block the global endpoint for this long.
    Block(Duration),
}

/// Action recorded in a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityAction {
    Flag,
    Block,
}

/// Record of a triggered abuse pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub pattern: AbusePattern,
    pub action: SecurityAction,
    pub timestamp: i64,
    /// The newest history records when the pattern fired.
    pub recent: Vec<RequestRecord>,
}

/// Evaluates patterns and keeps a bounded log of what fired.
#[derive(Debug, Default)]
pub struct AbuseDetector {
    log: Mutex<VecDeque<SecurityEvent>>,
}

impl AbuseDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pattern that holds over `records` at `now`.
    pub fn evaluate(&self, records: &VecDeque<RequestRecord>, now: i64) -> Vec<AbusePattern> {
        AbusePattern::ALL
            .into_iter()
            .filter(|pattern| pattern.matches(records, now))
            .collect()
    }

    pub fn record(&self, event: SecurityEvent) {
        let mut log = self.log.lock();
        log.push_back(event);
        while log.len() > SECURITY_LOG_CAPACITY {
            log.pop_front();
        }
    }

    /// Logged events, oldest first.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.log.lock().iter().cloned().collect()
    }
}

/// The newest `EVENT_CONTEXT_RECORDS` records, oldest first.
pub(crate) fn event_context(records: &VecDeque<RequestRecord>) -> Vec<RequestRecord> {
    let skip = records.len().saturating_sub(EVENT_CONTEXT_RECORDS);
    records.iter().skip(skip).cloned().collect()
}
