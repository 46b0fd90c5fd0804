//! Rate limiting and abuse detection.
//!
//! `RateLimiter` admits requests per endpoint under fixed-window policies
//! chosen by [`RateLimitCategory`]. Completed requests are fed back through
//! `track_request`, which appends them to a bounded history and runs the
//! abuse patterns; the blocking ones lock every endpoint through the global
//! `all` entry.
//!
//! # Example
//!
//! ```rust,ignore
//! let limiter = RateLimiter::new();
//!
//! let verdict = limiter.check_rate_limit("/api/auth/login", RateLimitCategory::Auth);
//! if !verdict.allowed {
//!     return too_many_requests(verdict.retry_after);
//! }
//!
//! limiter.track_request(RequestRecord::new("/api/auth/login", "POST", now).status(401));
//! ```

mod abuse;
mod entry;
mod history;
#[allow(clippy::module_inception)]
mod limiter;
mod policy;

pub use abuse::{
    AbuseDetector, AbusePattern, AbuseResponse, EVENT_CONTEXT_RECORDS, SECURITY_LOG_CAPACITY, SecurityAction,
    SecurityEvent,
};
pub use entry::{BlockInfo, DenyReason, RateLimitEntry, RateLimitResult, RequestRecord};
pub use history::{DEFAULT_HISTORY_CAPACITY, RequestHistory};
pub use limiter::{GLOBAL_ENDPOINT, RateLimiter, RateLimiterBuilder};
pub use policy::{RateLimitCategory, RateLimitPolicy, is_auth_endpoint};
