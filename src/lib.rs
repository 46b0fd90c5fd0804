//! Guardrail - adaptive resource protection
//!
//! A real-time aware cache manager and an abuse-detecting rate limiter that
//! sit in front of a backend's data and its HTTP surface.
//!
//! ## Architecture
//!
//! - `cache` - TTL cache with priority eviction, prefetch and tag invalidation
//! - `limiter` - Per-endpoint rate limiting and abuse pattern detection
//! - `events` - Event bus consumed and fed by the cache
//! - `database` - Snapshot stores (memory, file, MongoDB)
//! - `http` - Axum middleware and status routes
//! - `config` - Environment configuration
//! - `clock` / `tasks` - Time source and background task runner

pub mod cache;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod http;
pub mod limiter;
pub mod tasks;

pub use cache::{CacheConfig, CacheManager, Invalidation, Priority};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{GuardError, GuardResult};
pub use events::{DomainEvent, EventBus, InProcessBus};
pub use limiter::{RateLimitCategory, RateLimitResult, RateLimiter, RequestRecord};
