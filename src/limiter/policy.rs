//! Rate limit categories and their policies.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Request category, each with its own window policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitCategory {
    Auth,
    Api,
    Mutation,
    Query,
    #[default]
    Default,
}

impl RateLimitCategory {
    pub const ALL: [Self; 5] = [Self::Auth, Self::Api, Self::Mutation, Self::Query, Self::Default];

    /// Parse a category name. Unknown names map to `Default`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "auth" => Self::Auth,
            "api" => Self::Api,
            "mutation" => Self::Mutation,
            "query" => Self::Query,
            _ => Self::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Api => "api",
            Self::Mutation => "mutation",
            Self::Query => "query",
            Self::Default => "default",
        }
    }

    /// Built-in policy for this category.
    pub fn policy(&self) -> RateLimitPolicy {
        match self {
            Self::Auth => RateLimitPolicy::new(Duration::from_secs(5 * 60), 5, Duration::from_secs(15 * 60)),
            Self::Api => RateLimitPolicy::new(Duration::from_secs(60), 100, Duration::from_secs(5 * 60)),
            Self::Mutation => RateLimitPolicy::new(Duration::from_secs(60), 30, Duration::from_secs(10 * 60)),
            Self::Query => RateLimitPolicy::new(Duration::from_secs(60), 200, Duration::from_secs(60)),
            Self::Default => RateLimitPolicy::new(Duration::from_secs(60), 60, Duration::from_secs(5 * 60)),
        }
    }

    /// Pick a category for a request from its path and HTTP method.
    pub fn categorize(endpoint: &str, method: &str) -> Self {
        if is_auth_endpoint(endpoint) {
            return Self::Auth;
        }

        match method.to_ascii_uppercase().as_str() {
            "GET" | "HEAD" => Self::Query,
            "POST" | "PUT" | "PATCH" | "DELETE" => Self::Mutation,
            _ => Self::Api,
        }
    }
}

impl From<&str> for RateLimitCategory {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an endpoint belongs to the authentication surface.
pub fn is_auth_endpoint(endpoint: &str) -> bool {
    let endpoint = endpoint.to_ascii_lowercase();
    ["auth", "login", "signin", "signup", "password"]
        .iter()
        .any(|marker| endpoint.contains(marker))
}

/// Fixed-window policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_requests: u32,
    /// How long an endpoint stays blocked after exceeding the limit.
    pub block_duration: Duration,
}

impl RateLimitPolicy {
    pub const fn new(window: Duration, max_requests: u32, block_duration: Duration) -> Self {
        Self {
            window,
            max_requests,
            block_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_category_falls_back_to_default() {
        assert_eq!(RateLimitCategory::from_name("auth"), RateLimitCategory::Auth);
        assert_eq!(RateLimitCategory::from("QUERY"), RateLimitCategory::Query);
        assert_eq!(RateLimitCategory::from_name("uploads"), RateLimitCategory::Default);
    }

    #[test]
    fn test_auth_is_strictest() {
        let auth = RateLimitCategory::Auth.policy();
        assert_eq!(auth.max_requests, 5);
        assert_eq!(auth.window, Duration::from_secs(300));
        assert_eq!(auth.block_duration, Duration::from_secs(900));

        let query = RateLimitCategory::Query.policy();
        for category in RateLimitCategory::ALL {
            assert!(category.policy().max_requests >= auth.max_requests);
            assert!(category.policy().max_requests <= query.max_requests);
        }
    }

    #[test]
    fn test_categorize() {
        assert_eq!(RateLimitCategory::categorize("/api/auth/login", "POST"), RateLimitCategory::Auth);
        assert_eq!(RateLimitCategory::categorize("/api/properties", "GET"), RateLimitCategory::Query);
        assert_eq!(RateLimitCategory::categorize("/api/offers/3", "PATCH"), RateLimitCategory::Mutation);
        assert_eq!(RateLimitCategory::categorize("/api/stream", "OPTIONS"), RateLimitCategory::Api);
    }
}
