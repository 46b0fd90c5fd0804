//! HTTP surface: rate limiting middleware and a small status router.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::RETRY_AFTER;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::debug;

use crate::cache::CacheManager;
use crate::limiter::{RateLimitCategory, RateLimitResult, RateLimiter, RequestRecord};

/// Shared state of the demo router.
#[derive(Clone)]
pub struct AppState {
    pub cache: CacheManager<Value>,
    pub limiter: RateLimiter,
}

/// Admit each request through the limiter and feed the outcome back into
/// its history.
///
/// Denied requests get `429 Too Many Requests` with a `Retry-After` header
/// and never reach the handler, so they are not tracked.
pub async fn rate_limit_middleware(State(limiter): State<RateLimiter>, request: Request, next: Next) -> Response {
    let endpoint = request.uri().path().to_string();
    let method = request.method().as_str().to_string();
    let category = RateLimitCategory::categorize(&endpoint, &method);

    let verdict = limiter.check_rate_limit(&endpoint, category);
    if !verdict.allowed {
        debug!("Rejected {} {} ({})", method, endpoint, category);
        return too_many_requests(verdict);
    }

    let timestamp = limiter.now_ms();
    let started = Instant::now();
    let response = next.run(request).await;

    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    limiter.track_request(
        RequestRecord::new(endpoint, method, timestamp)
            .status(response.status().as_u16())
            .response_time(elapsed_ms),
    );

    response
}

fn too_many_requests(verdict: RateLimitResult) -> Response {
    let retry_after = verdict.retry_after.unwrap_or(1).to_string();
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(RETRY_AFTER, retry_after)],
        Json(verdict),
    )
        .into_response()
}

/// Router with `/health` and `/stats`, guarded by the rate limiter.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(middleware::from_fn_with_state(state.limiter.clone(), rate_limit_middleware))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let cache = state.cache.stats();
    Json(json!({
        "cacheHitRate": cache.hit_rate(),
        "cache": cache,
        "rateLimiter": {
            "endpoints": state.limiter.len(),
            "history": state.limiter.history().len(),
            "securityEvents": state.limiter.security_events(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt; // for `oneshot`

    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::limiter::{GLOBAL_ENDPOINT, RateLimitPolicy};

    fn test_state(query_limit: u32) -> AppState {
        let clock = ManualClock::new(1_700_000_000_000);
        let limiter = RateLimiter::builder()
            .clock(clock.clone())
            .policy(
                RateLimitCategory::Query,
                RateLimitPolicy::new(Duration::from_secs(60), query_limit, Duration::from_secs(30)),
            )
            .build();
        let cache = CacheManager::builder()
            .defaults(CacheConfig::default())
            .clock(clock)
            .build();

        AppState { cache, limiter }
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_requests_are_tracked() {
        let state = test_state(10);
        let app = router(state.clone());

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let history = state.limiter.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].endpoint, "/health");
        assert_eq!(history[0].method, "GET");
        assert_eq!(history[0].status_code, Some(200));
    }

    #[tokio::test]
    async fn test_over_limit_gets_429_with_retry_after() {
        let state = test_state(2);
        let app = router(state.clone());

        for _ in 0..2 {
            let response = app.clone().oneshot(get_request("/health")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("30")
        );
        assert_eq!(state.limiter.history().len(), 2);
    }

    #[tokio::test]
    async fn test_global_block_rejects_every_route() {
        let state = test_state(10);
        state.limiter.block(GLOBAL_ENDPOINT, Duration::from_secs(120), Some("api-flooding"));
        let app = router(state);

        let response = app.oneshot(get_request("/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("120")
        );
    }

    #[tokio::test]
    async fn test_stats_reports_cache_and_limiter() {
        let state = test_state(10);
        state.cache.set("property:1", json!({ "id": 1 }), None);
        let app = router(state);

        let response = app.oneshot(get_request("/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["cache"]["entry_count"], 1);
        assert_eq!(body["cache"]["sets"], 1);
        assert_eq!(body["rateLimiter"]["endpoints"], 1);
    }
}
