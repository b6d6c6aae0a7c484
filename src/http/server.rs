//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tracing::{error, info};

use super::api;
use super::layer::RateLimitLayer;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::RateLimiterBackend;

/// HTTP server exposing the JSON decision API behind the rate limit layer.
pub struct HttpServer<R: RateLimiterBackend + ?Sized + 'static> {
    addr: SocketAddr,
    rate_limiter: Arc<R>,
    layer: RateLimitLayer,
}

impl<R: RateLimiterBackend + ?Sized + 'static> HttpServer<R> {
    pub fn new(addr: SocketAddr, rate_limiter: Arc<R>, layer: RateLimitLayer) -> Self {
        Self {
            addr,
            rate_limiter,
            layer,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Build the router with every route wrapped by the rate limit layer.
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(api::health))
            .route("/v1/ratelimit", post(api::should_rate_limit::<R>))
            .with_state(self.rate_limiter.clone())
            .layer(self.layer.clone())
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            self.build_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpLimitPolicy;
    use crate::ratelimit::{ManualClock, RateLimiter, SlidingWindowCounter, WindowLimit};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn server(http_limit: u64) -> HttpServer<RateLimiter> {
        let clock = ManualClock::new();
        let counter = Arc::new(SlidingWindowCounter::with_clock(1024, Arc::new(clock)));
        let policy = HttpLimitPolicy::new(WindowLimit::new(http_limit, Duration::from_secs(60)).unwrap());
        HttpServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(RateLimiter::new()),
            RateLimitLayer::new(counter, policy),
        )
    }

    fn post_json(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/ratelimit")
            .header("content-type", "application/json")
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 5000))))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_never_limited() {
        let app = server(1).build_router();
        for _ in 0..3 {
            let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
            let response = app.clone().oneshot(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_decision_api_reports_limits() {
        let app = server(100).build_router();
        let body = serde_json::json!({
            "domain": "edge",
            "descriptors": [
                {
                    "entries": [{ "key": "remote_address", "value": "10.0.0.1" }],
                    "limit": { "requests_per_unit": 1, "unit": "minute" }
                }
            ],
            "hits_addend": 1
        });

        let response = app.clone().oneshot(post_json(body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply = json(response).await;
        assert_eq!(reply["overall_code"], "OK");
        assert_eq!(reply["statuses"][0]["limit"]["requests"], 1);
        assert_eq!(reply["statuses"][0]["limit"]["window_secs"], 60.0);
        assert_eq!(reply["statuses"][0]["remaining"], 0);

        let response = app.clone().oneshot(post_json(body)).await.unwrap();
        let reply = json(response).await;
        assert_eq!(reply["overall_code"], "OVER_LIMIT");
        assert_eq!(reply["statuses"][0]["code"], "OVER_LIMIT");
    }

    #[tokio::test]
    async fn test_decision_api_rejects_invalid_request() {
        let app = server(100).build_router();
        let body = serde_json::json!({ "domain": "edge", "descriptors": [] });

        let response = app.oneshot(post_json(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let reply = json(response).await;
        assert!(reply["detail"].as_str().unwrap().contains("descriptor"));
    }

    #[tokio::test]
    async fn test_decision_api_is_itself_rate_limited() {
        let app = server(1).build_router();
        let body = serde_json::json!({
            "domain": "edge",
            "descriptors": [{ "entries": [{ "key": "k", "value": "v" }] }]
        });

        let response = app.clone().oneshot(post_json(body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(post_json(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "60");
    }

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let result = server(1).serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
