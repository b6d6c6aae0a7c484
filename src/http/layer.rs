//! Tower middleware that applies a sliding window to every HTTP request.
//!
//! Requests carrying an [`AuthenticatedUser`] extension, inserted by an auth
//! layer that runs before this one, are keyed `user:<id>` and get a larger
//! allowance. Everything else is keyed by peer address (`ip:<addr>`). A
//! request header is only taken as identity when the policy names it as
//! trusted, for deployments where a gateway in front sets it. Rejected
//! requests get `429 Too Many Requests` with a `Retry-After` hint.
//!
//! ```rust,ignore
//! let counter = Arc::new(SlidingWindowCounter::new());
//! let policy = HttpLimitPolicy::new(WindowLimit::new(100, Duration::from_secs(60))?);
//! let app = Router::new()
//!     .route("/items", get(list_items))
//!     .layer(RateLimitLayer::new(counter, policy))
//!     .layer(middleware::from_fn(authenticate));
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{debug, error};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Decision, SlidingWindowCounter, WindowLimit};

const DEFAULT_AUTHENTICATED_MULTIPLIER: u64 = 2;

const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Caller identity established by an upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Which requests are limited, how they are keyed and how much they get.
#[derive(Debug, Clone)]
pub struct HttpLimitPolicy {
    limit: WindowLimit,
    authenticated_limit: WindowLimit,
    trusted_identity_header: Option<HeaderName>,
    exclude_paths: Vec<String>,
}

impl HttpLimitPolicy {
    /// Anonymous callers get `limit`; authenticated callers get twice as
    /// much. No header is trusted and `/health` is not limited.
    pub fn new(limit: WindowLimit) -> Self {
        let authenticated_limit = limit
            .scaled(DEFAULT_AUTHENTICATED_MULTIPLIER)
            .unwrap_or(limit);

        Self {
            limit,
            authenticated_limit,
            trusted_identity_header: None,
            exclude_paths: vec!["/health".to_string()],
        }
    }

    /// Set how many times `limit` authenticated callers may send.
    pub fn with_authenticated_multiplier(mut self, multiplier: u64) -> Result<Self> {
        if multiplier == 0 {
            return Err(TurnstileError::Config(
                "authenticated_multiplier must be at least 1".to_string(),
            ));
        }
        self.authenticated_limit = self.limit.scaled(multiplier)?;
        Ok(self)
    }

    /// Trust `name` as the caller identity when no [`AuthenticatedUser`] is
    /// present. Only safe behind a proxy that sets or strips the header.
    pub fn with_trusted_identity_header(mut self, name: Option<&str>) -> Result<Self> {
        self.trusted_identity_header = name
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    TurnstileError::Config(format!("invalid identity header {:?}: {}", name, e))
                })
            })
            .transpose()?;
        Ok(self)
    }

    /// Replace the list of paths that bypass limiting.
    pub fn with_exclude_paths(mut self, paths: Vec<String>) -> Self {
        self.exclude_paths = paths;
        self
    }

    pub fn limit(&self) -> WindowLimit {
        self.limit
    }

    pub fn authenticated_limit(&self) -> WindowLimit {
        self.authenticated_limit
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude_paths.iter().any(|p| p == path)
    }

    /// The counter key and limit for a request.
    pub fn identify(&self, req: &Request) -> (String, WindowLimit) {
        let from_auth = req
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|AuthenticatedUser(id)| id.as_str());
        let from_header = || {
            let name = self.trusted_identity_header.as_ref()?;
            req.headers().get(name)?.to_str().ok()
        };

        let identity = from_auth
            .or_else(from_header)
            .map(str::trim)
            .filter(|id| !id.is_empty());

        if let Some(user) = identity {
            return (format!("user:{}", user), self.authenticated_limit);
        }

        let key = match req.extensions().get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
            None => "ip:unknown".to_string(),
        };
        (key, self.limit)
    }
}

/// Response for a request that exceeded its window.
#[derive(Debug, Clone)]
pub struct RateLimitRejection {
    pub limit: u64,
    pub retry_after_secs: u64,
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "detail": "Rate limit exceeded. Try again later.",
                "retry_after": self.retry_after_secs,
            })),
        )
            .into_response();

        let headers = response.headers_mut();
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
        response
    }
}

/// Tower layer for sliding window rate limiting.
#[derive(Clone)]
pub struct RateLimitLayer {
    counter: Arc<SlidingWindowCounter>,
    policy: Arc<HttpLimitPolicy>,
}

impl RateLimitLayer {
    pub fn new(counter: Arc<SlidingWindowCounter>, policy: HttpLimitPolicy) -> Self {
        Self {
            counter,
            policy: Arc::new(policy),
        }
    }

    /// Run the admission check for a request.
    fn check(&self, req: &Request) -> Result<Decision> {
        let (key, limit) = self.policy.identify(req);
        let decision = self.counter.check(&key, &limit, 1)?;
        if !decision.admitted {
            debug!(key = %key, path = %req.uri().path(), "HTTP rate limit exceeded");
        }
        Ok(decision)
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            layer: self.clone(),
        }
    }
}

/// Tower service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    layer: RateLimitLayer,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        if self.layer.policy.is_excluded(req.uri().path()) {
            return Box::pin(self.inner.call(req));
        }

        let decision = match self.layer.check(&req) {
            Ok(decision) => decision,
            Err(e) => {
                error!(error = %e, "HTTP rate limit check failed");
                return Box::pin(async { Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response()) });
            }
        };

        if !decision.admitted {
            let rejection = RateLimitRejection {
                limit: decision.limit,
                retry_after_secs: decision.retry_after_secs(),
            };
            return Box::pin(async move { Ok(rejection.into_response()) });
        }

        // The clone may not be ready; call the instance poll_ready was driven on.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
            Ok(response)
        })
    }
}
