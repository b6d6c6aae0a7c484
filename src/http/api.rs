//! JSON decision API mirroring the gRPC `ShouldRateLimit` call.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::TurnstileError;
use crate::ratelimit::{evaluate, Descriptor, DescriptorDecision, LimitCode, RateLimiterBackend};

#[derive(Debug, Deserialize)]
pub struct RateLimitBody {
    pub domain: String,
    #[serde(default)]
    pub descriptors: Vec<Descriptor>,
    #[serde(default)]
    pub hits_addend: u32,
}

#[derive(Debug, Serialize)]
pub struct RateLimitReply {
    pub overall_code: LimitCode,
    pub statuses: Vec<StatusBody>,
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub code: LimitCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<LimitBody>,
    pub remaining: u64,
    pub reset_after_secs: f64,
}

#[derive(Debug, Serialize)]
pub struct LimitBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub requests: u64,
    pub window_secs: f64,
}

impl From<&DescriptorDecision> for StatusBody {
    fn from(decision: &DescriptorDecision) -> Self {
        Self {
            code: decision.code,
            limit: decision.limit.as_ref().map(|applied| LimitBody {
                name: applied.name.clone(),
                requests: applied.limit.limit(),
                window_secs: applied.limit.window().as_secs_f64(),
            }),
            remaining: decision.remaining,
            reset_after_secs: decision.reset_after.as_secs_f64(),
        }
    }
}

/// Error response carrying `{"detail": ...}`.
#[derive(Debug)]
pub struct ApiError(pub TurnstileError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(serde_json::json!({ "detail": self.0.to_string() }))).into_response()
    }
}

impl From<TurnstileError> for ApiError {
    fn from(err: TurnstileError) -> Self {
        ApiError(err)
    }
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn should_rate_limit<R>(
    State(backend): State<Arc<R>>,
    Json(body): Json<RateLimitBody>,
) -> Result<Json<RateLimitReply>, ApiError>
where
    R: RateLimiterBackend + ?Sized + 'static,
{
    let verdict = evaluate(backend.as_ref(), &body.domain, &body.descriptors, body.hits_addend)
        .await
        .inspect_err(|e| warn!(error = %e, "Rejected rate limit request"))?;

    info!(domain = %body.domain, overall_code = ?verdict.overall, "Rate limit decision made");

    Ok(Json(RateLimitReply {
        overall_code: verdict.overall,
        statuses: verdict.statuses.iter().map(StatusBody::from).collect(),
    }))
}
