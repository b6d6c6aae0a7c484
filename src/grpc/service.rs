//! Rate limit service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::envoy::config::core::v3::HeaderValue;
use super::proto::envoy::service::ratelimit::v3::{
    rate_limit_response::{Code, DescriptorStatus, RateLimit},
    rate_limit_service_server::RateLimitService,
    RateLimitRequest, RateLimitResponse,
};

use crate::ratelimit::{
    evaluate, DescriptorDecision, Descriptor, LimitCode, RateLimiterBackend, UnknownUnit, Verdict,
};

/// Implementation of the Envoy RateLimitService gRPC interface.
pub struct RateLimitServiceImpl<R: RateLimiterBackend + ?Sized> {
    rate_limiter: Arc<R>,
}

impl<R: RateLimiterBackend + ?Sized> RateLimitServiceImpl<R> {
    /// Create a new RateLimitServiceImpl with the given rate limiter.
    pub fn new(rate_limiter: Arc<R>) -> Self {
        Self { rate_limiter }
    }
}

#[tonic::async_trait]
impl<R: RateLimiterBackend + ?Sized + 'static> RateLimitService for RateLimitServiceImpl<R> {
    /// Determine whether rate limiting should take place.
    #[instrument(
        skip(self, request),
        fields(
            domain = %request.get_ref().domain,
            descriptor_count = request.get_ref().descriptors.len(),
            hits_addend = request.get_ref().hits_addend
        )
    )]
    async fn should_rate_limit(
        &self,
        request: Request<RateLimitRequest>,
    ) -> Result<Response<RateLimitResponse>, Status> {
        let req = request.into_inner();

        debug!(
            domain = %req.domain,
            descriptors = ?req.descriptors,
            hits_addend = req.hits_addend,
            "Processing rate limit request"
        );

        let descriptors = req
            .descriptors
            .iter()
            .map(Descriptor::try_from)
            .collect::<Result<Vec<_>, UnknownUnit>>()
            .map_err(|UnknownUnit(unit)| {
                warn!(unit = unit, "Received descriptor override with unknown unit");
                Status::invalid_argument(format!("unknown rate limit unit {}", unit))
            })?;

        let verdict = evaluate(self.rate_limiter.as_ref(), &req.domain, &descriptors, req.hits_addend)
            .await
            .map_err(|e| {
                warn!(error = %e, "Rejected rate limit request");
                Status::from(e)
            })?;

        let response = to_response(&verdict);

        info!(
            domain = %req.domain,
            overall_code = ?verdict.overall,
            "Rate limit decision made"
        );

        Ok(Response::new(response))
    }
}

fn to_response(verdict: &Verdict) -> RateLimitResponse {
    let mut response_headers_to_add = Vec::new();

    if let (Some(status), Some(retry_after)) = (verdict.most_restrictive(), verdict.retry_after_secs()) {
        response_headers_to_add.push(header("retry-after", retry_after.to_string()));
        if let Some(applied) = &status.limit {
            response_headers_to_add.push(header("x-ratelimit-limit", applied.limit.limit().to_string()));
        }
        response_headers_to_add.push(header("x-ratelimit-remaining", status.remaining.to_string()));
    }

    RateLimitResponse {
        overall_code: to_code(verdict.overall).into(),
        statuses: verdict.statuses.iter().map(to_status).collect(),
        response_headers_to_add,
        request_headers_to_add: Vec::new(),
        raw_body: Vec::new(),
    }
}

fn to_status(decision: &DescriptorDecision) -> DescriptorStatus {
    let current_limit = decision.limit.as_ref().map(|applied| RateLimit {
        name: applied.name.clone().unwrap_or_default(),
        requests_per_unit: saturate_u32(applied.limit.limit()),
        unit: applied.limit.unit().map(|unit| unit.to_proto()).unwrap_or(0),
    });

    DescriptorStatus {
        code: to_code(decision.code).into(),
        current_limit,
        limit_remaining: saturate_u32(decision.remaining),
        duration_until_reset: Some(prost_types::Duration {
            seconds: decision.reset_after.as_secs() as i64,
            nanos: decision.reset_after.subsec_nanos() as i32,
        }),
    }
}

fn to_code(code: LimitCode) -> Code {
    match code {
        LimitCode::Ok => Code::Ok,
        LimitCode::OverLimit => Code::OverLimit,
    }
}

fn header(key: &str, value: String) -> HeaderValue {
    HeaderValue {
        key: key.to_string(),
        value,
    }
}

fn saturate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
