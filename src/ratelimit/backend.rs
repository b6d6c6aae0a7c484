//! Rate limiter trait shared by the gRPC and HTTP front ends.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::descriptor::Descriptor;
use super::window::WindowLimit;
use crate::error::{Result, TurnstileError};

/// Outcome code for a descriptor or a whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitCode {
    Ok,
    OverLimit,
}

/// The limit a descriptor was checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedLimit {
    pub limit: WindowLimit,
    pub name: Option<String>,
}

/// Result of checking a single descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDecision {
    pub code: LimitCode,
    /// `None` when no rule matched and the descriptor is unlimited
    pub limit: Option<AppliedLimit>,
    pub remaining: u64,
    pub reset_after: Duration,
}

impl DescriptorDecision {
    /// Decision for a descriptor that no limit applies to.
    pub fn unlimited() -> Self {
        Self {
            code: LimitCode::Ok,
            limit: None,
            remaining: 0,
            reset_after: Duration::ZERO,
        }
    }

    pub fn is_over_limit(&self) -> bool {
        self.code == LimitCode::OverLimit
    }
}

/// Result of checking every descriptor in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub overall: LimitCode,
    pub statuses: Vec<DescriptorDecision>,
}

impl Verdict {
    /// The over-limit descriptor that stays closed longest; the first one
    /// wins ties. `None` when nothing is over limit.
    pub fn most_restrictive(&self) -> Option<&DescriptorDecision> {
        self.statuses
            .iter()
            .filter(|status| status.is_over_limit())
            .fold(None, |best: Option<&DescriptorDecision>, status| match best {
                Some(best) if best.reset_after >= status.reset_after => Some(best),
                _ => Some(status),
            })
    }

    /// Seconds to wait before [`most_restrictive`](Self::most_restrictive)
    /// admits again, rounded up and never below one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.most_restrictive()
            .map(|status| ceil_secs(status.reset_after).max(1))
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Trait for rate limiter implementations.
///
/// The front ends only depend on this trait, so tests can swap in a backend
/// with fixed answers.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Reject a descriptor the backend could not check, without counting it.
    fn validate_descriptor(&self, _domain: &str, _descriptor: &Descriptor) -> Result<()> {
        Ok(())
    }

    /// Check the rate limit for a given domain and descriptor.
    async fn check_rate_limit(
        &self,
        domain: &str,
        descriptor: &Descriptor,
        hits: u32,
    ) -> Result<DescriptorDecision>;
}

/// Validate a request and check each of its descriptors.
///
/// Every descriptor is validated before any is counted, so an invalid request
/// leaves no hits behind. Descriptors are then checked independently: one
/// being over limit does not stop the others from being counted. The request
/// is over limit if any descriptor is.
pub async fn evaluate<R>(
    backend: &R,
    domain: &str,
    descriptors: &[Descriptor],
    hits: u32,
) -> Result<Verdict>
where
    R: RateLimiterBackend + ?Sized,
{
    if domain.is_empty() {
        return Err(TurnstileError::InvalidRequest("domain is required".into()));
    }
    if descriptors.is_empty() {
        return Err(TurnstileError::InvalidRequest(
            "at least one descriptor is required".into(),
        ));
    }

    for descriptor in descriptors {
        backend.validate_descriptor(domain, descriptor)?;
    }

    let mut statuses = Vec::with_capacity(descriptors.len());
    let mut overall = LimitCode::Ok;

    for descriptor in descriptors {
        let status = backend.check_rate_limit(domain, descriptor, hits).await?;
        if status.is_over_limit() {
            overall = LimitCode::OverLimit;
        }
        statuses.push(status);
    }

    Ok(Verdict { overall, statuses })
}
