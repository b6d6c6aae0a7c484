//! Descriptor-level rate limiter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::backend::{AppliedLimit, DescriptorDecision, LimitCode, RateLimiterBackend};
use super::counter::SlidingWindowCounter;
use super::descriptor::{Descriptor, DescriptorKey};
use super::rules::{RateLimitRule, RulesConfig};
use super::window::{TimeUnit, WindowLimit};
use crate::error::{Result, TurnstileError};

/// Default rate limit when no rule matches a descriptor.
const DEFAULT_LIMIT: u64 = 1000;
/// Default time unit when no rule matches a descriptor.
const DEFAULT_UNIT: TimeUnit = TimeUnit::Second;

/// Resolves limits for Envoy descriptors and admits them through a
/// [`SlidingWindowCounter`].
///
/// Limits are resolved in order: the descriptor's own override, the most
/// specific rule for the domain, then the default limit. Without a default,
/// unmatched descriptors are not limited at all.
pub struct RateLimiter {
    counter: SlidingWindowCounter,
    rules: RwLock<RulesConfig>,
    default_limit: Option<AppliedLimit>,
}

impl RateLimiter {
    /// Create a rate limiter with no rules and the built-in default limit.
    pub fn new() -> Self {
        Self {
            counter: SlidingWindowCounter::new(),
            rules: RwLock::new(RulesConfig::new()),
            default_limit: Some(AppliedLimit {
                limit: WindowLimit::new(DEFAULT_LIMIT, DEFAULT_UNIT.duration())
                    .expect("built-in default limit is non-zero"),
                name: None,
            }),
        }
    }

    /// Create a rate limiter from its parts.
    ///
    /// Fails if `default_limit` is set but would admit nothing.
    pub fn with_parts(
        counter: SlidingWindowCounter,
        rules: RulesConfig,
        default_limit: Option<&RateLimitRule>,
    ) -> Result<Self> {
        rules.validate()?;
        let default_limit = default_limit
            .map(|rule| {
                Ok::<_, TurnstileError>(AppliedLimit {
                    limit: rule.window_limit()?,
                    name: rule.name.clone(),
                })
            })
            .transpose()?;

        Ok(Self {
            counter,
            rules: RwLock::new(rules),
            default_limit,
        })
    }

    /// Replace the rule set.
    pub fn set_rules(&self, rules: RulesConfig) {
        *self.rules.write() = rules;
    }

    /// Get a copy of the current rule set.
    pub fn rules(&self) -> RulesConfig {
        self.rules.read().clone()
    }

    /// Re-read rules from `path`. On failure the current rules stay in place.
    pub fn reload_rules(&self, path: &std::path::Path) -> Result<()> {
        let rules = RulesConfig::from_file(path)?;
        let domains = rules.domains.len();
        self.set_rules(rules);
        debug!(path = %path.display(), domains = domains, "Reloaded rate limit rules");
        Ok(())
    }

    pub fn counter(&self) -> &SlidingWindowCounter {
        &self.counter
    }

    /// Check the rate limit for a given domain and descriptor.
    ///
    /// `hits` of zero counts as one.
    pub fn check_rate_limit(
        &self,
        domain: &str,
        descriptor: &Descriptor,
        hits: u32,
    ) -> Result<DescriptorDecision> {
        let key = DescriptorKey::new(domain, descriptor);
        let hits = hits.max(1);

        let applied = match self.resolve_limit(domain, descriptor)? {
            Some(applied) => applied,
            None => {
                trace!(key = %key, "No rate limit applies");
                return Ok(DescriptorDecision::unlimited());
            }
        };

        trace!(key = %key, hits = hits, "Checking rate limit");

        let decision = self
            .counter
            .check(key.as_str(), &applied.limit, u64::from(hits))?;

        let code = if decision.admitted {
            LimitCode::Ok
        } else {
            debug!(key = %key, limit = decision.limit, "Rate limit exceeded");
            LimitCode::OverLimit
        };

        Ok(DescriptorDecision {
            code,
            limit: Some(applied),
            remaining: decision.remaining,
            reset_after: decision.reset_after,
        })
    }

    fn resolve_limit(&self, domain: &str, descriptor: &Descriptor) -> Result<Option<AppliedLimit>> {
        if let Some(limit_override) = &descriptor.limit {
            let limit = WindowLimit::per_unit(limit_override.requests_per_unit, limit_override.unit, 1)
                .map_err(|e| TurnstileError::InvalidRequest(format!("descriptor limit override: {}", e)))?;
            return Ok(Some(AppliedLimit { limit, name: None }));
        }

        let rules = self.rules.read();
        if let Some(rule) = rules.find_limit(domain, descriptor) {
            return Ok(Some(AppliedLimit {
                limit: rule.window_limit()?,
                name: rule.name.clone(),
            }));
        }

        Ok(self.default_limit.clone())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    fn validate_descriptor(&self, domain: &str, descriptor: &Descriptor) -> Result<()> {
        self.resolve_limit(domain, descriptor).map(|_| ())
    }

    async fn check_rate_limit(
        &self,
        domain: &str,
        descriptor: &Descriptor,
        hits: u32,
    ) -> Result<DescriptorDecision> {
        RateLimiter::check_rate_limit(self, domain, descriptor, hits)
    }
}

/// Periodically reload rules from `path` into `limiter`.
///
/// The first reload happens one `interval` after the call; the caller is
/// expected to have loaded the initial rules already.
pub fn spawn_rules_reloader(
    limiter: Arc<RateLimiter>,
    path: PathBuf,
    interval: Duration,
) -> JoinHandle<()> {
    info!(path = %path.display(), interval = ?interval, "Watching rate limit rules");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = limiter.reload_rules(&path) {
                warn!(path = %path.display(), error = %e, "Keeping previous rules after failed reload");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::evaluate;
    use crate::ratelimit::clock::ManualClock;

    fn limiter_with_clock(rules: RulesConfig, default: Option<&RateLimitRule>) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let counter = SlidingWindowCounter::with_clock(1024, Arc::new(clock.clone()));
        (RateLimiter::with_parts(counter, rules, default).unwrap(), clock)
    }

    #[test]
    fn test_check_creates_window() {
        let limiter = RateLimiter::new();
        let descriptor = Descriptor::from_pairs(&[("test", "value")]);

        let status = limiter.check_rate_limit("domain", &descriptor, 1).unwrap();

        assert_eq!(status.code, LimitCode::Ok);
        assert_eq!(status.remaining, DEFAULT_LIMIT - 1);
        assert_eq!(limiter.counter().len(), 1);
    }

    #[test]
    fn test_zero_hits_counts_as_one() {
        let limiter = RateLimiter::new();
        let descriptor = Descriptor::from_pairs(&[("test", "value")]);

        limiter.check_rate_limit("domain", &descriptor, 0).unwrap();
        assert_eq!(limiter.counter().recorded("domain:test=value"), Some(1));
    }

    #[test]
    fn test_override_limit_and_recovery() {
        let (limiter, clock) = limiter_with_clock(RulesConfig::new(), None);
        let descriptor = Descriptor::from_pairs(&[("test", "value")]).with_limit(5, TimeUnit::Second);

        for _ in 0..5 {
            let status = limiter.check_rate_limit("domain", &descriptor, 1).unwrap();
            assert_eq!(status.code, LimitCode::Ok);
        }

        let status = limiter.check_rate_limit("domain", &descriptor, 1).unwrap();
        assert_eq!(status.code, LimitCode::OverLimit);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.reset_after, Duration::from_secs(1));

        clock.advance(Duration::from_secs(1));
        let status = limiter.check_rate_limit("domain", &descriptor, 1).unwrap();
        assert_eq!(status.code, LimitCode::Ok);
    }

    #[test]
    fn test_zero_override_is_invalid_request() {
        let limiter = RateLimiter::new();
        let descriptor = Descriptor::from_pairs(&[("test", "value")]).with_limit(0, TimeUnit::Second);

        let err = limiter.check_rate_limit("domain", &descriptor, 1).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidRequest(_)));
        assert!(limiter.counter().is_empty());
    }

    #[test]
    fn test_rule_limit_applies() {
        let rules = RulesConfig::from_yaml(
            r#"
domain: edge
descriptors:
  - key: remote_address
    rate_limit:
      name: per_ip
      requests_per_unit: 2
      unit: minute
"#,
        )
        .unwrap();
        let (limiter, _clock) = limiter_with_clock(rules, None);
        let descriptor = Descriptor::from_pairs(&[("remote_address", "10.0.0.1")]);

        let status = limiter.check_rate_limit("edge", &descriptor, 2).unwrap();
        assert_eq!(status.code, LimitCode::Ok);
        let applied = status.limit.unwrap();
        assert_eq!(applied.name.as_deref(), Some("per_ip"));
        assert_eq!(applied.limit.window(), Duration::from_secs(60));

        let status = limiter.check_rate_limit("edge", &descriptor, 1).unwrap();
        assert_eq!(status.code, LimitCode::OverLimit);
    }

    #[test]
    fn test_unmatched_without_default_is_unlimited() {
        let (limiter, _clock) = limiter_with_clock(RulesConfig::new(), None);
        let descriptor = Descriptor::from_pairs(&[("anything", "x")]);

        for _ in 0..10_000 {
            let status = limiter.check_rate_limit("domain", &descriptor, 1).unwrap();
            assert_eq!(status, DescriptorDecision::unlimited());
        }
        assert!(limiter.counter().is_empty());
    }

    #[test]
    fn test_invalid_default_rejected() {
        let rule = RateLimitRule::new(0, TimeUnit::Second);
        let result = RateLimiter::with_parts(SlidingWindowCounter::new(), RulesConfig::new(), Some(&rule));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_different_domains_have_separate_windows() {
        let limiter = RateLimiter::new();
        let descriptor = Descriptor::from_pairs(&[("key", "value")]);

        limiter.check_rate_limit("domain1", &descriptor, 5).unwrap();
        limiter.check_rate_limit("domain2", &descriptor, 3).unwrap();

        assert_eq!(limiter.counter().recorded("domain1:key=value"), Some(5));
        assert_eq!(limiter.counter().recorded("domain2:key=value"), Some(3));
    }

    #[test]
    fn test_set_rules_takes_effect() {
        let (limiter, _clock) = limiter_with_clock(RulesConfig::new(), None);
        let descriptor = Descriptor::from_pairs(&[("user", "42")]);
        assert!(limiter.check_rate_limit("api", &descriptor, 1).unwrap().limit.is_none());

        limiter.set_rules(
            RulesConfig::from_yaml(
                r#"
domain: api
descriptors:
  - key: user
    rate_limit:
      requests_per_unit: 1
      unit: hour
"#,
            )
            .unwrap(),
        );

        assert_eq!(
            limiter.check_rate_limit("api", &descriptor, 1).unwrap().code,
            LimitCode::Ok
        );
        assert_eq!(
            limiter.check_rate_limit("api", &descriptor, 1).unwrap().code,
            LimitCode::OverLimit
        );
        assert!(limiter.rules().get_domain("api").is_some());
    }

    #[test]
    fn test_failed_reload_keeps_rules() {
        let rules = RulesConfig::from_yaml(
            r#"
domain: api
descriptors:
  - key: user
    rate_limit:
      requests_per_unit: 1
      unit: hour
"#,
        )
        .unwrap();
        let (limiter, _clock) = limiter_with_clock(rules, None);

        assert!(limiter
            .reload_rules(std::path::Path::new("/nonexistent/rules.yaml"))
            .is_err());
        assert!(limiter.rules().get_domain("api").is_some());
    }

    #[tokio::test]
    async fn test_invalid_descriptor_counts_nothing() {
        let limiter = RateLimiter::new();
        let good = Descriptor::from_pairs(&[("user", "1")]);
        let bad = Descriptor::from_pairs(&[("user", "2")]).with_limit(0, TimeUnit::Minute);

        let err = evaluate(&limiter, "d", &[good.clone(), bad], 1).await.unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidRequest(_)));
        assert_eq!(limiter.counter().recorded("d:user=1"), None);
        assert!(limiter.counter().is_empty());

        let verdict = evaluate(&limiter, "d", &[good], 1).await.unwrap();
        assert_eq!(verdict.overall, LimitCode::Ok);
        assert_eq!(limiter.counter().recorded("d:user=1"), Some(1));
    }

    #[tokio::test]
    async fn test_backend_trait_delegates() {
        let limiter = Arc::new(RateLimiter::new());
        let backend: Arc<dyn RateLimiterBackend> = limiter.clone();
        let descriptor = Descriptor::from_pairs(&[("k", "v")]);

        let status = backend.check_rate_limit("d", &descriptor, 2).await.unwrap();
        assert_eq!(status.code, LimitCode::Ok);
        assert_eq!(limiter.counter().recorded("d:k=v"), Some(2));
    }
}
