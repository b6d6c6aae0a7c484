//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod descriptor;
mod limiter;
mod rules;
mod window;

pub use backend::{evaluate, AppliedLimit, DescriptorDecision, LimitCode, RateLimiterBackend, Verdict};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use counter::{SlidingWindowCounter, DEFAULT_MAX_KEYS};
pub use descriptor::{Descriptor, DescriptorEntry, DescriptorKey, LimitOverride, UnknownUnit};
pub use limiter::{spawn_rules_reloader, RateLimiter};
pub use rules::{DescriptorConfig, DomainConfig, RateLimitRule, RulesConfig};
pub use window::{Decision, RateLimitState, TimeUnit, WindowLimit};
