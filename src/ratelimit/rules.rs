//! Rate limit rules configuration and matching.
//!
//! Rules use Envoy's rate limit configuration format: each domain holds a tree
//! of descriptor matchers, and more specific matches take precedence.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::descriptor::{Descriptor, DescriptorEntry};
use super::window::{TimeUnit, WindowLimit};
use crate::error::{Result, TurnstileError};

/// A complete rule set containing multiple domains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Map of domain name to domain configuration
    #[serde(default)]
    pub domains: HashMap<String, DomainConfig>,
}

/// Rules for a single rate limit domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// The domain name
    pub domain: String,
    /// Top-level descriptors for this domain
    #[serde(default)]
    pub descriptors: Vec<DescriptorConfig>,
}

/// One node of the descriptor matching tree.
///
/// A node matches an entry when the keys are equal and the node either has no
/// value or the values are equal. Children are matched against the next entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorConfig {
    /// The entry key to match
    pub key: String,
    /// Entry value to match; any value matches when unset
    #[serde(default)]
    pub value: Option<String>,
    /// Limit applied when the walk stops at this node
    #[serde(default)]
    pub rate_limit: Option<RateLimitRule>,
    /// Nodes matched against the next entry
    #[serde(default)]
    pub descriptors: Vec<DescriptorConfig>,
}

/// A limit of `requests_per_unit` events per `unit_multiplier` units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Events admitted per window
    pub requests_per_unit: u64,
    /// The time unit the window is measured in
    pub unit: TimeUnit,
    /// Window length in units of `unit`
    #[serde(default = "default_unit_multiplier")]
    pub unit_multiplier: u32,
    /// Optional name reported back with decisions
    #[serde(default)]
    pub name: Option<String>,
}

fn default_unit_multiplier() -> u32 {
    1
}

impl RateLimitRule {
    pub fn new(requests_per_unit: u64, unit: TimeUnit) -> Self {
        Self {
            requests_per_unit,
            unit,
            unit_multiplier: 1,
            name: None,
        }
    }

    /// The validated sliding window limit for this rule.
    pub fn window_limit(&self) -> Result<WindowLimit> {
        WindowLimit::per_unit(self.requests_per_unit, self.unit, self.unit_multiplier)
    }
}

impl RulesConfig {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a single domain document (Envoy's usual layout) or a
    /// `domains:` map. The result is validated before it is returned.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = match serde_yaml::from_str::<DomainConfig>(yaml) {
            Ok(domain_config) => {
                let mut config = RulesConfig::new();
                config
                    .domains
                    .insert(domain_config.domain.clone(), domain_config);
                config
            }
            Err(_) => serde_yaml::from_str(yaml).map_err(|e| {
                TurnstileError::Config(format!("Failed to parse rate limit rules: {}", e))
            })?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject rules that would admit nothing or everything.
    pub fn validate(&self) -> Result<()> {
        for (name, domain) in &self.domains {
            if name.is_empty() {
                return Err(TurnstileError::Config("domain name must not be empty".into()));
            }
            validate_descriptors(name, &domain.descriptors)?;
        }
        Ok(())
    }

    pub fn get_domain(&self, domain: &str) -> Option<&DomainConfig> {
        self.domains.get(domain)
    }

    /// Find the most specific rule for a descriptor within a domain.
    pub fn find_limit(&self, domain: &str, descriptor: &Descriptor) -> Option<&RateLimitRule> {
        self.get_domain(domain)?.find_limit(descriptor)
    }
}

fn validate_descriptors(domain: &str, configs: &[DescriptorConfig]) -> Result<()> {
    for config in configs {
        if let Some(rule) = &config.rate_limit {
            rule.window_limit().map_err(|e| {
                TurnstileError::Config(format!(
                    "domain {} descriptor {}: {}",
                    domain, config.key, e
                ))
            })?;
        }
        validate_descriptors(domain, &config.descriptors)?;
    }
    Ok(())
}

impl DomainConfig {
    pub fn find_limit(&self, descriptor: &Descriptor) -> Option<&RateLimitRule> {
        Self::find_limit_in_descriptors(&self.descriptors, &descriptor.entries)
    }

    fn find_limit_in_descriptors<'a>(
        configs: &'a [DescriptorConfig],
        entries: &[DescriptorEntry],
    ) -> Option<&'a RateLimitRule> {
        let (entry, rest) = entries.split_first()?;
        let mut best_match = None;

        for config in configs {
            if config.key != entry.key {
                continue;
            }
            if config.value.as_ref().is_some_and(|v| v != &entry.value) {
                continue;
            }

            if !rest.is_empty() {
                if let Some(child) = Self::find_limit_in_descriptors(&config.descriptors, rest) {
                    return Some(child);
                }
            }

            if let Some(limit) = &config.rate_limit {
                best_match = Some(limit);
            }
        }

        best_match
    }
}
