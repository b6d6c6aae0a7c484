//! Rate limit descriptors and the keys derived from them.

use serde::{Deserialize, Serialize};

use super::window::TimeUnit;
use crate::grpc::proto::envoy::extensions::common::ratelimit::v3::RateLimitDescriptor;

/// One `key=value` pair of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorEntry {
    pub key: String,
    pub value: String,
}

impl DescriptorEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A limit supplied by the caller instead of the configured one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverride {
    pub requests_per_unit: u64,
    pub unit: TimeUnit,
}

/// An ordered list of entries describing a request, as sent by Envoy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default)]
    pub entries: Vec<DescriptorEntry>,
    #[serde(default)]
    pub limit: Option<LimitOverride>,
}

impl Descriptor {
    /// Build a descriptor from `(key, value)` pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            entries: pairs
                .iter()
                .map(|(k, v)| DescriptorEntry::new(*k, *v))
                .collect(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, requests_per_unit: u64, unit: TimeUnit) -> Self {
        self.limit = Some(LimitOverride {
            requests_per_unit,
            unit,
        });
        self
    }
}

/// Error converting a wire descriptor whose override uses an unknown unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownUnit(pub i32);

impl TryFrom<&RateLimitDescriptor> for Descriptor {
    type Error = UnknownUnit;

    fn try_from(descriptor: &RateLimitDescriptor) -> Result<Self, Self::Error> {
        let limit = match &descriptor.limit {
            Some(limit_override) => Some(LimitOverride {
                requests_per_unit: u64::from(limit_override.requests_per_unit),
                unit: TimeUnit::from_proto(limit_override.unit)
                    .ok_or(UnknownUnit(limit_override.unit))?,
            }),
            None => None,
        };

        Ok(Self {
            entries: descriptor
                .entries
                .iter()
                .map(|e| DescriptorEntry::new(e.key.clone(), e.value.clone()))
                .collect(),
            limit,
        })
    }
}

/// The counter key for a descriptor within a domain.
///
/// Entries keep their request order, so `a=1,b=2` and `b=2,a=1` are distinct
/// keys, matching how the rule tree walks them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey(String);

impl DescriptorKey {
    pub fn new(domain: &str, descriptor: &Descriptor) -> Self {
        let entries: Vec<String> = descriptor
            .entries
            .iter()
            .map(|e| format!("{}={}", e.key, e.value))
            .collect();

        Self(format!("{}:{}", domain, entries.join(",")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
