//! Turnstile - Sliding Window Rate Limiting Service
//!
//! This crate implements per-key sliding window admission control and serves
//! it two ways: as Envoy Proxy's global rate limit gRPC API, and as HTTP
//! middleware plus a small JSON decision API.

pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod ratelimit;
