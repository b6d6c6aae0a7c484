//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::envoy::service::ratelimit::v3::rate_limit_service_server::RateLimitServiceServer;
use super::service::RateLimitServiceImpl;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::RateLimiterBackend;

/// gRPC server for the rate limit service.
pub struct GrpcServer<R: RateLimiterBackend + ?Sized + 'static> {
    addr: SocketAddr,
    rate_limiter: Arc<R>,
}

impl<R: RateLimiterBackend + ?Sized + 'static> GrpcServer<R> {
    /// Create a new gRPC server backed by `rate_limiter`.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<R>) -> Self {
        Self { addr, rate_limiter }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = RateLimitServiceImpl::new(self.rate_limiter);

        info!(addr = %self.addr, "Starting gRPC server for RateLimitService");

        Server::builder()
            .add_service(RateLimitServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TurnstileError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiter;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let server = GrpcServer::new(addr, Arc::new(RateLimiter::new()));
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = GrpcServer::new(addr, Arc::new(RateLimiter::new()));

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
