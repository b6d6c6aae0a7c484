use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, TurnstileConfig};
use turnstile::grpc::GrpcServer;
use turnstile::http::{HttpServer, RateLimitLayer};
use turnstile::ratelimit::{spawn_rules_reloader, RateLimiter, RulesConfig, SlidingWindowCounter};

/// Sliding window rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the gRPC listen address
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Override the rate limit rules file
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Override the log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TurnstileConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(rules) = args.rules {
        config.rate_limiting.rules_path = Some(rules);
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config);

    info!("Starting Turnstile Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        http_addr = %config.server.http_addr,
        "Configuration loaded"
    );

    let rules = match &config.rate_limiting.rules_path {
        Some(path) => RulesConfig::from_file(path)
            .with_context(|| format!("failed to load rules from {}", path.display()))?,
        None => RulesConfig::new(),
    };

    let rate_limiter = Arc::new(RateLimiter::with_parts(
        SlidingWindowCounter::with_max_keys(config.rate_limiting.max_keys),
        rules,
        config.rate_limiting.default_limit.as_ref(),
    )?);
    info!(
        domains = rate_limiter.rules().domains.len(),
        max_keys = config.rate_limiting.max_keys,
        "Rate limiter initialized"
    );

    let reloader = match (&config.rate_limiting.rules_path, config.rate_limiting.reload_interval()) {
        (Some(path), Some(interval)) => Some(spawn_rules_reloader(
            Arc::clone(&rate_limiter),
            path.clone(),
            interval,
        )),
        _ => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = JoinSet::new();

    let grpc_server = GrpcServer::new(config.server.grpc_addr, Arc::clone(&rate_limiter));
    servers.spawn(grpc_server.serve_with_shutdown(shutdown_requested(shutdown_rx.clone())));

    if config.http.enabled {
        let layer = RateLimitLayer::new(
            Arc::new(SlidingWindowCounter::with_max_keys(config.rate_limiting.max_keys)),
            config.http.policy()?,
        );
        let http_server = HttpServer::new(config.server.http_addr, Arc::clone(&rate_limiter), layer);
        servers.spawn(http_server.serve_with_shutdown(shutdown_requested(shutdown_rx)));
    }

    let result = supervise(servers, shutdown_signal(), shutdown_tx).await;

    if let Some(reloader) = reloader {
        reloader.abort();
    }

    info!("Turnstile Rate Limiting Service stopped");
    result
}

/// Run until `shutdown` resolves or a server exits, then stop every server.
///
/// A server exiting before shutdown was requested is an error, even when it
/// returned `Ok`. The first error wins; later ones are logged.
async fn supervise<S>(
    mut servers: JoinSet<turnstile::error::Result<()>>,
    shutdown: S,
    stop: watch::Sender<bool>,
) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    let mut result = tokio::select! {
        _ = shutdown => Ok(()),
        Some(joined) = servers.join_next() => {
            let outcome = flatten(joined).and_then(|()| Err(anyhow!("server exited before shutdown")));
            if let Err(e) = &outcome {
                error!(error = %e, "Server stopped, shutting down");
            }
            outcome
        }
    };

    let _ = stop.send(true);

    while let Some(joined) = servers.join_next().await {
        if let Err(e) = flatten(joined) {
            if result.is_ok() {
                result = Err(e);
            } else {
                error!(error = %e, "Server failed during shutdown");
            }
        }
    }

    result
}

fn flatten(joined: Result<turnstile::error::Result<()>, JoinError>) -> anyhow::Result<()> {
    Ok(joined??)
}

fn init_tracing(config: &TurnstileConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Resolve once the shutdown flag flips (or its sender is gone).
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile::error::TurnstileError;

    #[tokio::test]
    async fn test_server_bind_failure_stops_everything() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let (stop, stopped) = watch::channel(false);
        let mut servers = JoinSet::new();
        servers.spawn(
            GrpcServer::new(addr, Arc::new(RateLimiter::new()))
                .serve_with_shutdown(shutdown_requested(stopped.clone())),
        );
        servers.spawn(async move {
            shutdown_requested(stopped).await;
            Ok(())
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            supervise(servers, std::future::pending(), stop),
        )
        .await
        .expect("supervise returned after the bind failure");

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TurnstileError>(),
            Some(TurnstileError::Grpc(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_servers_cleanly() {
        let (stop, stopped) = watch::channel(false);
        let mut servers = JoinSet::new();
        for _ in 0..2 {
            let stopped = stopped.clone();
            servers.spawn(async move {
                shutdown_requested(stopped).await;
                Ok(())
            });
        }

        let result = supervise(servers, async {}, stop).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_early_clean_exit_is_an_error() {
        let (stop, _stopped) = watch::channel(false);
        let mut servers = JoinSet::new();
        servers.spawn(async { Ok(()) });

        let result = supervise(servers, std::future::pending(), stop).await;
        assert!(result.is_err());
    }
}
