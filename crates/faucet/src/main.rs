//! Faucet service binary

use clap::Parser;
use faucet::api::{router, AppState};
use faucet::config::load_funding_identities;
use faucet::{Batcher, FaucetConfig, RpcTransferClient, WeightedWindowLimiter};
use faucet_common::utils::config::load_config;
use faucet_common::utils::logging::{init_logging, LoggingConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Faucet service CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path (TOML, YAML or JSON)
    #[arg(short, long, env = "FAUCET_CONFIG")]
    config: Option<String>,

    /// Server address
    #[arg(long, env = "FAUCET_SERVER_ADDR")]
    server_addr: Option<String>,

    /// RPC URL of the signing node
    #[arg(long, env = "FAUCET_RPC_URL")]
    rpc_url: Option<String>,

    /// File with funding account addresses, one per line
    #[arg(long, env = "FAUCET_FUNDING_ADDRESSES")]
    funding_addresses: Option<String>,

    /// Amount to transfer per request
    #[arg(long, env = "FAUCET_TRANSFER_AMOUNT")]
    transfer_amount: Option<String>,

    /// Denomination of the transferred amount
    #[arg(long, env = "FAUCET_DENOM")]
    denom: Option<String>,

    /// Limit of requests per IP in the format <num-of-req>/<period>
    #[arg(long, env = "FAUCET_IP_RATE_LIMIT")]
    ip_rate_limit: Option<String>,

    /// Maximum outputs per transaction
    #[arg(long, env = "FAUCET_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Bound on one chain submission (seconds)
    #[arg(long, env = "FAUCET_DISPATCH_TIMEOUT_SECS")]
    dispatch_timeout_secs: Option<u64>,

    /// How long a caller waits for its transfer (seconds)
    #[arg(long, env = "FAUCET_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    /// Enable CORS (true/false)
    #[arg(long, env = "FAUCET_CORS_ENABLED")]
    cors_enabled: Option<bool>,

    /// Log level
    #[arg(long, env = "FAUCET_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, env = "FAUCET_LOG_FORMAT", default_value = "pretty")]
    log_format: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn apply(&self, config: &mut FaucetConfig) {
        if let Some(addr) = &self.server_addr {
            config.server_addr = addr.clone();
        }
        if let Some(rpc_url) = &self.rpc_url {
            config.rpc_url = rpc_url.clone();
        }
        if let Some(path) = &self.funding_addresses {
            config.funding_addresses_path = path.clone();
        }
        if let Some(amount) = &self.transfer_amount {
            config.transfer_amount = amount.clone();
        }
        if let Some(denom) = &self.denom {
            config.denom = denom.clone();
        }
        if let Some(limit) = &self.ip_rate_limit {
            config.ip_rate_limit = limit.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(secs) = self.dispatch_timeout_secs {
            config.dispatch_timeout_secs = secs;
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout_secs = secs;
        }
        if let Some(enabled) = self.cors_enabled {
            config.cors_enabled = enabled;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&LoggingConfig {
        level: if args.debug { "debug".to_string() } else { args.log_level.clone() },
        format: args.log_format.clone(),
        ..Default::default()
    })?;

    info!("Starting faucet v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match &args.config {
        Some(path) => load_config::<FaucetConfig, _>(path)?,
        None => FaucetConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let transfer_amount = config.transfer_coin()?;
    let rate_limit = config.rate_limit()?;
    let funding_identities = load_funding_identities(&config.funding_addresses_path)?;

    info!("Configuration:");
    info!("  Server address: {}", config.server_addr);
    info!("  RPC URL: {}", config.rpc_url);
    info!("  Transfer amount: {}", transfer_amount);
    info!("  Rate limit: {} requests / {:?}", rate_limit.requests, rate_limit.period);
    info!("  Batch size: {}", config.batch_size);
    info!(
        addresses = ?funding_identities.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
        "  Funding accounts: {}",
        funding_identities.len()
    );

    let client = Arc::new(RpcTransferClient::new(config.rpc_url.clone()));
    let batcher = Arc::new(
        Batcher::new(client, funding_identities, config.batch_size)?
            .with_dispatch_timeout(config.dispatch_timeout()),
    );
    let limiter = Arc::new(WeightedWindowLimiter::new(rate_limit.requests, rate_limit.period));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let batcher_task = {
        let batcher = batcher.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { batcher.run(wait_for_shutdown(shutdown)).await })
    };
    let limiter_task = {
        let limiter = limiter.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { limiter.run(wait_for_shutdown(shutdown)).await })
    };
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let app = router(
        AppState {
            batcher,
            limiter,
            transfer_amount,
            request_timeout: config.request_timeout(),
        },
        config.cors_enabled,
    );

    // Start server
    let addr: SocketAddr = config.server_addr.parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await?;

    if let Err(e) = batcher_task.await? {
        error!("Batcher stopped with error: {}", e);
        return Err(e.into());
    }
    limiter_task.await?;

    info!("Shut down gracefully");
    Ok(())
}

/// Resolves once shutdown was requested or the sender is gone.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "faucet",
            "--batch-size",
            "4",
            "--dispatch-timeout-secs",
            "5",
            "--request-timeout-secs",
            "7",
            "--cors-enabled",
            "false",
        ])
        .unwrap();

        let mut config = FaucetConfig::default();
        args.apply(&mut config);

        assert_eq!(config.batch_size, 4);
        assert_eq!(config.dispatch_timeout(), std::time::Duration::from_secs(5));
        assert_eq!(config.request_timeout(), std::time::Duration::from_secs(7));
        assert!(!config.cors_enabled);
    }

    #[test]
    fn test_missing_flags_keep_config_values() {
        let args = Args::try_parse_from(["faucet"]).unwrap();
        let mut config = FaucetConfig {
            dispatch_timeout_secs: 9,
            cors_enabled: false,
            ..Default::default()
        };
        args.apply(&mut config);

        assert_eq!(config.dispatch_timeout_secs, 9);
        assert!(!config.cors_enabled);
    }
}
