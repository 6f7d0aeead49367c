//! mgate — mesh connectivity gateway.

use clap::Parser;
use mgate_gateway::config::GatewayConfig;
use mgate_gateway::echo::EchoHandler;
use mgate_gateway::router::Gateway;
use mgate_gateway::tls::NodeIdentity;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// mgate — mesh connectivity gateway
#[derive(Parser, Debug)]
#[command(name = "mgate", version, about = "Mesh connectivity gateway")]
struct Cli {
    /// Base port: mesh HTTPS on PORT, SOCKS5 on PORT+1, sniffing TCP on PORT+2
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.mgate/config.toml")]
    config: String,

    /// Identity certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// Identity private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Regenerate the identity certificate before starting
    #[arg(long)]
    generate_cert: bool,

    /// Keep a reverse tunnel to this gateway address (repeatable)
    #[arg(long = "h2r")]
    h2r: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load gateway config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(
        Some(&config_path),
        cli.port,
        cli.cert.as_deref(),
        cli.key.as_deref(),
        &cli.h2r,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if cli.generate_cert {
        let _ = std::fs::remove_file(&config.cert_path);
        let _ = std::fs::remove_file(&config.key_path);
    }

    // Identity keys, generated on first run
    let identity = match NodeIdentity::load_or_generate(&config.cert_path, &config.key_path) {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "failed to load node identity");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        identity = %identity.identity,
        "starting mgate"
    );

    let gateway = Arc::new(Gateway::new(config, identity));
    gateway.register_handler("echo", Arc::new(EchoHandler));

    if let Err(e) = gateway.start().await {
        error!(error = %e, "failed to start gateway");
        std::process::exit(1);
    }

    shutdown_signal().await;
    info!("received shutdown signal");
    gateway.listeners.close_all().await;
    info!("mgate stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
