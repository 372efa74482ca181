use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use ospd_rs::config::{Cli, DaemonConfig};
use ospd_rs::registry::ScanRegistry;
use ospd_rs::server::{self, AppState};
use ospd_rs::{logging, tls};

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::from_cli(Cli::parse())?;
    logging::init(config.debug);

    info!(
        bind = %config.bind_address,
        port = config.port,
        concurrency = config.engine.concurrency,
        scan_timeout_s = config.engine.scan_timeout.as_secs(),
        "starting ospd-rs"
    );

    let acceptor = tls::load_acceptor(&config.cert_file, &config.key_file)?;
    let addr = SocketAddr::new(config.bind_address, config.port);
    let listener = tls::TlsListener::bind(addr, acceptor).await?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        ctrl_c.cancel();
    });

    let registry = Arc::new(ScanRegistry::new());
    let state = AppState::new(registry.clone(), config.engine, shutdown);
    server::serve(listener, state).await?;

    info!(remaining = registry.len(), "daemon stopped");
    Ok(())
}
