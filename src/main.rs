mod body;
mod ccache;
mod config;
mod connection;
mod credentials;
mod discovery;
mod error;
mod handler;
mod http;
mod kerberos;
mod net;
mod pool;
mod repeater;
mod scheme;
mod server;
#[cfg(test)]
mod testing;
mod tunnel;

use crate::config::{Cli, ProxyConfig};
use crate::credentials::CredentialManager;
use crate::discovery::NslookupDiscovery;
use crate::kerberos::KinitLogin;
use crate::pool::ConnectionPool;
use crate::server::{ProxyServer, ProxyServices};
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use std::sync::Arc;
use tokio::signal;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();

    // Create proxy configuration from CLI arguments
    let config = Arc::new(ProxyConfig::from_cli(args)?);

    info!("Upstream proxy: {}", config.upstream);
    info!("Kerberos principal: {}", config.identity.principal());

    let login = KinitLogin::new(&config).wrap_err_with(|| {
        format!("cannot prepare work directory {}", config.work_dir.display())
    })?;
    // the environment is only written while this is the only thread
    login.export_environment();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to build Tokio runtime")?;
    runtime.block_on(run(config, login))
}

async fn run(config: Arc<ProxyConfig>, login: KinitLogin) -> Result<()> {
    let credentials = Arc::new(CredentialManager::new(
        &config,
        Arc::new(NslookupDiscovery::new()),
        Arc::new(login),
    ));
    let pool = Arc::new(ConnectionPool::new(Arc::clone(&config)));
    let services = Arc::new(ProxyServices::new(
        Arc::clone(&config),
        Arc::clone(&credentials),
        Arc::clone(&pool),
    ));
    let mut server = ProxyServer::new(services);

    let local_addr = match server.start().await {
        Ok(addr) => addr,
        Err(e) => {
            pool.close();
            credentials.close().await;
            return Err(e).wrap_err("proxy failed to start");
        }
    };
    info!("HTTP Proxy listening on http://{}", local_addr);

    signal::ctrl_c()
        .await
        .wrap_err("failed to install CTRL+C handler")?;
    info!("Shutdown signal received");

    server.stop().await;

    let active = server.active_connections();
    if active > 0 {
        info!("Waiting for {} connections to close...", active);

        for i in 1..=30 {
            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            let remaining = server.active_connections();

            if remaining == 0 {
                info!("All connections closed gracefully");
                break;
            }

            if i % 5 == 0 {
                info!("Still waiting for {} connections... ({}/30s)", remaining, i);
            }
        }

        let final_count = server.active_connections();
        if final_count > 0 {
            warn!("Forced shutdown with {} connections still active", final_count);
        }
    }

    pool.close();
    credentials.close().await;
    info!("Server shutdown complete");

    Ok(())
}
