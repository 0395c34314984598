//! Client: the private side of the tunnel.
//!
//! Dials the gateway, executes forwarded requests against the local target and streams the
//! responses back. The connection is re-established after any loss until shutdown.

mod engine;
mod executor;
mod supervisor;

pub use engine::ProxyEngine;
pub use executor::{ByteStream, ExecRequest, ExecResponse, Executor, ExecutorError, HttpExecutor};
pub use supervisor::{ShutdownHandle, Supervisor, SupervisorState};

use crate::config::{self, Config};
use crate::protocol::TunnelInfo;
use crate::routing;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Ask the gateway for a fresh tunnel name (`POST {server}/api/tunnels`).
pub async fn allocate_tunnel(server: &str) -> Result<TunnelInfo> {
    let url = format!("{}/api/tunnels", server.trim().trim_end_matches('/'));
    let res = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("requesting a tunnel from {}", url))?;
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        anyhow::bail!("gateway refused tunnel allocation: {} {}", status, body.trim());
    }
    res.json::<TunnelInfo>()
        .await
        .context("parsing tunnel allocation response")
}

/// Run the client until Ctrl+C: claim (or allocate) the tunnel, then keep it connected.
///
/// `config.client` is used as given; callers apply environment and flag overrides first
/// (see [`config::resolve_server`] and [`config::resolve_tunnel`]).
pub async fn run_client(config: Config) -> Result<()> {
    let server = config.client.server.trim().trim_end_matches('/').to_string();
    let tunnel = config
        .client
        .tunnel
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let tunnel = match tunnel {
        Some(name) => {
            if !routing::is_valid_tunnel_name(&name) {
                anyhow::bail!(
                    "invalid tunnel name '{}': use lowercase letters, digits and '-'",
                    name
                );
            }
            name
        }
        None => {
            let info = allocate_tunnel(&server).await?;
            println!("tunnel {} is public at {}", info.name, info.url);
            info.name
        }
    };

    let executor = HttpExecutor::new(config.client.target.clone())
        .context("building HTTP client for local target")?;
    log::info!("forwarding tunnel {} to {}", tunnel, executor.base_url());

    let supervisor = Supervisor::new(
        config::connect_url(&server, &tunnel),
        config.client.reconnect_delay(),
        Arc::new(executor),
    );
    let shutdown = supervisor.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });
    supervisor.run().await;
    Ok(())
}
