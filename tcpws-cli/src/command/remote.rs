use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tcpws::{RemoteServer, TracingReporter};

use crate::config::Config;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Address to listen on for HTTP and WebSocket connections
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Request path upgraded to the tunnel WebSocket
    #[arg(long)]
    path: Option<String>,
}

pub async fn execute(args: &Args, config: Config) -> Result<()> {
    let mut remote = config.remote;
    if let Some(listen) = args.listen {
        remote.listen = listen;
    }
    if let Some(path) = &args.path {
        remote.path = path.clone();
    }

    // Key generation is CPU bound.
    let server = tokio::task::spawn_blocking(move || RemoteServer::new(remote, Arc::new(TracingReporter)))
        .await?
        .context("Failed to start the remote server")?;
    let server = Arc::new(server);

    let listener = server
        .bind()
        .await
        .with_context(|| format!("Failed to bind {}", server.config().listen))?;
    let cancel = super::shutdown_token();
    server.serve(listener, cancel).await?;
    Ok(())
}
