pub mod init;
pub mod local;
pub mod remote;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Forward local TCP ports through a WebSocket tunnel
    Local(local::Args),

    /// Accept tunnel sessions and relay them to their TCP targets
    Remote(remote::Args),

    /// Write a sample configuration file
    Init(init::Args),
}

/// A token cancelled on Ctrl+C.
pub(crate) fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down...");
                token.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });
    cancel
}
