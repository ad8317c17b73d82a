//! Local command - forwards mapped TCP ports through the tunnel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tcpws::relay::TcpRegistry;
use tcpws::status::format_bytes;
use tcpws::{BufferConfig, LocalConfig, LocalProxy, PortMapping, TracingReporter};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::config::Config;

/// Forward local TCP ports through a WebSocket tunnel
#[derive(Debug, clap::Args)]
pub struct Args {
    /// WebSocket URL of the remote end, e.g. ws://example.com/tunnel
    #[arg(long, env = "TCPWS_URL")]
    url: Option<Url>,

    /// Extra port mapping as LISTEN_PORT:TARGET_IP:TARGET_PORT (repeatable)
    #[arg(short, long = "map", value_parser = parse_mapping)]
    mappings: Vec<PortMapping>,

    /// Print the connection table every N seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    status_interval: u64,
}

fn parse_mapping(value: &str) -> Result<PortMapping, String> {
    let (listen, target) = value
        .split_once(':')
        .ok_or_else(|| format!("expected LISTEN_PORT:TARGET_IP:TARGET_PORT, got '{}'", value))?;
    let listen_port = listen
        .parse()
        .map_err(|_| format!("invalid listen port '{}'", listen))?;
    let target: SocketAddr = target
        .parse()
        .map_err(|_| format!("invalid target '{}'", target))?;
    Ok(PortMapping {
        listen_port,
        target_ip: target.ip(),
        target_port: target.port(),
    })
}

fn resolve(args: &Args, config: Option<LocalConfig>) -> Result<LocalConfig> {
    let mut local = match (config, &args.url) {
        (Some(mut local), url) => {
            if let Some(url) = url {
                local.websocket_url = url.clone();
            }
            local
        }
        (None, Some(url)) => LocalConfig {
            websocket_url: url.clone(),
            listen_address: [0, 0, 0, 0].into(),
            port_mappings: Vec::new(),
            headers: Default::default(),
            buffers: BufferConfig::default(),
        },
        (None, None) => anyhow::bail!(
            "No [local] configuration found. Pass --url or run 'tcpws init' first."
        ),
    };
    local.port_mappings.extend(args.mappings.iter().cloned());
    local.validate().context("Invalid local configuration")?;
    Ok(local)
}

pub async fn execute(args: &Args, config: Config) -> Result<()> {
    let local = resolve(args, config.local)?;
    let mappings = local.port_mappings.clone();
    let cancel = super::shutdown_token();

    let proxy = LocalProxy::connect(local, Arc::new(TracingReporter), cancel.clone())
        .await
        .context("Failed to start the local proxy")?;

    println!("\n✓ Tunnel established!");
    for (mapping, addr) in mappings.iter().zip(proxy.listen_addrs()) {
        println!("  {} -> {}:{}", addr, mapping.target_ip, mapping.target_port);
    }
    println!("\nPress Ctrl+C to stop the tunnel.\n");

    if args.status_interval > 0 {
        tokio::spawn(print_status(
            proxy.registry(),
            Duration::from_secs(args.status_interval),
            cancel.clone(),
        ));
    }

    proxy.run().await?;
    Ok(())
}

async fn print_status(registry: Arc<TcpRegistry>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let rows = registry.snapshot();
        info!("{} active connection(s)", rows.len());
        for row in rows {
            info!(
                "  {} {} -> {}  sent {}  received {}  {}s",
                row.client_id,
                row.peer.map(|peer| peer.to_string()).unwrap_or_else(|| "-".into()),
                row.target,
                format_bytes(row.bytes_sent),
                format_bytes(row.bytes_received),
                row.age.as_secs()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;

    #[test]
    fn test_parse_mapping() {
        let mapping = parse_mapping("9999:127.0.0.1:8888").unwrap();
        assert_eq!(mapping.listen_port, 9999);
        assert_eq!(mapping.target_ip, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(mapping.target_port, 8888);

        let mapping = parse_mapping("5432:[::1]:5432").unwrap();
        assert!(mapping.target_ip.is_ipv6());

        assert!(parse_mapping("9999").is_err());
        assert!(parse_mapping("x:127.0.0.1:1").is_err());
        assert!(parse_mapping("1:localhost:1").is_err());
    }
}
