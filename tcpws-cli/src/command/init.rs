use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tcpws::{BufferConfig, LocalConfig, PortMapping, RemoteConfig};
use url::Url;

use crate::config::Config;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Print the sample instead of writing it
    #[arg(long)]
    print: bool,

    /// Overwrite an existing file
    #[arg(short, long)]
    force: bool,
}

fn sample() -> Result<Config> {
    Ok(Config {
        local: Some(LocalConfig {
            websocket_url: Url::parse("ws://localhost:8080/tunnel")?,
            listen_address: [127, 0, 0, 1].into(),
            port_mappings: vec![PortMapping {
                listen_port: 9999,
                target_ip: [127, 0, 0, 1].into(),
                target_port: 8888,
            }],
            headers: Default::default(),
            buffers: BufferConfig::default(),
        }),
        remote: RemoteConfig::default(),
    })
}

pub fn execute(args: &Args, path: Option<PathBuf>) -> Result<()> {
    let contents = toml::to_string_pretty(&sample()?).context("Failed to render sample config")?;
    if args.print {
        print!("{}", contents);
        return Ok(());
    }

    let path = path
        .or_else(Config::user_path)
        .context("Could not determine the config directory")?;
    if path.exists() && !args.force {
        bail!("{} already exists. Use --force to overwrite.", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote sample configuration to {}", path.display());
    Ok(())
}
