use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tcpws::{LocalConfig, RemoteConfig};

use crate::sys;

const USER_PATH: &str = "tcpws/config.toml";
const ENV_PREFIX: &str = "TCPWS";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub local: Option<LocalConfig>,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Config {
    pub fn user_path() -> Option<PathBuf> {
        sys::dirs::config_dir().map(|config_dir| config_dir.join(USER_PATH))
    }

    /// Reads `path`, or the per-user file when no path is given, then applies
    /// `TCPWS_`-prefixed environment overrides such as `TCPWS_REMOTE__LISTEN`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(path) = Self::user_path() {
                    builder = builder.add_source(config::File::from(path).required(false));
                }
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration")?;
        settings
            .try_deserialize()
            .context("Invalid configuration")
    }
}
