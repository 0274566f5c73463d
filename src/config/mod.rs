//! Persisted configuration: servers and tunables.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ice::{GatherConfig, IceConfig};
use crate::net::relay::TurnServer;

fn default_stun_servers() -> Vec<String> {
    vec!["stun.l.google.com:19302".to_string()]
}

fn default_relay_latency_threshold_ms() -> u64 {
    100
}

fn default_pacing_interval_ms() -> u64 {
    50
}

/// A TURN server. With credentials set, requests carry USERNAME and a short-term
/// MESSAGE-INTEGRITY keyed by `password`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// `host:port`
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// STUN servers as `host:port`, resolved when gathering starts
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServerConfig>,
    /// Extra RTT charged per relayed side when picking the pair to nominate
    #[serde(default = "default_relay_latency_threshold_ms")]
    pub relay_latency_threshold_ms: u64,
    /// Gap between peer-to-peer binding requests
    #[serde(default = "default_pacing_interval_ms")]
    pub pacing_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stun_servers: default_stun_servers(),
            turn_servers: Vec::new(),
            relay_latency_threshold_ms: default_relay_latency_threshold_ms(),
            pacing_interval_ms: default_pacing_interval_ms(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("gg", "holepunch", "holepunch")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from `path`, or defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // TURN passwords may be stored here
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing_interval_ms)
    }

    pub fn ice_config(&self, controlling: bool) -> IceConfig {
        IceConfig {
            controlling,
            relay_latency_threshold: Duration::from_millis(self.relay_latency_threshold_ms),
        }
    }

    /// Resolve every server. Names that do not resolve are skipped with a warning.
    pub async fn gather_config(&self) -> GatherConfig {
        let mut stun_servers = Vec::new();
        for server in &self.stun_servers {
            stun_servers.extend(resolve(server).await);
        }
        let mut turn_servers = Vec::new();
        for server in &self.turn_servers {
            turn_servers.extend(resolve(&server.address).await.into_iter().map(|address| {
                TurnServer {
                    address,
                    username: server.username.clone(),
                    password: server.password.clone(),
                }
            }));
        }
        GatherConfig {
            stun_servers,
            turn_servers,
        }
    }
}

async fn resolve(server: &str) -> Vec<SocketAddr> {
    match tokio::net::lookup_host(server).await {
        Ok(addrs) => {
            let mut out: Vec<SocketAddr> = Vec::new();
            for addr in addrs {
                // One address per family is enough to discover each mapping.
                if !out.iter().any(|a| a.is_ipv4() == addr.is_ipv4()) {
                    out.push(addr);
                }
            }
            out
        }
        Err(e) => {
            tracing::warn!("Could not resolve {}: {}", server, e);
            Vec::new()
        }
    }
}
