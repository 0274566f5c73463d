//! holepunch - peer-to-peer UDP connectivity toolkit
//!
//! Inspect what the ICE stack sees from this machine: local candidates and STUN mappings.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use holepunch::config::Config;
use holepunch::ice::{Candidate, CandidateInfo, CandidateManager};
use holepunch::net::socket::{Endpoint, StunSocket};
use holepunch::net::SystemNetwork;
use holepunch::stun::StunType;
use holepunch::{BindingPacer, Scope, StunManager};

#[derive(Parser)]
#[command(name = "holepunch")]
#[command(about = "Peer-to-peer UDP connectivity over STUN, TURN and ICE", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Gather and print local ICE candidates
    Gather {
        /// Give up on servers that have not answered after this many seconds
        #[arg(short, long, default_value = "45")]
        seconds: u64,

        /// Print one JSON object per candidate
        #[arg(long)]
        json: bool,
    },

    /// Ask a STUN server for this machine's mapped address
    Probe {
        /// Server as host:port
        server: String,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

/// A gathered candidate as printed by `gather --json`.
#[derive(Serialize)]
struct CandidateLine {
    #[serde(flatten)]
    info: CandidateInfo,
    base: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let config = Config::load_from(&config_path)?;

    match cli.command {
        Commands::Gather { seconds, json } => {
            gather(&config, Duration::from_secs(seconds), json).await?;
        }
        Commands::Probe { server } => {
            probe(&config, &server).await?;
        }
        Commands::Config { init } => {
            if init {
                Config::default().save_to(&config_path)?;
                println!("Wrote defaults to {}", config_path.display());
            }
            let config = Config::load_from(&config_path)?;
            println!("# {}", config_path.display());
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to serialize config")?
            );
        }
    }

    Ok(())
}

async fn gather(config: &Config, limit: Duration, json: bool) -> Result<()> {
    let scope = Scope::new();
    let stun = StunManager::new();
    let pacer = BindingPacer::new(&scope, config.pacing_interval());
    let servers = config.gather_config().await;
    tracing::info!(
        "Gathering with {} STUN and {} TURN servers",
        servers.stun_servers.len(),
        servers.turn_servers.len()
    );

    let manager = CandidateManager::start(&scope, Arc::new(SystemNetwork), stun, pacer, servers);
    let mut candidates = manager.get_candidates();
    let deadline = tokio::time::Instant::now() + limit;
    let mut count = 0;
    while let Ok(Some(candidate)) = tokio::time::timeout_at(deadline, candidates.recv()).await {
        count += 1;
        if json {
            let line = CandidateLine {
                info: candidate.info(),
                base: candidate.base(),
            };
            println!("{}", serde_json::to_string(&line)?);
        } else {
            println!(
                "{:<6} {:<45} base {:<45} priority {}",
                candidate.typ().to_string(),
                candidate.address().to_string(),
                candidate.base().to_string(),
                candidate.priority()
            );
        }
    }
    if !manager.is_done() {
        tracing::warn!("Gathering did not finish within {:?}", limit);
    }
    tracing::info!("Found {} candidates", count);

    drop(candidates);
    manager.shutdown().await;
    scope.shutdown().await;
    Ok(())
}

async fn probe(config: &Config, server: &str) -> Result<()> {
    let server: SocketAddr = tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("Could not resolve {}", server))?
        .next()
        .with_context(|| format!("{} has no addresses", server))?;

    let scope = Scope::new();
    let unspecified = match server.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let transport = tokio::net::UdpSocket::bind(SocketAddr::new(unspecified, 0))
        .await
        .context("Failed to bind UDP socket")?;
    let socket = StunSocket::start(
        &scope,
        Arc::new(transport),
        StunManager::new(),
        BindingPacer::new(&scope, config.pacing_interval()),
    )
    .context("Failed to start socket")?;

    tracing::info!("Probing {} from {}", server, socket.local_addr());
    let response = Endpoint::new(socket.clone(), server)
        .request(StunType::Binding, Vec::new())
        .await;
    scope.shutdown().await;

    let Some(response) = response else {
        bail!("No response from {}", server);
    };
    let Some(mapped) = response.message.mapped_address() else {
        bail!("{} answered without a mapped address", server);
    };
    println!("mapped {} rtt {:?}", mapped, response.rtt);
    if let Some(software) = response.message.software() {
        println!("server {}", software);
    }
    Ok(())
}
