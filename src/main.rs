//! Sourbridge - ENet-style bridge for a poll-driven game runtime
//!
//! Connects to a Sour cluster over one envelope stream and presents it to
//! the runtime as connect/disconnect/receive frames it polls once per tick.

mod bridge;
mod config;
mod network;
mod protocol;
mod runtime;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bridge::Bridge;
use config::Config;
use runtime::HeadlessRuntime;

/// Sourbridge - Bridge a game runtime onto a Sour cluster
#[derive(Parser)]
#[command(name = "sourbridge")]
#[command(author = "Sour Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Bridge a poll-driven game runtime onto a Sour cluster", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and drive a headless runtime
    Run {
        /// Cluster host
        #[arg(long)]
        host: Option<String>,

        /// Cluster port
        #[arg(short, long)]
        port: Option<u16>,

        /// Server to join once connected (empty = lobby)
        #[arg(short, long)]
        join: Option<String>,
    },

    /// Send one cluster command and print its response
    Command {
        /// Command text, e.g. "creategame ffa complex"
        text: String,

        /// Cluster host
        #[arg(long)]
        host: Option<String>,

        /// Cluster port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run { host, port, join } => {
            apply_overrides(&mut config, host, port);
            if join.is_some() {
                config.general.join = join;
            }
            run_bridge(config).await?;
        }
        Commands::Command { text, host, port } => {
            apply_overrides(&mut config, host, port);
            run_command(config, &text).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => print_protocol_info(&config),
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, host: Option<String>, port: Option<u16>) {
    if let Some(host) = host {
        config.network.host = host;
    }
    if let Some(port) = port {
        config.network.port = port;
    }
}

fn open_bridge(config: &Config) -> Bridge<HeadlessRuntime> {
    let (session_id, link) = network::open_link(config.network_config());
    Bridge::new(
        session_id,
        link,
        HeadlessRuntime::new(config.runtime.boot_ticks),
        &config.bridge_config(),
    )
}

/// Drive the headless runtime until the connection ends or Ctrl+C
async fn run_bridge(config: Config) -> anyhow::Result<()> {
    let mut bridge = open_bridge(&config);

    if let Some(target) = &config.general.join {
        // Queued until the connection opens
        bridge.connect_to(target)?;
    }

    tracing::info!(
        "Bridging {}:{} at {} Hz",
        config.network.host,
        config.network.port,
        config.runtime.tick_rate_hz
    );

    let mut ticker = tokio::time::interval(config.runtime.tick_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                runtime::tick(&mut bridge);
                if bridge.is_closed() {
                    break;
                }
            }
            alive = bridge.process_next() => {
                if !alive {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                if let Err(e) = bridge.disconnect() {
                    tracing::debug!("Disconnect not sent: {}", e);
                }
                break;
            }
        }
    }

    let runtime = bridge.runtime();
    tracing::info!(
        "Session {} ended ({}): {} frames ({} skipped, {} buffer growths), {} packets, {} maps, {} servers known",
        bridge.session_id(),
        bridge.close_reason().unwrap_or("local shutdown"),
        bridge.poller().delivered(),
        bridge.poller().skipped(),
        bridge.poller().scratch().reallocations(),
        runtime.packets(),
        runtime.maps_loaded(),
        runtime.servers().len()
    );

    Ok(())
}

/// Issue a single command and print what the cluster answers
async fn run_command(config: Config, text: &str) -> anyhow::Result<()> {
    let mut bridge = open_bridge(&config);
    let handle = bridge.issue(text)?;
    let response = handle.wait_timeout(config.runtime.command_timeout());
    tokio::pin!(response);

    loop {
        tokio::select! {
            result = &mut response => {
                println!("{}", result?);
                return Ok(());
            }
            alive = bridge.process_next() => {
                if !alive || bridge.is_closed() {
                    anyhow::bail!(
                        "Connection closed before a response: {}",
                        bridge.close_reason().unwrap_or("unknown")
                    );
                }
            }
        }
    }
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    println!("Sourbridge Protocol Information");
    println!("===============================\n");

    println!("Cluster: {}:{}", config.network.host, config.network.port);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Command id space: {}", protocol::COMMAND_ID_SPACE);
    println!("Map change kind: {}", config.gate.map_change);
    println!("Load policy: {:?}", config.gate.policy);

    println!("\nFrame layouts (little-endian):");
    println!("  connect     {} | -", protocol::enet_event::CONNECT);
    println!("  disconnect  {} | reason u16", protocol::enet_event::DISCONNECT);
    println!("  receive     {} | channel u16 | length u32 | data", protocol::enet_event::RECEIVE);
}
