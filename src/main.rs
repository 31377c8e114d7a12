//! Provider Node
//!
//! Runs the provider role: beacon emitter, TCP listener for the vote
//! exchange, iperf3 measurement servers, and the transaction deadline
//! sweeper.
//!
//! Usage:
//!   provider --config provider_config.json --beacon-config beacon_config.json
//!
//! Environment Variables:
//!   node_num  - selects suffixed config filenames (provider_config_<n>.json)
//!   is_faulty - enables the adversarial testing mode

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use bandtrade_backend::config::{self, BeaconSettings, ProviderConfig};
use bandtrade_backend::iperf3::Iperf3ServerPool;
use bandtrade_backend::provider::beacon::run_beacon_emitter;
use bandtrade_backend::Provider;

#[derive(Parser, Debug)]
#[command(name = "provider")]
#[command(about = "WiFi-bandwidth provider node")]
struct Args {
    /// Path to the provider JSON config (default: provider_config[_<node_num>].json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the beacon JSON config (default: beacon_config[_<node_num>].json)
    #[arg(long)]
    beacon_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cfg: ProviderConfig =
        config::load(config::PROVIDER_CONFIG_BASE, args.config.as_deref())?;
    let beacon_settings: BeaconSettings =
        config::load(config::BEACON_CONFIG_BASE, args.beacon_config.as_deref())?;
    let faulty = config::is_faulty_from_env();

    info!("starting provider {} on {} (faulty: {})", cfg.id, cfg.address, faulty);

    let mut servers = Iperf3ServerPool::start(cfg.iperf3_base_server_port, cfg.iperf3_server_count);

    let provider = Provider::new(cfg, faulty);
    let listener = TcpListener::bind(provider.address())
        .await
        .with_context(|| format!("failed to listen on {}", provider.address()))?;

    tokio::spawn(run_beacon_emitter(provider.clone(), beacon_settings));
    tokio::spawn(provider.clone().run_deadline_sweeper());

    tokio::select! {
        res = provider.clone().serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    servers.shutdown().await;
    Ok(())
}
