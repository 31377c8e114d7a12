//! Consumer Node
//!
//! Runs the consumer role: TCP listener for trigger and vote traffic,
//! iperf3 measurement servers, the transaction deadline sweeper, and the
//! shutdown-time transaction dump.
//!
//! Usage:
//!   consumer --config consumer_config.json

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use bandtrade_backend::config::{self, ConsumerConfig};
use bandtrade_backend::iperf3::{Iperf3Oracle, Iperf3ServerPool};
use bandtrade_backend::Consumer;

#[derive(Parser, Debug)]
#[command(name = "consumer")]
#[command(about = "WiFi-bandwidth consumer node")]
struct Args {
    /// Path to the consumer JSON config (default: consumer_config[_<node_num>].json)
    #[arg(short, long)]
    config: Option<PathBuf>,

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

    let cfg: ConsumerConfig = config::load(config::CONSUMER_CONFIG_BASE, args.config.as_deref())?;
    info!("starting consumer {} on {}", cfg.id, cfg.address);

    let mut servers = Iperf3ServerPool::start(cfg.iperf3_base_server_port, cfg.iperf3_server_count);

    let consumer = Consumer::new(cfg, Arc::new(Iperf3Oracle));
    let listener = TcpListener::bind(consumer.address())
        .await
        .with_context(|| format!("failed to listen on {}", consumer.address()))?;

    tokio::spawn(consumer.clone().run_deadline_sweeper());

    tokio::select! {
        res = consumer.clone().serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    match consumer.dump_transactions() {
        Ok(path) => info!("transactions persisted to {}", path.display()),
        Err(e) => error!("failed to persist transactions: {:#}", e),
    }
    servers.shutdown().await;
    Ok(())
}
