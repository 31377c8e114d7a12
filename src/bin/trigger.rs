//! Trigger Driver
//!
//! Issues a configured number of synthetic TRIGGER_BUY events to a
//! consumer, then exits.
//!
//! Usage:
//!   trigger --config trigger_config.json

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use bandtrade_backend::config::{self, TriggerSettings};
use bandtrade_backend::Trigger;

#[derive(Parser, Debug)]
#[command(name = "trigger")]
#[command(about = "Synthetic buy-event driver")]
struct Args {
    /// Path to the trigger JSON config (default: trigger_config[_<node_num>].json)
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

    let settings: TriggerSettings = config::load(config::TRIGGER_CONFIG_BASE, args.config.as_deref())?;
    Trigger::new(settings).run().await?;

    info!("all buy events issued");
    Ok(())
}
