//! Configuration Loading
//!
//! Each role reads a JSON config. The base filename gains a `_{node_num}`
//! suffix when the `node_num` environment variable is set, so several
//! nodes can run out of one directory. `is_faulty` switches a provider
//! into adversarial mode.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::scoring::{PeerDefaults, ScoringParams};
use crate::wire::{ProviderInfo, QosRequirements};

pub const NODE_NUM_ENV: &str = "node_num";
pub const IS_FAULTY_ENV: &str = "is_faulty";

pub const PROVIDER_CONFIG_BASE: &str = "provider_config";
pub const BEACON_CONFIG_BASE: &str = "beacon_config";
pub const CONSUMER_CONFIG_BASE: &str = "consumer_config";
pub const TRIGGER_CONFIG_BASE: &str = "trigger_config";

fn default_transaction_deadline_ms() -> i64 {
    30_000
}

fn default_tau() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub address: String,
    pub iperf3_base_server_port: u16,
    pub iperf3_server_count: u16,
    pub price: f64,
    pub uplink_speed: f64,
    pub downlink_speed: f64,
    #[serde(default)]
    pub params: ScoringParams,
    #[serde(flatten)]
    pub defaults: PeerDefaults,
    #[serde(default = "default_transaction_deadline_ms")]
    pub transaction_deadline_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconSettings {
    /// Peer addresses beacons are emitted to
    pub addresses: Vec<String>,
    /// Emit interval in milliseconds
    pub interval: u64,
    /// Stand-in utilization for deployments without flow accounting;
    /// superseded by the computed rate when flows are tracked
    #[serde(default)]
    pub mock_channel_utilization_rate: u8,
    /// Stand-in RSSI, there being no real radio underneath
    #[serde(default)]
    pub mock_rssi: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub id: String,
    pub address: String,
    pub iperf3_base_server_port: u16,
    pub iperf3_server_count: u16,
    /// Default QoS requirements, used when a trigger supplies none
    pub params: QosRequirements,
    /// z-score threshold for the final outlier filter
    #[serde(default = "default_tau")]
    pub tau: f64,
    pub output_dir: String,
    #[serde(default = "default_transaction_deadline_ms")]
    pub transaction_deadline_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub consumer_address: String,
    pub buy_event_count: u32,
    /// Seconds between synthetic buys
    pub buy_event_interval_mean: f64,
    pub buy_event_interval_std_dev: f64,
    pub uplink_mean: f64,
    pub uplink_std_dev: f64,
    pub downlink_mean: f64,
    pub downlink_std_dev: f64,
    pub price_mean: f64,
    pub price_std_dev: f64,
    pub mu_mean: f64,
    pub mu_std_dev: f64,
    pub delta_mean: f64,
    pub delta_std_dev: f64,
    pub epsilon_mean: f64,
    pub epsilon_std_dev: f64,
    pub provider_list: Vec<ProviderInfo>,
}

/// Resolve the filename for a config base, honoring `node_num`
pub fn config_file_name(base: &str) -> String {
    match env::var(NODE_NUM_ENV) {
        Ok(n) if !n.is_empty() => format!("{}_{}.json", base, n),
        _ => format!("{}.json", base),
    }
}

/// Load a JSON config, either from an explicit path or from the
/// `node_num`-resolved filename in the working directory.
pub fn load<T: DeserializeOwned>(base: &str, explicit: Option<&Path>) -> Result<T> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => PathBuf::from(config_file_name(base)),
    };
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to unmarshal config file {}", path.display()))
}

/// Whether the environment flags this node as adversarial
pub fn is_faulty_from_env() -> bool {
    matches!(
        env::var(IS_FAULTY_ENV).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("on") | Ok("ON")
    )
}
