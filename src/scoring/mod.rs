//! Trust Scoring
//!
//! The peer-score table fed by beacons and transaction feedback, the
//! fittingness formulas evaluated against a buy's QoS requirements, and
//! the outlier-robust aggregation both roles run over collected opinions.

pub mod algorithms;
pub mod peer_score;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::wire::Ffs;

pub use peer_score::{BeaconTimestamps, PeerScore, PeerScoreMatrix};

/// Opinions collected during one transaction, keyed by scorer id
pub type AllFfs = HashMap<String, Ffs>;

/// Tuning parameters for the scoring formulas
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringParams {
    /// Beacon gap (ms) beyond which a peer's uptime history resets
    pub beacon_t_limit: i64,
    pub k_uptime: f64,
    pub k_load: f64,
    pub k_strength: f64,
    /// z-score threshold for the outlier filters
    pub tau: f64,
    /// EMA weight for new consumer-feedback ratings
    pub gamma: f64,
    /// Substitute fittingness for peers absent from the score table
    pub default_peer_ff: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            beacon_t_limit: 1_000,
            k_uptime: 0.5,
            k_load: 0.5,
            k_strength: 0.5,
            tau: 2.0,
            gamma: 0.8,
            default_peer_ff: 0.5,
        }
    }
}

/// Row values used for peers created before any beacon history exists
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerDefaults {
    pub default_peer_uplink: f64,
    pub default_peer_downlink: f64,
    pub default_peer_price: f64,
    pub default_peer_feedback: f64,
}

impl Default for PeerDefaults {
    fn default() -> Self {
        Self {
            default_peer_uplink: 30.0,
            default_peer_downlink: 50.0,
            // Zero until a peer's REQUEST_VOTE supplies a real price; the
            // vote barrier keys on this
            default_peer_price: 0.0,
            default_peer_feedback: 1.0,
        }
    }
}
