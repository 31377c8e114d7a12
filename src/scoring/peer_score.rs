//! Peer-Score Table
//!
//! Per-provider view of every observed peer. Rows are created on the first
//! BEACON (or on the first price seen in a vote exchange) and live for the
//! process lifetime. A provider never holds a row for itself.

use std::collections::HashMap;

use serde::Serialize;

use super::algorithms;
use super::{PeerDefaults, ScoringParams};

/// First and most recent beacon arrival for a peer, in epoch milliseconds
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BeaconTimestamps {
    /// T_0
    pub initial: i64,
    /// T_n
    pub last: i64,
}

/// Reputation inputs for one observed peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerScore {
    pub uptime: f64,
    pub load: f64,
    pub signal_strength: f64,
    pub uplink_speed: f64,
    pub downlink_speed: f64,
    pub last_price: f64,
    pub consumer_feedback: f64,
    pub beacon_timestamps: BeaconTimestamps,
}

/// Mapping from peer id to its score row
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct PeerScoreMatrix {
    rows: HashMap<String, PeerScore>,
}

impl PeerScoreMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerScore> {
        self.rows.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Apply one BEACON frame from `peer_id`.
    ///
    /// Unknown senders get a fresh row. Known senders go through the
    /// timestamp rule: a gap larger than `beacon_t_limit` resets both T_0
    /// and T_n to the new arrival, otherwise only T_n advances. Uptime,
    /// load, and signal strength are then recomputed; the remaining fields
    /// are owned by the transaction path and stay untouched.
    pub fn observe_beacon(
        &mut self,
        peer_id: &str,
        channel_utilization_rate: u8,
        rssi: u8,
        now_ms: i64,
        params: &ScoringParams,
        defaults: &PeerDefaults,
    ) {
        match self.rows.get_mut(peer_id) {
            None => {
                self.rows.insert(
                    peer_id.to_string(),
                    PeerScore {
                        uptime: algorithms::uptime(now_ms, now_ms, params.k_uptime),
                        load: algorithms::load(channel_utilization_rate, params.k_load),
                        signal_strength: algorithms::signal_strength(rssi, params.k_strength),
                        uplink_speed: defaults.default_peer_uplink,
                        downlink_speed: defaults.default_peer_downlink,
                        last_price: defaults.default_peer_price,
                        consumer_feedback: defaults.default_peer_feedback,
                        beacon_timestamps: BeaconTimestamps {
                            initial: now_ms,
                            last: now_ms,
                        },
                    },
                );
            }
            Some(row) => {
                if now_ms - row.beacon_timestamps.last > params.beacon_t_limit {
                    row.beacon_timestamps.initial = now_ms;
                }
                row.beacon_timestamps.last = now_ms;

                row.uptime = algorithms::uptime(
                    row.beacon_timestamps.initial,
                    row.beacon_timestamps.last,
                    params.k_uptime,
                );
                row.load = algorithms::load(channel_utilization_rate, params.k_load);
                row.signal_strength = algorithms::signal_strength(rssi, params.k_strength);
            }
        }
    }

    /// Record the asking price a peer attached to its REQUEST_VOTE.
    ///
    /// A peer that was never seen via beacons gets a neutral row so the
    /// vote exchange can proceed on defaults.
    pub fn record_price(&mut self, peer_id: &str, price: f64, now_ms: i64, defaults: &PeerDefaults) {
        let row = self.rows.entry(peer_id.to_string()).or_insert(PeerScore {
            uptime: 0.5,
            load: 0.5,
            signal_strength: 0.5,
            uplink_speed: defaults.default_peer_uplink,
            downlink_speed: defaults.default_peer_downlink,
            last_price: defaults.default_peer_price,
            consumer_feedback: defaults.default_peer_feedback,
            beacon_timestamps: BeaconTimestamps {
                initial: now_ms,
                last: now_ms,
            },
        });
        row.last_price = price;
    }

    /// Fold a completed transaction into the winning peer's row: measured
    /// speeds replace the advertised ones and the consumer rating enters
    /// the feedback EMA with weight `gamma`. Returns false when no row for
    /// the winner exists.
    pub fn apply_transaction_end(
        &mut self,
        winner_id: &str,
        uplink_speed: f64,
        downlink_speed: f64,
        rating: f64,
        gamma: f64,
    ) -> bool {
        match self.rows.get_mut(winner_id) {
            None => false,
            Some(row) => {
                row.uplink_speed = uplink_speed;
                row.downlink_speed = downlink_speed;
                row.consumer_feedback = gamma * rating + (1.0 - gamma) * row.consumer_feedback;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ScoringParams {
        ScoringParams {
            beacon_t_limit: 1_000,
            ..Default::default()
        }
    }

    fn defaults() -> PeerDefaults {
        PeerDefaults::default()
    }

    #[test]
    fn test_first_beacon_creates_row_at_half_uptime() {
        let mut matrix = PeerScoreMatrix::new();
        matrix.observe_beacon("peer-a", 0, 128, 1_000, &params(), &defaults());

        let row = matrix.get("peer-a").unwrap();
        assert!((row.uptime - 0.5).abs() < 1e-12);
        assert_eq!(row.beacon_timestamps.initial, 1_000);
        assert_eq!(row.beacon_timestamps.last, 1_000);
        assert_eq!(row.last_price, defaults().default_peer_price);
    }

    #[test]
    fn test_steady_beacons_preserve_initial_timestamp() {
        let mut matrix = PeerScoreMatrix::new();
        let p = params();
        let d = defaults();
        matrix.observe_beacon("peer-a", 0, 128, 1_000, &p, &d);
        matrix.observe_beacon("peer-a", 0, 128, 1_500, &p, &d);
        matrix.observe_beacon("peer-a", 0, 128, 2_400, &p, &d);

        let row = matrix.get("peer-a").unwrap();
        assert_eq!(row.beacon_timestamps.initial, 1_000);
        assert_eq!(row.beacon_timestamps.last, 2_400);
        assert!(row.uptime > 0.5);
    }

    #[test]
    fn test_beacon_gap_resets_both_timestamps() {
        let mut matrix = PeerScoreMatrix::new();
        let p = params();
        let d = defaults();
        matrix.observe_beacon("peer-a", 0, 128, 1_000, &p, &d);
        matrix.observe_beacon("peer-a", 0, 128, 1_500, &p, &d);
        // Gap beyond beacon_t_limit
        matrix.observe_beacon("peer-a", 0, 128, 5_000, &p, &d);

        let row = matrix.get("peer-a").unwrap();
        assert_eq!(row.beacon_timestamps.initial, 5_000);
        assert_eq!(row.beacon_timestamps.last, 5_000);
        assert!((row.uptime - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_record_price_creates_neutral_row() {
        let mut matrix = PeerScoreMatrix::new();
        matrix.record_price("peer-b", 17.5, 1_000, &defaults());

        let row = matrix.get("peer-b").unwrap();
        assert_eq!(row.last_price, 17.5);
        assert!((row.uptime - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_transaction_end_updates_winner_row() {
        let mut matrix = PeerScoreMatrix::new();
        let d = defaults();
        matrix.record_price("peer-w", 10.0, 1_000, &d);
        let old_feedback = matrix.get("peer-w").unwrap().consumer_feedback;

        assert!(matrix.apply_transaction_end("peer-w", 42.0, 84.0, 0.75, 0.8));
        let row = matrix.get("peer-w").unwrap();
        assert_eq!(row.uplink_speed, 42.0);
        assert_eq!(row.downlink_speed, 84.0);
        let expected = 0.8 * 0.75 + 0.2 * old_feedback;
        assert!((row.consumer_feedback - expected).abs() < 1e-12);

        assert!(!matrix.apply_transaction_end("nobody", 1.0, 1.0, 1.0, 0.5));
    }
}
