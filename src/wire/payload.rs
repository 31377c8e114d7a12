//! Payload Envelope and Message Types
//!
//! Every message is a single JSON object on its own TCP connection,
//! terminated by connection close. The envelope fields are flattened into
//! the top-level object so the dispatcher can decode [`Meta`] once, pick
//! the concrete type from the `type` code, and decode again.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::EventType;

/// One scorer's fittingness factor per target peer
pub type Ffs = HashMap<String, f64>;

/// Envelope carried by every message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "type")]
    pub payload_type: i64,
    #[serde(default)]
    pub transaction_id: Uuid,
    #[serde(default)]
    pub origin_id: String,
    #[serde(default)]
    pub origin_address: String,
}

impl Meta {
    pub fn new(event: EventType, transaction_id: Uuid, origin_id: &str, origin_address: &str) -> Self {
        Self {
            payload_type: event.code(),
            transaction_id,
            origin_id: origin_id.to_string(),
            origin_address: origin_address.to_string(),
        }
    }

    /// Resolve the tagged event type, `None` for unknown codes
    pub fn event(&self) -> Option<EventType> {
        EventType::from_code(self.payload_type)
    }
}

/// Advertised provider identity and measurement endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub provider_id: String,
    pub address: String,
    #[serde(default)]
    pub iperf3_base_server_port: u16,
    #[serde(default)]
    pub iperf3_server_count: u16,
    #[serde(default)]
    pub price: f64,
}

/// Consumer quality-of-service requirements attached to a buy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QosRequirements {
    /// Consumer price requirement
    pub price: f64,
    /// Consumer uplink speed requirement
    pub uplink: f64,
    /// Consumer downlink speed requirement
    pub downlink: f64,
    /// Speed-fittingness exponent
    pub mu: f64,
    /// Declared downlink exponent, unused by the fittingness formula
    pub delta: f64,
    /// Price range multiplier limit
    pub epsilon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconPayload {
    #[serde(flatten)]
    pub meta: Meta,
    pub channel_utilization_rate: u8,
    pub signal_strength: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyPayload {
    #[serde(flatten)]
    pub meta: Meta,
    pub provider_list: Vec<ProviderInfo>,
    #[serde(flatten)]
    pub qos: QosRequirements,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVotePayload {
    #[serde(flatten)]
    pub meta: Meta,
    pub candidate_id: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyVotePayload {
    #[serde(flatten)]
    pub meta: Meta,
    #[serde(rename = "FFS")]
    pub ffs: Ffs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InformVotePayload {
    #[serde(flatten)]
    pub meta: Meta,
    #[serde(flatten)]
    pub provider: ProviderInfo,
    #[serde(rename = "FFS_new")]
    pub ffs_new: Ffs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFlowPayload {
    #[serde(flatten)]
    pub meta: Meta,
    pub winner: ProviderInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEndPayload {
    #[serde(flatten)]
    pub meta: Meta,
    pub rating: f64,
    pub uplink_speed: f64,
    pub downlink_speed: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerBuyPayload {
    #[serde(flatten)]
    pub meta: Meta,
    pub provider_list: Vec<ProviderInfo>,
    #[serde(flatten)]
    pub qos: QosRequirements,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetProviderStatsPayload {
    #[serde(flatten)]
    pub meta: Meta,
}

/// Errors while decoding an inbound message
#[derive(Debug)]
pub enum WireError {
    Malformed(serde_json::Error),
    UnknownEvent(i64),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed payload: {}", e),
            Self::UnknownEvent(code) => write!(f, "unknown event type: {}", code),
        }
    }
}

impl std::error::Error for WireError {}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e)
    }
}

/// Decode the envelope alone, validating the event code
pub fn decode_meta(raw: &[u8]) -> Result<(Meta, EventType), WireError> {
    let meta: Meta = serde_json::from_slice(raw)?;
    let event = meta.event().ok_or(WireError::UnknownEvent(meta.payload_type))?;
    Ok((meta, event))
}

/// Decode the full typed payload
pub fn decode<T: for<'de> Deserialize<'de>>(raw: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_dispatch() {
        let raw = br#"{"type":1,"transaction_id":"6f8e9e4e-6f6e-4f2e-8f6e-9e4e6f6e4f2e","origin_id":"consumer-1","origin_address":"127.0.0.1:9000","provider_list":[],"price":25.0,"uplink":10.0,"downlink":10.0,"mu":1.0,"delta":1.0,"epsilon":2.0}"#;
        let (meta, event) = decode_meta(raw).unwrap();
        assert_eq!(event, EventType::Buy);
        assert_eq!(meta.origin_id, "consumer-1");

        let buy: BuyPayload = decode(raw).unwrap();
        assert_eq!(buy.qos.epsilon, 2.0);
        assert!(buy.provider_list.is_empty());
    }

    #[test]
    fn test_unknown_event_code() {
        let raw = br#"{"type":42,"transaction_id":"6f8e9e4e-6f6e-4f2e-8f6e-9e4e6f6e4f2e","origin_id":"x","origin_address":"y"}"#;
        match decode_meta(raw) {
            Err(WireError::UnknownEvent(42)) => {}
            other => panic!("expected UnknownEvent(42), got {:?}", other.map(|(_, e)| e)),
        }
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(decode_meta(b"not json"), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_reply_vote_ffs_key() {
        let mut ffs = Ffs::new();
        ffs.insert("provider-b".to_string(), 0.42);
        let payload = ReplyVotePayload {
            meta: Meta::new(EventType::ReplyVote, Uuid::nil(), "provider-a", "127.0.0.1:1"),
            ffs,
        };

        let value: serde_json::Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], 3);
        assert!((value["FFS"]["provider-b"].as_f64().unwrap() - 0.42).abs() < 1e-12);
    }

    #[test]
    fn test_inform_vote_flattens_provider_info() {
        let payload = InformVotePayload {
            meta: Meta::new(EventType::InformVote, Uuid::nil(), "provider-a", "127.0.0.1:1"),
            provider: ProviderInfo {
                provider_id: "provider-a".to_string(),
                address: "127.0.0.1:7001".to_string(),
                iperf3_base_server_port: 5201,
                iperf3_server_count: 4,
                price: 12.5,
            },
            ffs_new: Ffs::new(),
        };

        let value: serde_json::Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["provider_id"], "provider-a");
        assert_eq!(value["iperf3_base_server_port"], 5201);
        assert!((value["price"].as_f64().unwrap() - 12.5).abs() < 1e-12);

        let back: InformVotePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.provider.address, "127.0.0.1:7001");
    }
}
