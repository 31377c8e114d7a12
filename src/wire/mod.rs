//! Wire Protocol
//!
//! One JSON document per TCP connection, read to EOF. The envelope
//! ([`payload::Meta`]) carries a tagged event code used for dispatch.

pub mod client;
pub mod events;
pub mod payload;

pub use events::EventType;
pub use payload::{
    decode, decode_meta, BeaconPayload, BuyPayload, Ffs, GetProviderStatsPayload,
    InformVotePayload, Meta, ProviderInfo, QosRequirements, ReplyVotePayload, RequestVotePayload,
    StartFlowPayload, TransactionEndPayload, TriggerBuyPayload, WireError,
};
