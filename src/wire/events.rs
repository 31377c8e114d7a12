//! Protocol Event Codes
//!
//! Closed set of tagged integers carried in the `type` field of every
//! payload envelope. Unknown codes are dropped by the dispatcher after a
//! single log line.

/// Event discriminator on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum EventType {
    Beacon = 0,
    Buy = 1,
    RequestVote = 2,
    ReplyVote = 3,
    InformVote = 4,
    StartFlow = 5,
    TransactionEnd = 6,
    /// Synthetic buy request from the trigger driver
    TriggerBuy = 7,
    /// Request/response: dump of provider state
    GetProviderStats = 8,
}

impl EventType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Beacon),
            1 => Some(Self::Buy),
            2 => Some(Self::RequestVote),
            3 => Some(Self::ReplyVote),
            4 => Some(Self::InformVote),
            5 => Some(Self::StartFlow),
            6 => Some(Self::TransactionEnd),
            7 => Some(Self::TriggerBuy),
            8 => Some(Self::GetProviderStats),
            _ => None,
        }
    }

    #[inline]
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beacon => "BEACON",
            Self::Buy => "BUY",
            Self::RequestVote => "REQUEST_VOTE",
            Self::ReplyVote => "REPLY_VOTE",
            Self::InformVote => "INFORM_VOTE",
            Self::StartFlow => "START_FLOW",
            Self::TransactionEnd => "TRANSACTION_END",
            Self::TriggerBuy => "TRIGGER_BUY",
            Self::GetProviderStats => "GET_PROVIDER_STATS",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in 0..=8 {
            let event = EventType::from_code(code).unwrap();
            assert_eq!(event.code(), code);
        }
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(EventType::from_code(9), None);
        assert_eq!(EventType::from_code(-1), None);
    }
}
