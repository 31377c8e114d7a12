//! Provider Role
//!
//! Maintains the peer-score table, emits and consumes beacons, and runs
//! the provider side of the vote exchange. One task per inbound
//! connection; all mutable state sits behind a single process-wide mutex
//! that is never held across a network call.

pub mod beacon;
pub mod events;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::now_ms;
use crate::scoring::{algorithms, AllFfs, PeerDefaults, PeerScoreMatrix, ScoringParams};
use crate::wire::{self, EventType, Ffs, ProviderInfo, QosRequirements};

/// Spread of the gaussian a faulty provider applies to its advertised price,
/// as a fraction of the true price
const FAULTY_PRICE_SPREAD: f64 = 0.5;

/// Spread and clamp band of the gaussian a faulty provider applies to each
/// fittingness factor it reports
const FAULTY_FF_SPREAD: f64 = 1.0;
const FAULTY_FF_BOUND: f64 = 3.0;

/// Lifecycle of one transaction at a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProviderPhase {
    /// Vote exchange in progress
    AwaitingVotes,
    /// INFORM_VOTE sent, winner not yet announced
    AwaitingStart,
    /// Selected as winner, flow in progress
    Serving,
    /// Lost the selection, flow in progress elsewhere
    Idle,
    Done,
}

/// Per-transaction record on the provider side
pub struct ProviderTransaction {
    pub id: Uuid,
    pub created_at_ms: i64,
    pub consumer_id: String,
    pub consumer_address: String,
    pub provider_list: Vec<ProviderInfo>,
    pub provider_count: usize,
    pub qos: QosRequirements,
    pub all_ffs: AllFfs,
    pub phase: ProviderPhase,
    pub winner: Option<ProviderInfo>,
    /// Peers whose REQUEST_VOTE price has not arrived for this transaction
    pub prices_pending: HashSet<String>,
    /// Signalled when the last pending price lands
    pub price_barrier: Arc<Notify>,
}

/// Mutable provider state, one mutex for all of it
pub struct ProviderState {
    pub peer_scores: PeerScoreMatrix,
    pub transactions: HashMap<Uuid, ProviderTransaction>,
    pub active_flow_count: u32,
}

/// Monotonic event counters
#[derive(Debug, Default)]
pub struct ProviderCounters {
    pub messages_received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub unknown_events: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub beacons_sent: AtomicU64,
    pub beacons_received: AtomicU64,
    pub buys_handled: AtomicU64,
    pub request_votes_handled: AtomicU64,
    pub reply_votes_handled: AtomicU64,
    pub inform_votes_sent: AtomicU64,
    pub flows_started: AtomicU64,
    pub transactions_completed: AtomicU64,
}

impl ProviderCounters {
    pub fn snapshot(&self) -> ProviderCountersSnapshot {
        ProviderCountersSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unknown_events: self.unknown_events.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            beacons_sent: self.beacons_sent.load(Ordering::Relaxed),
            beacons_received: self.beacons_received.load(Ordering::Relaxed),
            buys_handled: self.buys_handled.load(Ordering::Relaxed),
            request_votes_handled: self.request_votes_handled.load(Ordering::Relaxed),
            reply_votes_handled: self.reply_votes_handled.load(Ordering::Relaxed),
            inform_votes_sent: self.inform_votes_sent.load(Ordering::Relaxed),
            flows_started: self.flows_started.load(Ordering::Relaxed),
            transactions_completed: self.transactions_completed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderCountersSnapshot {
    pub messages_received: u64,
    pub decode_errors: u64,
    pub unknown_events: u64,
    pub protocol_errors: u64,
    pub beacons_sent: u64,
    pub beacons_received: u64,
    pub buys_handled: u64,
    pub request_votes_handled: u64,
    pub reply_votes_handled: u64,
    pub inform_votes_sent: u64,
    pub flows_started: u64,
    pub transactions_completed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionSummary {
    pub id: Uuid,
    pub created_at_ms: i64,
    pub phase: ProviderPhase,
    pub provider_count: usize,
    pub collected_ffs: usize,
    pub winner_id: Option<String>,
}

/// State dump returned for GET_PROVIDER_STATS
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatsDump {
    pub id: String,
    pub address: String,
    pub price: f64,
    pub uplink_speed: f64,
    pub downlink_speed: f64,
    pub faulty: bool,
    pub active_flow_count: u32,
    pub counters: ProviderCountersSnapshot,
    pub peer_scores: PeerScoreMatrix,
    pub transactions: Vec<TransactionSummary>,
}

pub struct Provider {
    id: String,
    address: String,
    price: f64,
    uplink_speed: f64,
    downlink_speed: f64,
    iperf3_base_server_port: u16,
    iperf3_server_count: u16,
    params: ScoringParams,
    defaults: PeerDefaults,
    transaction_deadline_ms: i64,
    faulty: bool,
    state: Mutex<ProviderState>,
    counters: ProviderCounters,
}

impl Provider {
    pub fn new(config: ProviderConfig, faulty: bool) -> Arc<Self> {
        Arc::new(Self {
            id: config.id,
            address: config.address,
            price: config.price,
            uplink_speed: config.uplink_speed,
            downlink_speed: config.downlink_speed,
            iperf3_base_server_port: config.iperf3_base_server_port,
            iperf3_server_count: config.iperf3_server_count,
            params: config.params,
            defaults: config.defaults,
            transaction_deadline_ms: config.transaction_deadline_ms,
            faulty,
            state: Mutex::new(ProviderState {
                peer_scores: PeerScoreMatrix::new(),
                transactions: HashMap::new(),
                active_flow_count: 0,
            }),
            counters: ProviderCounters::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn counters(&self) -> &ProviderCounters {
        &self.counters
    }

    /// The identity this provider advertises in INFORM_VOTE
    pub fn info(&self) -> ProviderInfo {
        ProviderInfo {
            provider_id: self.id.clone(),
            address: self.address.clone(),
            iperf3_base_server_port: self.iperf3_base_server_port,
            iperf3_server_count: self.iperf3_server_count,
            price: self.price,
        }
    }

    /// Accept loop; each connection gets its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("provider {} listening on {}", self.id, self.address);
        loop {
            let (stream, remote) = listener.accept().await?;
            let provider = self.clone();
            tokio::spawn(async move {
                provider.handle_connection(stream, remote.to_string()).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, remote: String) {
        let mut raw = Vec::new();
        if let Err(e) = stream.read_to_end(&mut raw).await {
            debug!("failed to read payload from {}: {}", remote, e);
            return;
        }
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        let (meta, event) = match wire::decode_meta(&raw) {
            Ok(decoded) => decoded,
            Err(wire::WireError::UnknownEvent(code)) => {
                self.counters.unknown_events.fetch_add(1, Ordering::Relaxed);
                debug!("dropping unknown event type {} from {}", code, remote);
                return;
            }
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("failed to decode payload meta from {}: {}", remote, e);
                return;
            }
        };
        debug!("received {} from {} ({})", event.as_str(), meta.origin_id, remote);

        match event {
            EventType::Beacon => match wire::decode(&raw) {
                Ok(payload) => self.handle_beacon(payload),
                Err(e) => self.log_decode_error(event, &remote, e),
            },
            EventType::Buy => match wire::decode(&raw) {
                Ok(payload) => self.handle_buy(payload).await,
                Err(e) => self.log_decode_error(event, &remote, e),
            },
            EventType::RequestVote => match wire::decode(&raw) {
                Ok(payload) => self.handle_request_vote(payload).await,
                Err(e) => self.log_decode_error(event, &remote, e),
            },
            EventType::ReplyVote => match wire::decode(&raw) {
                Ok(payload) => self.handle_reply_vote(payload).await,
                Err(e) => self.log_decode_error(event, &remote, e),
            },
            EventType::StartFlow => match wire::decode(&raw) {
                Ok(payload) => self.handle_start_flow(payload),
                Err(e) => self.log_decode_error(event, &remote, e),
            },
            EventType::TransactionEnd => match wire::decode(&raw) {
                Ok(payload) => self.handle_transaction_end(payload),
                Err(e) => self.log_decode_error(event, &remote, e),
            },
            EventType::GetProviderStats => self.handle_get_stats(&mut stream).await,
            EventType::InformVote | EventType::TriggerBuy => {
                self.counters.unknown_events.fetch_add(1, Ordering::Relaxed);
                debug!("dropping consumer-bound {} at provider", event.as_str());
            }
        }
    }

    fn log_decode_error(&self, event: EventType, remote: &str, e: wire::WireError) {
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
        debug!("failed to decode {} payload from {}: {}", event.as_str(), remote, e);
    }

    /// This provider's opinion of every other peer in a buy, against the
    /// buy's QoS requirements. Peers without a usable score row fall back
    /// to the configured default fittingness.
    pub(crate) fn compute_own_ffs(
        &self,
        provider_list: &[ProviderInfo],
        qos: &QosRequirements,
        peer_scores: &PeerScoreMatrix,
    ) -> Ffs {
        let mut ffs = Ffs::new();
        for peer in provider_list {
            if peer.provider_id == self.id {
                continue;
            }
            let ff = match peer_scores.get(&peer.provider_id) {
                Some(row) if row.last_price > 0.0 => {
                    let pf = algorithms::price_fittingness(qos.price, row.last_price, qos.epsilon);
                    let sf = algorithms::speed_fittingness(
                        qos.uplink,
                        row.uplink_speed,
                        qos.mu,
                        qos.downlink,
                        row.downlink_speed,
                        qos.delta,
                    );
                    algorithms::fittingness_factor(
                        pf,
                        sf,
                        row.uptime,
                        row.load,
                        row.signal_strength,
                        row.consumer_feedback,
                    )
                }
                _ => self.params.default_peer_ff,
            };
            ffs.insert(peer.provider_id.clone(), self.adversarial_ff(ff));
        }
        ffs
    }

    /// Price advertised in outgoing REQUEST_VOTE; perturbed in faulty mode
    pub(crate) fn advertised_price(&self) -> f64 {
        if !self.faulty {
            return self.price;
        }
        let mut rng = rand::thread_rng();
        algorithms::clamped_normal(
            &mut rng,
            self.price,
            self.price * FAULTY_PRICE_SPREAD,
            0.0,
            self.price * 2.0,
        )
    }

    /// Identity in honest mode, bounded gaussian noise in faulty mode
    pub(crate) fn adversarial_ff(&self, ff: f64) -> f64 {
        if !self.faulty {
            return ff;
        }
        let mut rng = rand::thread_rng();
        algorithms::clamped_normal(
            &mut rng,
            ff,
            FAULTY_FF_SPREAD,
            ff - FAULTY_FF_BOUND,
            ff + FAULTY_FF_BOUND,
        )
    }

    pub fn active_flow_count(&self) -> u32 {
        self.state.lock().active_flow_count
    }

    pub fn stats_dump(&self) -> ProviderStatsDump {
        let state = self.state.lock();
        let transactions = state
            .transactions
            .values()
            .map(|tx| TransactionSummary {
                id: tx.id,
                created_at_ms: tx.created_at_ms,
                phase: tx.phase,
                provider_count: tx.provider_count,
                collected_ffs: tx.all_ffs.len(),
                winner_id: tx.winner.as_ref().map(|w| w.provider_id.clone()),
            })
            .collect();
        ProviderStatsDump {
            id: self.id.clone(),
            address: self.address.clone(),
            price: self.price,
            uplink_speed: self.uplink_speed,
            downlink_speed: self.downlink_speed,
            faulty: self.faulty,
            active_flow_count: state.active_flow_count,
            counters: self.counters.snapshot(),
            peer_scores: state.peer_scores.clone(),
            transactions,
        }
    }

    /// Expire transactions that outlived the deadline; events arriving for
    /// them afterwards are dropped. A serving flow that never saw its
    /// TRANSACTION_END releases its slot here.
    pub async fn run_deadline_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let now = now_ms();
            let mut state = self.state.lock();
            let deadline = self.transaction_deadline_ms;
            let mut expired_serving = 0u32;
            for tx in state.transactions.values_mut() {
                if tx.phase != ProviderPhase::Done && now - tx.created_at_ms > deadline {
                    warn!("transaction {} expired in phase {:?}", tx.id, tx.phase);
                    if tx.phase == ProviderPhase::Serving {
                        expired_serving += 1;
                    }
                    tx.phase = ProviderPhase::Done;
                    // Release any waiter stuck on the price barrier
                    tx.price_barrier.notify_waiters();
                }
            }
            state.active_flow_count = state.active_flow_count.saturating_sub(expired_serving);
        }
    }
}
