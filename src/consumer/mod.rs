//! Consumer Role
//!
//! Initiates purchases, collects INFORM_VOTE opinions, picks the winner,
//! measures the winning flow through the throughput oracle, and closes
//! the transaction. Completed transactions are dumped to disk on
//! shutdown.

pub mod events;

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConsumerConfig;
use crate::iperf3::ThroughputOracle;
use crate::now_ms;
use crate::scoring::AllFfs;
use crate::wire::{self, EventType, Ffs, ProviderInfo, QosRequirements};

/// Lifecycle of one transaction at the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsumerPhase {
    /// Waiting for every provider's INFORM_VOTE
    Collecting,
    /// Winner picked, flow measurement in progress
    Flowing,
    Done,
}

/// Measured outcome of the winning flow, speeds in Mbyte/s
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FlowMetrics {
    pub rating: f64,
    pub uplink_speed: f64,
    pub downlink_speed: f64,
}

/// Per-transaction record on the consumer side
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerTransaction {
    pub id: Uuid,
    pub created_at_ms: i64,
    pub provider_list: Vec<ProviderInfo>,
    pub provider_count: usize,
    pub qos: QosRequirements,
    pub all_ffs: AllFfs,
    pub ffs_final: Ffs,
    pub phase: ConsumerPhase,
    pub winner: Option<ProviderInfo>,
    pub flow_metrics: Option<FlowMetrics>,
}

pub struct ConsumerState {
    pub transactions: HashMap<Uuid, ConsumerTransaction>,
}

#[derive(Debug, Default)]
pub struct ConsumerCounters {
    pub messages_received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub unknown_events: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub buys_sent: AtomicU64,
    pub inform_votes_received: AtomicU64,
    pub flows_started: AtomicU64,
    pub transactions_completed: AtomicU64,
}

impl ConsumerCounters {
    pub fn snapshot(&self) -> ConsumerCountersSnapshot {
        ConsumerCountersSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unknown_events: self.unknown_events.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            buys_sent: self.buys_sent.load(Ordering::Relaxed),
            inform_votes_received: self.inform_votes_received.load(Ordering::Relaxed),
            flows_started: self.flows_started.load(Ordering::Relaxed),
            transactions_completed: self.transactions_completed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerCountersSnapshot {
    pub messages_received: u64,
    pub decode_errors: u64,
    pub unknown_events: u64,
    pub protocol_errors: u64,
    pub buys_sent: u64,
    pub inform_votes_received: u64,
    pub flows_started: u64,
    pub transactions_completed: u64,
}

pub struct Consumer {
    id: String,
    address: String,
    default_qos: QosRequirements,
    tau: f64,
    output_dir: PathBuf,
    transaction_deadline_ms: i64,
    oracle: Arc<dyn ThroughputOracle>,
    state: Mutex<ConsumerState>,
    counters: ConsumerCounters,
}

impl Consumer {
    pub fn new(config: ConsumerConfig, oracle: Arc<dyn ThroughputOracle>) -> Arc<Self> {
        Arc::new(Self {
            id: config.id,
            address: config.address,
            default_qos: config.params,
            tau: config.tau,
            output_dir: PathBuf::from(config.output_dir),
            transaction_deadline_ms: config.transaction_deadline_ms,
            oracle,
            state: Mutex::new(ConsumerState {
                transactions: HashMap::new(),
            }),
            counters: ConsumerCounters::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn counters(&self) -> &ConsumerCounters {
        &self.counters
    }

    /// Cloned view of one transaction, mainly for inspection and tests
    pub fn transaction(&self, id: Uuid) -> Option<ConsumerTransaction> {
        self.state.lock().transactions.get(&id).cloned()
    }

    pub fn transactions(&self) -> Vec<ConsumerTransaction> {
        self.state.lock().transactions.values().cloned().collect()
    }

    /// Accept loop; each connection gets its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("consumer {} listening on {}", self.id, self.address);
        loop {
            let (stream, remote) = listener.accept().await?;
            let consumer = self.clone();
            tokio::spawn(async move {
                consumer.handle_connection(stream, remote.to_string()).await;
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
            EventType::TriggerBuy => match wire::decode(&raw) {
                Ok(payload) => self.handle_trigger_buy(payload).await,
                Err(e) => self.log_decode_error(event, &remote, e),
            },
            EventType::InformVote => match wire::decode(&raw) {
                Ok(payload) => self.handle_inform_vote(payload).await,
                Err(e) => self.log_decode_error(event, &remote, e),
            },
            other => {
                self.counters.unknown_events.fetch_add(1, Ordering::Relaxed);
                debug!("dropping provider-bound {} at consumer", other.as_str());
            }
        }
    }

    fn log_decode_error(&self, event: EventType, remote: &str, e: wire::WireError) {
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
        debug!("failed to decode {} payload from {}: {}", event.as_str(), remote, e);
    }

    /// Write all transactions, including flow metrics, to a timestamped
    /// file under the configured output directory.
    pub fn dump_transactions(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("failed to create output dir {}", self.output_dir.display())
        })?;
        let stamp = chrono::Local::now().format("%Y-%m-%d--%H-%M-%S");
        let path = self.output_dir.join(format!("consumer_transactions--{}", stamp));

        let transactions = self.transactions();
        let file = File::create(&path)
            .with_context(|| format!("failed to create dump file {}", path.display()))?;
        serde_json::to_writer_pretty(file, &transactions).context("failed to marshal transactions")?;
        info!("dumped {} transactions to {}", transactions.len(), path.display());
        Ok(path)
    }

    /// Expire transactions that outlived the deadline.
    pub async fn run_deadline_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let now = now_ms();
            let mut guard = self.state.lock();
            for tx in guard.transactions.values_mut() {
                if tx.phase != ConsumerPhase::Done && now - tx.created_at_ms > self.transaction_deadline_ms {
                    warn!("transaction {} expired in phase {:?}", tx.id, tx.phase);
                    tx.phase = ConsumerPhase::Done;
                }
            }
        }
    }
}
