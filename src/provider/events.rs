//! Provider Event Handlers
//!
//! The vote-exchange state machine: BUY opens a transaction and fans out
//! REQUEST_VOTE, REQUEST_VOTE synchronizes prices behind a per-transaction
//! barrier, REPLY_VOTE collection triggers exactly one INFORM_VOTE, and
//! START_FLOW / TRANSACTION_END settle the flow accounting.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::now_ms;
use crate::scoring::{algorithms, AllFfs};
use crate::wire::{
    client, BuyPayload, EventType, Ffs, InformVotePayload, Meta, ReplyVotePayload,
    RequestVotePayload, StartFlowPayload, TransactionEndPayload,
};

use super::{Provider, ProviderPhase, ProviderTransaction};

/// Interval of the bounded retry loops inside the REQUEST_VOTE handler
const VOTE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Attempts to resolve a sender that raced ahead of its BUY
const VOTE_LOOKUP_RETRIES: usize = 100;

impl Provider {
    /// BUY: open the transaction, record our own opinion, and ask every
    /// other peer for its price.
    pub(crate) async fn handle_buy(&self, payload: BuyPayload) {
        self.counters.buys_handled.fetch_add(1, Ordering::Relaxed);
        let tx_id = payload.meta.transaction_id;

        let peer_addrs: Vec<String> = payload
            .provider_list
            .iter()
            .filter(|p| p.provider_id != self.id)
            .map(|p| p.address.clone())
            .collect();

        let completed = {
            let mut guard = self.state.lock();
            if guard.transactions.contains_key(&tx_id) {
                warn!("duplicate BUY for transaction {}", tx_id);
                return;
            }

            let self_ffs = self.compute_own_ffs(&payload.provider_list, &payload.qos, &guard.peer_scores);
            let mut all_ffs = AllFfs::new();
            all_ffs.insert(self.id.clone(), self_ffs);

            let prices_pending: HashSet<String> = payload
                .provider_list
                .iter()
                .filter(|p| p.provider_id != self.id)
                .map(|p| p.provider_id.clone())
                .collect();

            let mut tx = ProviderTransaction {
                id: tx_id,
                created_at_ms: now_ms(),
                consumer_id: payload.meta.origin_id.clone(),
                consumer_address: payload.meta.origin_address.clone(),
                provider_count: payload.provider_list.len(),
                provider_list: payload.provider_list,
                qos: payload.qos,
                all_ffs,
                phase: ProviderPhase::AwaitingVotes,
                winner: None,
                prices_pending,
                price_barrier: Arc::new(Notify::new()),
            };
            // A buy with no other participants completes immediately
            let completed = self.try_complete_votes(&mut tx);
            guard.transactions.insert(tx_id, tx);
            completed
        };

        let request = RequestVotePayload {
            meta: Meta::new(EventType::RequestVote, tx_id, &self.id, &self.address),
            candidate_id: self.id.clone(),
            price: self.advertised_price(),
        };
        client::broadcast(&peer_addrs, &request).await;

        if let Some((consumer_address, ffs_new)) = completed {
            self.send_inform_vote(&consumer_address, tx_id, ffs_new).await;
        }
    }

    /// REQUEST_VOTE: record the candidate's price, then hold the reply
    /// until every participant's price is in. The lookup retry tolerates a
    /// REQUEST_VOTE racing ahead of its BUY.
    pub(crate) async fn handle_request_vote(&self, payload: RequestVotePayload) {
        self.counters.request_votes_handled.fetch_add(1, Ordering::Relaxed);
        let tx_id = payload.meta.transaction_id;
        let candidate_id = payload.candidate_id.clone();

        let Some(sender_address) = self.resolve_sender_address(tx_id, &candidate_id).await else {
            warn!(
                "dropping REQUEST_VOTE from {} for unresolved transaction {}",
                candidate_id, tx_id
            );
            return;
        };

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(tx) = state.transactions.get_mut(&tx_id) else {
                return;
            };
            if tx.phase == ProviderPhase::Done {
                return;
            }
            state
                .peer_scores
                .record_price(&candidate_id, payload.price, now_ms(), &self.defaults);
            tx.prices_pending.remove(&candidate_id);
            if tx.prices_pending.is_empty() {
                tx.price_barrier.notify_waiters();
            }
        }

        if !self.wait_for_prices(tx_id).await {
            return;
        }

        // Every price is known: refresh our own opinion before replying
        let reply_ffs = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(tx) = state.transactions.get_mut(&tx_id) else {
                return;
            };
            let ffs = self.compute_own_ffs(&tx.provider_list, &tx.qos, &state.peer_scores);
            tx.all_ffs.insert(self.id.clone(), ffs.clone());
            ffs
        };

        let reply = ReplyVotePayload {
            meta: Meta::new(EventType::ReplyVote, tx_id, &self.id, &self.address),
            ffs: reply_ffs,
        };
        if let Err(e) = client::send_json(&sender_address, &reply).await {
            warn!("failed to send REPLY_VOTE to {}: {:#}", sender_address, e);
        }
    }

    /// Resolve a vote sender from the transaction's provider list, polling
    /// while the BUY that creates the transaction may still be in flight.
    async fn resolve_sender_address(&self, tx_id: Uuid, candidate_id: &str) -> Option<String> {
        for _ in 0..VOTE_LOOKUP_RETRIES {
            {
                let guard = self.state.lock();
                if let Some(tx) = guard.transactions.get(&tx_id) {
                    if tx.phase == ProviderPhase::Done {
                        return None;
                    }
                    if let Some(peer) = tx
                        .provider_list
                        .iter()
                        .find(|p| p.provider_id == candidate_id)
                    {
                        return Some(peer.address.clone());
                    }
                    // Transaction known but sender absent from its list:
                    // retrying will not help
                    return None;
                }
            }
            tokio::time::sleep(VOTE_RETRY_INTERVAL).await;
        }
        None
    }

    /// Block until the transaction's price barrier opens. Returns false
    /// when the transaction disappeared or expired while waiting.
    async fn wait_for_prices(&self, tx_id: Uuid) -> bool {
        loop {
            let barrier: Arc<Notify> = {
                let guard = self.state.lock();
                let Some(tx) = guard.transactions.get(&tx_id) else {
                    return false;
                };
                if tx.phase == ProviderPhase::Done {
                    debug!("transaction {} expired while awaiting prices", tx_id);
                    return false;
                }
                if tx.prices_pending.is_empty() {
                    return true;
                }
                tx.price_barrier.clone()
            };
            // The timeout doubles as a poll in case the notification fired
            // between the check and the wait
            let _ = tokio::time::timeout(VOTE_RETRY_INTERVAL, barrier.notified()).await;
        }
    }

    /// REPLY_VOTE: fold the scorer's opinion in; the collection completing
    /// emits INFORM_VOTE exactly once.
    pub(crate) async fn handle_reply_vote(&self, payload: ReplyVotePayload) {
        self.counters.reply_votes_handled.fetch_add(1, Ordering::Relaxed);
        let tx_id = payload.meta.transaction_id;

        let completed = {
            let mut guard = self.state.lock();
            let Some(tx) = guard.transactions.get_mut(&tx_id) else {
                self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!("REPLY_VOTE for unknown transaction {}", tx_id);
                return;
            };
            if tx.phase != ProviderPhase::AwaitingVotes {
                debug!(
                    "dropping REPLY_VOTE from {} for transaction {} in phase {:?}",
                    payload.meta.origin_id, tx_id, tx.phase
                );
                return;
            }
            tx.all_ffs.insert(payload.meta.origin_id.clone(), payload.ffs);
            self.try_complete_votes(tx)
        };

        if let Some((consumer_address, ffs_new)) = completed {
            self.send_inform_vote(&consumer_address, tx_id, ffs_new).await;
        }
    }

    /// Check-and-act under the caller's lock: when the opinion set is
    /// complete for the first time, aggregate and flip the phase so no
    /// second INFORM_VOTE can be produced.
    fn try_complete_votes(&self, tx: &mut ProviderTransaction) -> Option<(String, Ffs)> {
        if tx.phase != ProviderPhase::AwaitingVotes || tx.all_ffs.len() < tx.provider_count {
            return None;
        }
        let mut ffs_new = algorithms::ffs_new(&tx.all_ffs, &tx.provider_list, &self.id, self.params.tau);
        if self.faulty {
            for ff in ffs_new.values_mut() {
                *ff = self.adversarial_ff(*ff);
            }
        }
        tx.phase = ProviderPhase::AwaitingStart;
        Some((tx.consumer_address.clone(), ffs_new))
    }

    async fn send_inform_vote(&self, consumer_address: &str, tx_id: Uuid, ffs_new: Ffs) {
        self.counters.inform_votes_sent.fetch_add(1, Ordering::Relaxed);
        let payload = InformVotePayload {
            meta: Meta::new(EventType::InformVote, tx_id, &self.id, &self.address),
            provider: self.info(),
            ffs_new,
        };
        if let Err(e) = client::send_json(consumer_address, &payload).await {
            warn!("failed to send INFORM_VOTE to {}: {:#}", consumer_address, e);
        }
    }

    /// START_FLOW: record the winner under the transaction id; the winner
    /// itself opens a flow slot.
    pub(crate) fn handle_start_flow(&self, payload: StartFlowPayload) {
        let tx_id = payload.meta.transaction_id;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(tx) = state.transactions.get_mut(&tx_id) else {
            self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
            warn!("START_FLOW for unknown transaction {}", tx_id);
            return;
        };
        if tx.phase != ProviderPhase::AwaitingStart {
            debug!("dropping START_FLOW for transaction {} in phase {:?}", tx_id, tx.phase);
            return;
        }

        if payload.winner.provider_id == self.id {
            state.active_flow_count += 1;
            tx.phase = ProviderPhase::Serving;
            self.counters.flows_started.fetch_add(1, Ordering::Relaxed);
            info!("selected as winner for transaction {}", tx_id);
        } else {
            tx.phase = ProviderPhase::Idle;
        }
        tx.winner = Some(payload.winner);
    }

    /// TRANSACTION_END: settle flow accounting and fold the measured
    /// outcome into the winner's peer-score row.
    pub(crate) fn handle_transaction_end(&self, payload: TransactionEndPayload) {
        let tx_id = payload.meta.transaction_id;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(tx) = state.transactions.get_mut(&tx_id) else {
            self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
            warn!("TRANSACTION_END for unknown transaction {}", tx_id);
            return;
        };
        match tx.phase {
            ProviderPhase::Serving | ProviderPhase::Idle => {}
            other => {
                debug!("dropping TRANSACTION_END for transaction {} in phase {:?}", tx_id, other);
                return;
            }
        }

        if tx.phase == ProviderPhase::Serving {
            state.active_flow_count = state.active_flow_count.saturating_sub(1);
        }

        if let Some(winner) = &tx.winner {
            if winner.provider_id != self.id
                && !state.peer_scores.apply_transaction_end(
                    &winner.provider_id,
                    payload.uplink_speed,
                    payload.downlink_speed,
                    payload.rating,
                    self.params.gamma,
                )
            {
                self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!("no peer-score row for winner {} of transaction {}", winner.provider_id, tx_id);
            }
        }

        tx.phase = ProviderPhase::Done;
        self.counters.transactions_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// GET_PROVIDER_STATS: the one request/response exchange; the state
    /// dump goes back on the same connection.
    pub(crate) async fn handle_get_stats(&self, stream: &mut TcpStream) {
        let dump = self.stats_dump();
        match serde_json::to_vec(&dump) {
            Ok(raw) => {
                if let Err(e) = stream.write_all(&raw).await {
                    debug!("failed to write stats reply: {}", e);
                }
                let _ = stream.shutdown().await;
            }
            Err(e) => warn!("failed to marshal stats dump: {}", e),
        }
    }
}
