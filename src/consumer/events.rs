//! Consumer Event Handlers
//!
//! TRIGGER_BUY opens a transaction and fans BUY out to the provider pool;
//! INFORM_VOTE collection completing runs the final aggregation, announces
//! the winner, measures the flow, and closes the transaction everywhere.

use std::sync::atomic::Ordering;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::iperf3::{bps_to_mbytes, StreamDirection};
use crate::now_ms;
use crate::scoring::{algorithms, AllFfs};
use crate::wire::{
    client, BuyPayload, EventType, Ffs, InformVotePayload, Meta, ProviderInfo, QosRequirements,
    StartFlowPayload, TransactionEndPayload, TriggerBuyPayload,
};

use super::{Consumer, ConsumerPhase, ConsumerTransaction, FlowMetrics};

impl Consumer {
    /// TRIGGER_BUY: open a transaction with a fresh id and send BUY to
    /// every provider in the list.
    pub(crate) async fn handle_trigger_buy(&self, payload: TriggerBuyPayload) {
        let tx_id = Uuid::new_v4();
        let qos = if payload.qos.price > 0.0 {
            payload.qos
        } else {
            self.default_qos
        };

        let provider_list = payload.provider_list;
        if provider_list.is_empty() {
            warn!("ignoring TRIGGER_BUY with empty provider list");
            return;
        }
        info!(
            "starting transaction {} across {} providers",
            tx_id,
            provider_list.len()
        );

        {
            let mut guard = self.state.lock();
            guard.transactions.insert(
                tx_id,
                ConsumerTransaction {
                    id: tx_id,
                    created_at_ms: now_ms(),
                    provider_count: provider_list.len(),
                    provider_list: provider_list.clone(),
                    qos,
                    all_ffs: AllFfs::new(),
                    ffs_final: Ffs::new(),
                    phase: ConsumerPhase::Collecting,
                    winner: None,
                    flow_metrics: None,
                },
            );
        }

        let buy = BuyPayload {
            meta: Meta::new(EventType::Buy, tx_id, &self.id, &self.address),
            provider_list: provider_list.clone(),
            qos,
        };
        let addrs: Vec<&str> = provider_list.iter().map(|p| p.address.as_str()).collect();
        client::broadcast(addrs, &buy).await;
        self.counters.buys_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// INFORM_VOTE: fold one provider's aggregated opinion in; the last
    /// arrival triggers winner selection and the flow, exactly once.
    pub(crate) async fn handle_inform_vote(&self, payload: InformVotePayload) {
        self.counters.inform_votes_received.fetch_add(1, Ordering::Relaxed);
        let tx_id = payload.meta.transaction_id;

        let action = {
            let mut guard = self.state.lock();
            let Some(tx) = guard.transactions.get_mut(&tx_id) else {
                self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!("INFORM_VOTE for unknown transaction {}", tx_id);
                return;
            };
            if tx.phase != ConsumerPhase::Collecting {
                debug!(
                    "dropping INFORM_VOTE from {} for transaction {} in phase {:?}",
                    payload.meta.origin_id, tx_id, tx.phase
                );
                return;
            }

            tx.all_ffs.insert(payload.meta.origin_id.clone(), payload.ffs_new);

            // Fold the sender's advertised endpoints and price into our view
            if let Some(row) = tx
                .provider_list
                .iter_mut()
                .find(|p| p.provider_id == payload.provider.provider_id)
            {
                row.address = payload.provider.address.clone();
                row.iperf3_base_server_port = payload.provider.iperf3_base_server_port;
                row.iperf3_server_count = payload.provider.iperf3_server_count;
                row.price = payload.provider.price;
            }

            if tx.all_ffs.len() < tx.provider_count {
                None
            } else {
                let (ffs_final, winner) = algorithms::ffs_final(&tx.all_ffs, &tx.provider_list, self.tau);
                tx.ffs_final = ffs_final;
                match winner {
                    None => {
                        error!("no winner for transaction {}: every candidate scored NaN", tx_id);
                        tx.phase = ConsumerPhase::Done;
                        None
                    }
                    Some(winner) => {
                        tx.winner = Some(winner.clone());
                        tx.phase = ConsumerPhase::Flowing;
                        Some((winner, tx.provider_list.clone(), tx.qos))
                    }
                }
            }
        };

        if let Some((winner, provider_list, qos)) = action {
            self.run_flow(tx_id, winner, provider_list, qos).await;
        }
    }

    /// Announce the winner, measure both directions against it, rate the
    /// outcome, and close the transaction at every provider.
    async fn run_flow(
        &self,
        tx_id: Uuid,
        winner: ProviderInfo,
        provider_list: Vec<ProviderInfo>,
        qos: QosRequirements,
    ) {
        self.counters.flows_started.fetch_add(1, Ordering::Relaxed);
        info!(
            "transaction {}: winner {} at {}",
            tx_id, winner.provider_id, winner.address
        );

        let addrs: Vec<String> = provider_list.iter().map(|p| p.address.clone()).collect();
        let start = StartFlowPayload {
            meta: Meta::new(EventType::StartFlow, tx_id, &self.id, &self.address),
            winner: winner.clone(),
        };
        client::broadcast(&addrs, &start).await;

        let host = winner.address.split(':').next().unwrap_or(&winner.address);
        let (forward, reverse) = tokio::join!(
            self.oracle.measure(
                host,
                winner.iperf3_base_server_port,
                winner.iperf3_server_count,
                StreamDirection::Forward,
            ),
            self.oracle.measure(
                host,
                winner.iperf3_base_server_port,
                winner.iperf3_server_count,
                StreamDirection::Reverse,
            ),
        );

        let uplink_bps = forward.unwrap_or_else(|e| {
            warn!("forward measurement against {} failed: {:#}", host, e);
            0.0
        });
        let downlink_bps = reverse.unwrap_or_else(|e| {
            warn!("reverse measurement against {} failed: {:#}", host, e);
            0.0
        });

        let uplink = bps_to_mbytes(uplink_bps);
        let downlink = bps_to_mbytes(downlink_bps);
        let rating = algorithms::consumer_rating(uplink, downlink, qos.uplink, qos.downlink);
        info!(
            "transaction {}: measured {:.3}/{:.3} Mbyte/s, rating {:.3}",
            tx_id, uplink, downlink, rating
        );

        let end = TransactionEndPayload {
            meta: Meta::new(EventType::TransactionEnd, tx_id, &self.id, &self.address),
            rating,
            uplink_speed: uplink,
            downlink_speed: downlink,
        };
        client::broadcast(&addrs, &end).await;

        {
            let mut guard = self.state.lock();
            if let Some(tx) = guard.transactions.get_mut(&tx_id) {
                tx.flow_metrics = Some(FlowMetrics {
                    rating,
                    uplink_speed: uplink,
                    downlink_speed: downlink,
                });
                tx.phase = ConsumerPhase::Done;
            }
        }
        self.counters.transactions_completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use crate::iperf3::ThroughputOracle;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Oracle returning fixed bit rates: 50 Mbyte/s up, 200 Mbyte/s down
    struct FixedOracle;

    #[async_trait]
    impl ThroughputOracle for FixedOracle {
        async fn measure(
            &self,
            _host: &str,
            _base_port: u16,
            _port_count: u16,
            direction: StreamDirection,
        ) -> anyhow::Result<f64> {
            Ok(match direction {
                StreamDirection::Forward => 50.0 * 8_000_000.0,
                StreamDirection::Reverse => 200.0 * 8_000_000.0,
            })
        }
    }

    fn test_consumer() -> Arc<Consumer> {
        Consumer::new(
            ConsumerConfig {
                id: "consumer-1".to_string(),
                address: "127.0.0.1:1".to_string(),
                iperf3_base_server_port: 5301,
                iperf3_server_count: 1,
                params: QosRequirements {
                    price: 25.0,
                    uplink: 100.0,
                    downlink: 100.0,
                    mu: 1.0,
                    delta: 1.0,
                    epsilon: 2.0,
                },
                tau: 2.0,
                output_dir: "/tmp".to_string(),
                transaction_deadline_ms: 30_000,
            },
            Arc::new(FixedOracle),
        )
    }

    fn provider(id: &str) -> ProviderInfo {
        ProviderInfo {
            provider_id: id.to_string(),
            address: "127.0.0.1:1".to_string(),
            iperf3_base_server_port: 5201,
            iperf3_server_count: 1,
            price: 0.0,
        }
    }

    fn inform(tx_id: Uuid, origin: &str, ffs_new: Ffs) -> InformVotePayload {
        InformVotePayload {
            meta: Meta::new(EventType::InformVote, tx_id, origin, "127.0.0.1:1"),
            provider: ProviderInfo {
                provider_id: origin.to_string(),
                address: "127.0.0.1:1".to_string(),
                iperf3_base_server_port: 5201,
                iperf3_server_count: 1,
                price: 20.0,
            },
            ffs_new,
        }
    }

    async fn open_transaction(consumer: &Arc<Consumer>, providers: Vec<ProviderInfo>) -> Uuid {
        consumer
            .handle_trigger_buy(TriggerBuyPayload {
                meta: Meta {
                    payload_type: EventType::TriggerBuy.code(),
                    ..Default::default()
                },
                provider_list: providers,
                qos: QosRequirements::default(),
            })
            .await;
        consumer.transactions()[0].id
    }

    #[tokio::test]
    async fn test_trigger_buy_opens_collecting_transaction() {
        let consumer = test_consumer();
        let tx_id = open_transaction(&consumer, vec![provider("a"), provider("b")]).await;

        let tx = consumer.transaction(tx_id).unwrap();
        assert_eq!(tx.phase, ConsumerPhase::Collecting);
        assert_eq!(tx.provider_count, 2);
        // Zeroed trigger QoS falls back to the configured defaults
        assert_eq!(tx.qos.price, 25.0);
        assert_eq!(consumer.counters.buys_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_partial_collection_stalls() {
        let consumer = test_consumer();
        let tx_id = open_transaction(&consumer, vec![provider("a"), provider("b")]).await;

        consumer
            .handle_inform_vote(inform(tx_id, "a", Ffs::from([("b".to_string(), 0.4)])))
            .await;

        let tx = consumer.transaction(tx_id).unwrap();
        assert_eq!(tx.phase, ConsumerPhase::Collecting);
        assert!(tx.winner.is_none());
        assert_eq!(consumer.counters.flows_started.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_complete_collection_runs_flow_and_rates_it() {
        let consumer = test_consumer();
        let tx_id = open_transaction(
            &consumer,
            vec![provider("a"), provider("b"), provider("c")],
        )
        .await;

        consumer
            .handle_inform_vote(inform(
                tx_id,
                "a",
                Ffs::from([("b".to_string(), 0.6), ("c".to_string(), 0.2)]),
            ))
            .await;
        consumer
            .handle_inform_vote(inform(
                tx_id,
                "b",
                Ffs::from([("a".to_string(), 0.3), ("c".to_string(), 0.25)]),
            ))
            .await;
        consumer
            .handle_inform_vote(inform(
                tx_id,
                "c",
                Ffs::from([("a".to_string(), 0.35), ("b".to_string(), 0.55)]),
            ))
            .await;

        let tx = consumer.transaction(tx_id).unwrap();
        assert_eq!(tx.phase, ConsumerPhase::Done);
        // b's column mean (0.575) beats a's (0.325) and c's (0.225)
        assert_eq!(tx.winner.unwrap().provider_id, "b");

        // Oracle delivered 50/200 Mbyte/s against 100/100 required
        let metrics = tx.flow_metrics.unwrap();
        assert!((metrics.uplink_speed - 50.0).abs() < 1e-9);
        assert!((metrics.downlink_speed - 200.0).abs() < 1e-9);
        assert!((metrics.rating - 0.75).abs() < 1e-12);
        assert_eq!(consumer.counters.flows_started.load(Ordering::Relaxed), 1);
        assert_eq!(consumer.counters.transactions_completed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_duplicate_inform_vote_cannot_restart_flow() {
        let consumer = test_consumer();
        let tx_id = open_transaction(&consumer, vec![provider("a"), provider("b")]).await;

        consumer
            .handle_inform_vote(inform(tx_id, "a", Ffs::from([("b".to_string(), 0.4)])))
            .await;
        consumer
            .handle_inform_vote(inform(tx_id, "b", Ffs::from([("a".to_string(), 0.3)])))
            .await;
        assert_eq!(consumer.counters.flows_started.load(Ordering::Relaxed), 1);

        consumer
            .handle_inform_vote(inform(tx_id, "b", Ffs::from([("a".to_string(), 0.9)])))
            .await;
        assert_eq!(consumer.counters.flows_started.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_inform_vote_merges_advertised_endpoints() {
        let consumer = test_consumer();
        let tx_id = open_transaction(&consumer, vec![provider("a"), provider("b")]).await;

        consumer
            .handle_inform_vote(inform(tx_id, "a", Ffs::from([("b".to_string(), 0.4)])))
            .await;

        let tx = consumer.transaction(tx_id).unwrap();
        let row = tx.provider_list.iter().find(|p| p.provider_id == "a").unwrap();
        assert_eq!(row.price, 20.0);
        assert_eq!(row.iperf3_base_server_port, 5201);
    }
}
