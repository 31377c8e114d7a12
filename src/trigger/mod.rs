//! Trigger Driver
//!
//! Issues synthetic TRIGGER_BUY events to a consumer at randomized
//! intervals, with QoS requirements drawn from configured gaussians. Used
//! to exercise deployments; nothing in the consensus path depends on it.

use std::time::Duration;

use anyhow::Result;
use rand::rngs::ThreadRng;
use tracing::{info, warn};

use crate::config::TriggerSettings;
use crate::scoring::algorithms::clamped_normal;
use crate::wire::{client, EventType, Meta, QosRequirements, TriggerBuyPayload};

/// Floors applied to drawn QoS values so downstream divisors stay sane
const MIN_PRICE: f64 = 0.01;
const MIN_SPEED: f64 = 0.1;
const MIN_EXPONENT: f64 = 0.1;
const MIN_EPSILON: f64 = 1.0;

pub struct Trigger {
    settings: TriggerSettings,
}

impl Trigger {
    pub fn new(settings: TriggerSettings) -> Self {
        Self { settings }
    }

    fn draw_qos(&self, rng: &mut ThreadRng) -> QosRequirements {
        let s = &self.settings;
        QosRequirements {
            price: clamped_normal(rng, s.price_mean, s.price_std_dev, MIN_PRICE, f64::INFINITY),
            uplink: clamped_normal(rng, s.uplink_mean, s.uplink_std_dev, MIN_SPEED, f64::INFINITY),
            downlink: clamped_normal(rng, s.downlink_mean, s.downlink_std_dev, MIN_SPEED, f64::INFINITY),
            mu: clamped_normal(rng, s.mu_mean, s.mu_std_dev, MIN_EXPONENT, f64::INFINITY),
            delta: clamped_normal(rng, s.delta_mean, s.delta_std_dev, MIN_EXPONENT, f64::INFINITY),
            epsilon: clamped_normal(rng, s.epsilon_mean, s.epsilon_std_dev, MIN_EPSILON, f64::INFINITY),
        }
    }

    /// Run the configured number of buy events, then return.
    pub async fn run(&self) -> Result<()> {
        let s = &self.settings;
        info!(
            "issuing {} buy events to {} across {} providers",
            s.buy_event_count,
            s.consumer_address,
            s.provider_list.len()
        );

        for n in 0..s.buy_event_count {
            // The rng stays scoped to the draw so it is never held across
            // an await point
            let (interval, qos) = {
                let mut rng = rand::thread_rng();
                let interval = clamped_normal(
                    &mut rng,
                    s.buy_event_interval_mean,
                    s.buy_event_interval_std_dev,
                    0.0,
                    f64::INFINITY,
                );
                (interval, self.draw_qos(&mut rng))
            };
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;

            let payload = TriggerBuyPayload {
                meta: Meta {
                    payload_type: EventType::TriggerBuy.code(),
                    ..Default::default()
                },
                provider_list: s.provider_list.clone(),
                qos,
            };
            match client::send_json(&s.consumer_address, &payload).await {
                Ok(()) => info!("sent TRIGGER_BUY {}/{}", n + 1, s.buy_event_count),
                Err(e) => warn!("failed to send TRIGGER_BUY {}/{}: {:#}", n + 1, s.buy_event_count, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode, decode_meta, ProviderInfo};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn settings(consumer_address: String) -> TriggerSettings {
        TriggerSettings {
            consumer_address,
            buy_event_count: 1,
            buy_event_interval_mean: 0.0,
            buy_event_interval_std_dev: 0.0,
            uplink_mean: 10.0,
            uplink_std_dev: 2.0,
            downlink_mean: 20.0,
            downlink_std_dev: 2.0,
            price_mean: 25.0,
            price_std_dev: 5.0,
            mu_mean: 1.0,
            mu_std_dev: 0.2,
            delta_mean: 1.0,
            delta_std_dev: 0.2,
            epsilon_mean: 2.0,
            epsilon_std_dev: 0.2,
            provider_list: vec![ProviderInfo {
                provider_id: "a".to_string(),
                address: "127.0.0.1:7001".to_string(),
                iperf3_base_server_port: 5201,
                iperf3_server_count: 1,
                price: 0.0,
            }],
        }
    }

    #[test]
    fn test_drawn_qos_respects_floors() {
        let mut s = settings("127.0.0.1:1".to_string());
        // Means far below the floors force every clamp
        s.price_mean = -100.0;
        s.uplink_mean = -100.0;
        s.downlink_mean = -100.0;
        s.mu_mean = -100.0;
        s.delta_mean = -100.0;
        s.epsilon_mean = -100.0;
        let trigger = Trigger::new(s);

        let mut rng = rand::thread_rng();
        let qos = trigger.draw_qos(&mut rng);
        assert_eq!(qos.price, MIN_PRICE);
        assert_eq!(qos.uplink, MIN_SPEED);
        assert_eq!(qos.downlink, MIN_SPEED);
        assert_eq!(qos.mu, MIN_EXPONENT);
        assert_eq!(qos.delta, MIN_EXPONENT);
        assert_eq!(qos.epsilon, MIN_EPSILON);
    }

    #[tokio::test]
    async fn test_run_delivers_trigger_buy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await.unwrap();
            raw
        });

        Trigger::new(settings(addr)).run().await.unwrap();

        let raw = accept.await.unwrap();
        let (_, event) = decode_meta(&raw).unwrap();
        assert_eq!(event, EventType::TriggerBuy);
        let payload: TriggerBuyPayload = decode(&raw).unwrap();
        assert_eq!(payload.provider_list.len(), 1);
        assert!(payload.qos.price >= MIN_PRICE);
    }
}
