//! Beacon Emission and Handling
//!
//! Providers advertise liveness, channel utilization, and signal strength
//! to a configured peer set on a fixed interval. Inbound beacons feed the
//! peer-score table; outbound utilization is derived from the provider's
//! own active flows.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::BeaconSettings;
use crate::now_ms;
use crate::scoring::algorithms;
use crate::wire::{client, BeaconPayload, EventType, Meta};

use super::Provider;

impl Provider {
    /// Fold one inbound beacon into the peer-score table.
    pub(crate) fn handle_beacon(&self, payload: BeaconPayload) {
        self.counters.beacons_received.fetch_add(1, Ordering::Relaxed);
        let origin = &payload.meta.origin_id;
        if origin.is_empty() || origin == self.id() {
            return;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.peer_scores.observe_beacon(
            origin,
            payload.channel_utilization_rate,
            payload.signal_strength,
            now_ms(),
            &self.params,
            &self.defaults,
        );
    }

    /// The utilization advertised on the next beacon tick.
    fn current_channel_utilization(&self) -> u8 {
        algorithms::channel_utilization(self.state.lock().active_flow_count)
    }
}

/// Emit beacons to every configured peer address until cancelled.
pub async fn run_beacon_emitter(provider: Arc<Provider>, settings: BeaconSettings) {
    info!(
        "emitting beacons to {} peers every {}ms",
        settings.addresses.len(),
        settings.interval
    );
    let mut ticker = tokio::time::interval(Duration::from_millis(settings.interval.max(1)));
    loop {
        ticker.tick().await;

        let payload = BeaconPayload {
            meta: Meta::new(EventType::Beacon, Uuid::nil(), provider.id(), provider.address()),
            channel_utilization_rate: provider.current_channel_utilization(),
            signal_strength: settings.mock_rssi,
        };

        let failures = client::broadcast(&settings.addresses, &payload).await;
        let sent = settings.addresses.len().saturating_sub(failures) as u64;
        provider.counters.beacons_sent.fetch_add(sent, Ordering::Relaxed);
        if failures > 0 {
            debug!("{} beacon sends failed this tick", failures);
        }
    }
}
