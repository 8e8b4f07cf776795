use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broadcaster::{BroadcasterConfig, ProgressBroadcaster};

/// Spawn the periodic sweep that evicts idle observers and pings the rest.
///
/// Runs every `heartbeat_interval` from the broadcaster's config until
/// `cancel` fires. The first sweep happens one full interval after start.
/// A zero interval falls back to the default.
pub fn start_heartbeat(
    broadcaster: Arc<ProgressBroadcaster>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut period = broadcaster.config().heartbeat_interval;
        if period.is_zero() {
            period = BroadcasterConfig::default().heartbeat_interval;
            tracing::warn!(
                fallback_secs = period.as_secs(),
                "Zero heartbeat interval, using the default",
            );
        }
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Observer heartbeat stopped");
                    break;
                }
                _ = interval.tick() => {
                    let evicted = broadcaster.sweep_idle().await;
                    let pinged = broadcaster.ping_all().await;
                    tracing::debug!(evicted = evicted.len(), pinged, "Observer heartbeat");
                }
            }
        }
    })
}
