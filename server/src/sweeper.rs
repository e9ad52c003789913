//! Periodic background sweeps
//!
//! The heartbeat sweep evicts sessions that have gone quiet. The cleanup
//! sweep removes rooms that were left empty. Both work from snapshots and
//! go through the relay's normal operations, so they can run alongside
//! request handling.

use crate::relay::Relay;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Spawns the liveness sweep: every `period`, evict sessions silent for
/// longer than `timeout`.
pub fn spawn_heartbeat_sweep(
    relay: Arc<Relay>,
    period: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the first tick since it fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let evicted = relay.evict_stale(timeout).await;
            if !evicted.is_empty() {
                info!(
                    "Heartbeat sweep evicted {} session(s) silent for over {:?}",
                    evicted.len(),
                    timeout
                );
            }
        }

        debug!("Heartbeat sweep stopped");
    })
}

/// Spawns the room garbage collector.
pub fn spawn_cleanup_sweep(
    relay: Arc<Relay>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let removed = relay.collect_empty_rooms().await;
            if removed > 0 {
                info!("Cleanup sweep removed {} empty room(s)", removed);
            }
        }

        debug!("Cleanup sweep stopped");
    })
}
