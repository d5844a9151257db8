use std::time::Duration;

use fleet_core::{expire_idle_sessions, FleetContext};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::info;

/// Periodically forgets sessions nobody has used within the idle timeout.
pub(crate) fn spawn_session_sweeper(fleet: FleetContext, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let expired = expire_idle_sessions(&fleet).await;
            if !expired.is_empty() {
                let remaining = fleet.sessions.count().await;
                info!(
                    expired = expired.len(),
                    remaining = remaining,
                    "swept idle sessions"
                );
            }
        }
    })
}
