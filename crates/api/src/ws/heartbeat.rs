use std::sync::Arc;
use std::time::Duration;

use gridflow_events::ProgressRelay;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Ping every observer connection once per `every` until `stop` fires.
///
/// Pings keep idle observers (waiting on an hour-long optimization, say)
/// from being dropped by intermediate proxies. The first ping goes out one
/// full interval after start.
pub fn start_heartbeat(
    relay: Arc<ProgressRelay>,
    every: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let observers = relay.connection_count().await;
                    if observers > 0 {
                        tracing::debug!(observers, "Heartbeat ping");
                        relay.ping_all().await;
                    }
                }
            }
        }
        tracing::debug!("Heartbeat stopped");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use gridflow_events::RelayMessage;

    use super::*;

    #[tokio::test]
    async fn pings_observers_until_stopped() {
        let relay = Arc::new(ProgressRelay::new());
        let mut observer = relay.connect("obs-1").await;
        let stop = CancellationToken::new();

        let handle = start_heartbeat(Arc::clone(&relay), Duration::from_millis(20), stop.clone());

        let first = tokio::time::timeout(Duration::from_secs(1), observer.recv())
            .await
            .expect("ping within a second");
        assert!(matches!(first, Some(RelayMessage::Ping)));

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("heartbeat exits on stop")
            .expect("heartbeat task did not panic");
    }
}
