#![forbid(unsafe_code)]

// Liveness monitor - heartbeat that terminates connections which stopped answering pings

use super::protocol::Outbound;
use super::registry::ConnectionRegistry;
use crate::metrics::ServerMetrics;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Result of one heartbeat tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub pinged: usize,
    pub terminated: usize,
}

pub struct LivenessMonitor {
    registry: ConnectionRegistry,
    metrics: ServerMetrics,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: ConnectionRegistry, metrics: ServerMetrics, interval: Duration) -> Self {
        Self {
            registry,
            metrics,
            interval,
        }
    }

    /// One heartbeat tick.
    ///
    /// A connection whose flag was not refreshed since the previous tick is
    /// told to terminate; its socket task then runs the normal disconnect
    /// path. Every other connection has its flag cleared and gets a ping.
    pub fn sweep(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for conn in self.registry.connections() {
            if !conn.alive.swap(false, Ordering::Relaxed) {
                info!("Connection {} missed a heartbeat, terminating", conn.id);
                conn.terminate.notify_one();
                self.metrics.heartbeat_termination();
                outcome.terminated += 1;
                continue;
            }

            match conn.sender.try_send(Outbound::Ping) {
                Ok(()) => {
                    self.metrics.heartbeat_ping();
                    outcome.pinged += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for {}, skipping heartbeat ping", conn.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for {} (disconnecting)", conn.id);
                }
            }
        }

        if outcome.terminated > 0 {
            debug!(
                "Heartbeat: pinged {}, terminated {}",
                outcome.pinged, outcome.terminated
            );
        }
        outcome
    }

    /// Runs `sweep` every interval until the returned task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        info!("Heartbeat interval: {:?}", self.interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_responsive_connection_is_pinged() {
        let registry = ConnectionRegistry::new();
        let monitor = LivenessMonitor::new(registry.clone(), ServerMetrics::new(), Duration::from_secs(30));
        let (tx, mut rx) = mpsc::channel(8);
        let id = registry.register(tx);

        assert_eq!(monitor.sweep(), SweepOutcome { pinged: 1, terminated: 0 });
        assert!(matches!(rx.try_recv(), Ok(Outbound::Ping)));

        registry.mark_alive(&id);
        assert_eq!(monitor.sweep(), SweepOutcome { pinged: 1, terminated: 0 });
    }

    #[tokio::test]
    async fn test_silent_connection_is_terminated() {
        let registry = ConnectionRegistry::new();
        let metrics = ServerMetrics::new();
        let monitor = LivenessMonitor::new(registry.clone(), metrics.clone(), Duration::from_secs(30));
        let (tx, _rx) = mpsc::channel(8);
        let id = registry.register(tx);
        let terminate = registry.lookup(&id).unwrap().terminate;

        monitor.sweep();
        assert_eq!(monitor.sweep(), SweepOutcome { pinged: 0, terminated: 1 });
        assert_eq!(metrics.heartbeat_terminations(), 1);

        // notify_one stores a permit, so a later waiter still sees it
        tokio::time::timeout(Duration::from_secs(1), terminate.notified())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_terminates_after_two_ticks() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = registry.register(tx);
        let terminate = registry.lookup(&id).unwrap().terminate;

        let task = LivenessMonitor::new(registry.clone(), ServerMetrics::new(), Duration::from_secs(30)).spawn();
        tokio::time::timeout(Duration::from_secs(65), terminate.notified())
            .await
            .unwrap();
        task.abort();
    }
}
