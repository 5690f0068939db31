//! Periodic ping/pong liveness sweep over every registered connection.
//!
//! Each sweep terminates connections that have not answered since the
//! previous sweep, then clears the alive flag of the rest and pings them.
//! A pong sets the flag again, so an unresponsive connection is removed at
//! the latest two periods after its last pong.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::CLOSE_GOING_AWAY;
use super::registry::ConnectionRegistry;
use crate::errors::DeliveryError;
use crate::metrics::{DISCONNECTIONS_TOTAL, LIVENESS_TERMINATIONS_TOTAL};

/// Outcome of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections that were sent a probe.
    pub probed: usize,
    /// Connections removed because they missed the previous probe.
    pub terminated: usize,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Global liveness sweep with an explicit start/stop lifecycle.
///
/// The monitor can be started again after [`stop`](LivenessMonitor::stop);
/// each run gets its own cancellation token.
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    running: Mutex<Option<Running>>,
}

impl LivenessMonitor {
    /// Create a stopped monitor.
    pub fn new(registry: Arc<ConnectionRegistry>, period: Duration) -> Self {
        Self {
            registry,
            period,
            running: Mutex::new(None),
        }
    }

    /// Sweep interval.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run one sweep now.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for conn in self.registry.snapshot() {
            if !conn.check_alive() {
                // Deregister first so no further fan-out targets it.
                let _ = self.registry.deregister(conn.id());
                conn.close(CLOSE_GOING_AWAY, "liveness timeout");
                report.terminated += 1;
                counter!(LIVENESS_TERMINATIONS_TOTAL).increment(1);
                counter!(DISCONNECTIONS_TOTAL, "reason" => "liveness_timeout").increment(1);
                info!(connection_id = %conn.id(), identity = conn.identity(), "liveness timeout, connection terminated");
                continue;
            }
            match conn.ping() {
                Ok(()) => report.probed += 1,
                Err(DeliveryError::Closed) => {
                    if self.registry.deregister(conn.id()).is_some() {
                        debug!(connection_id = %conn.id(), "pruned closed connection during sweep");
                    }
                }
                Err(DeliveryError::QueueFull) => {
                    // Missing this probe means the next sweep will terminate it.
                    warn!(connection_id = %conn.id(), "probe dropped, outbound queue full");
                }
            }
        }
        if report.terminated > 0 {
            info!(
                probed = report.probed,
                terminated = report.terminated,
                "liveness sweep"
            );
        } else {
            debug!(probed = report.probed, "liveness sweep");
        }
        report
    }

    /// Spawn the sweep loop.
    ///
    /// The first sweep runs one period after this call. The loop ends when
    /// [`stop`](Self::stop) is called or `shutdown` is cancelled. Calling
    /// `start` on a running monitor has no effect.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let mut slot = self.running.lock();
        if slot.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            warn!("liveness monitor already started");
            return;
        }
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + monitor.period, monitor.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = monitor.period.as_secs(), "liveness monitor started");
            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = monitor.sweep();
                    }
                }
            }
            info!("liveness monitor stopped");
        });
        *slot = Some(Running { cancel, handle });
    }

    /// Stop the sweep loop and wait for it to exit.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if let Err(err) = handle.await {
                warn!(error = %err, "liveness monitor task failed");
            }
        }
    }

    /// Whether the sweep loop is active.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{Connection, ConnectionId, Outbound};
    use tokio::sync::mpsc;

    const PERIOD: Duration = Duration::from_secs(30);

    fn add(
        registry: &ConnectionRegistry,
        id: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = Arc::new(Connection::new(ConnectionId::from(id), "alice", tx));
        registry.register(Arc::clone(&conn)).unwrap();
        (conn, rx)
    }

    /// Answer every probe with a pong, like a healthy client.
    fn respond(conn: Arc<Connection>, mut rx: mpsc::Receiver<Outbound>) {
        let _ = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if frame == Outbound::Ping {
                    conn.mark_alive();
                }
            }
        });
    }

    #[test]
    fn first_sweep_probes_second_terminates_silent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let monitor = LivenessMonitor::new(Arc::clone(&registry), PERIOD);
        let (silent, mut rx) = add(&registry, "silent");

        assert_eq!(
            monitor.sweep(),
            SweepReport {
                probed: 1,
                terminated: 0
            }
        );
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);
        assert!(!silent.is_alive());

        assert_eq!(
            monitor.sweep(),
            SweepReport {
                probed: 0,
                terminated: 1
            }
        );
        assert!(registry.is_empty());
        assert_eq!(silent.close_reason().unwrap().reason, "liveness timeout");
    }

    #[test]
    fn pong_between_sweeps_keeps_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let monitor = LivenessMonitor::new(Arc::clone(&registry), PERIOD);
        let (conn, _rx) = add(&registry, "healthy");

        for _ in 0..5 {
            let report = monitor.sweep();
            assert_eq!(report.terminated, 0);
            conn.mark_alive();
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn closed_writer_is_pruned_without_termination() {
        let registry = Arc::new(ConnectionRegistry::new());
        let monitor = LivenessMonitor::new(Arc::clone(&registry), PERIOD);
        let (_conn, rx) = add(&registry, "gone");
        drop(rx);

        let report = monitor.sweep();
        assert_eq!(report, SweepReport::default());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_connection_pruned_within_two_periods() {
        let registry = Arc::new(ConnectionRegistry::new());
        let monitor = Arc::new(LivenessMonitor::new(Arc::clone(&registry), PERIOD));
        let (silent, _silent_rx) = add(&registry, "silent");
        let (healthy, healthy_rx) = add(&registry, "healthy");
        respond(healthy, healthy_rx);

        monitor.start(CancellationToken::new());
        assert!(monitor.is_running());

        time::sleep(PERIOD + Duration::from_secs(1)).await;
        assert!(registry.get(silent.id()).is_some());

        time::sleep(PERIOD).await;
        assert!(registry.get(silent.id()).is_none());
        assert!(!silent.is_open());

        time::sleep(PERIOD * 10).await;
        assert!(registry.get(&ConnectionId::from("healthy")).is_some());

        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_token_stops_loop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let monitor = Arc::new(LivenessMonitor::new(registry, PERIOD));
        let shutdown = CancellationToken::new();
        monitor.start(shutdown.clone());
        monitor.start(shutdown.clone());
        shutdown.cancel();
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_resumes_sweeps() {
        let registry = Arc::new(ConnectionRegistry::new());
        let monitor = Arc::new(LivenessMonitor::new(Arc::clone(&registry), PERIOD));
        monitor.start(CancellationToken::new());
        monitor.stop().await;
        assert!(!monitor.is_running());

        let (silent, _silent_rx) = add(&registry, "silent");
        monitor.start(CancellationToken::new());
        assert!(monitor.is_running());

        time::sleep(PERIOD * 2 + Duration::from_secs(1)).await;
        assert!(registry.get(silent.id()).is_none());
        assert!(monitor.is_running());

        monitor.stop().await;
        assert!(!monitor.is_running());
    }
}
