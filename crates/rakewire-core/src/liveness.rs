//! Heartbeat sweeps and dead-connection reclamation.
//!
//! Every interval the monitor visits each live connection: one that has
//! shown no sign of life since the previous visit is terminated, every other
//! one is marked as awaiting a pong and pinged. A silent peer is therefore
//! reclaimed after at most two intervals. Connections the broadcaster failed
//! to write to are checked immediately instead of waiting for the next tick.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::registry::ConnectionRegistry;
use crate::telemetry;
use rakewire_protocol::CloseReason;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections pinged.
    pub pinged: usize,
    /// Connections terminated.
    pub terminated: usize,
}

/// Periodic liveness sweeper.
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Option<Duration>,
    suspects: mpsc::UnboundedReceiver<ConnectionId>,
}

impl LivenessMonitor {
    pub(crate) fn new(
        registry: Arc<ConnectionRegistry>,
        interval: Option<Duration>,
        suspects: mpsc::UnboundedReceiver<ConnectionId>,
    ) -> Self {
        Self {
            registry,
            interval,
            suspects,
        }
    }

    /// Visit every live connection once.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for handle in self.registry.snapshot() {
            let reason = if !handle.begin_cycle() {
                CloseReason::LivenessTimeout
            } else if handle.ping().is_ok() {
                report.pinged += 1;
                continue;
            } else {
                CloseReason::SlowConsumer
            };
            if self.terminate(&handle, reason) {
                report.terminated += 1;
            }
        }

        if report.terminated > 0 {
            info!(
                pinged = report.pinged,
                terminated = report.terminated,
                "Heartbeat sweep reclaimed connections"
            );
        } else {
            debug!(pinged = report.pinged, "Heartbeat sweep");
        }
        report
    }

    /// Check one connection out of cycle after a failed write.
    ///
    /// A connection whose writer is gone is removed immediately. Any other is
    /// pinged with its alive flag cleared, so it must answer before the next
    /// sweep.
    pub fn recheck(&self, id: &ConnectionId) -> bool {
        let Some(handle) = self.registry.get(id) else {
            return false;
        };

        let reclaimed = if handle.writer_gone() {
            self.terminate(&handle, CloseReason::SlowConsumer)
        } else {
            handle.begin_cycle();
            match handle.ping() {
                Ok(()) => false,
                Err(e) => {
                    debug!(connection = %id, error = %e, "Out-of-cycle ping failed");
                    self.terminate(&handle, CloseReason::SlowConsumer)
                }
            }
        };

        handle.clear_flag();
        reclaimed
    }

    fn terminate(&self, handle: &ConnectionHandle, reason: CloseReason) -> bool {
        if self.registry.remove(handle.id(), reason).is_none() {
            return false;
        }
        warn!(connection = %handle.id(), reason = %reason, "Reclaimed connection");
        telemetry::record_reclaimed(match reason {
            CloseReason::LivenessTimeout => "liveness_timeout",
            CloseReason::SlowConsumer => "slow_consumer",
            _ => "other",
        });
        true
    }

    /// Run until every [`crate::Broadcaster`] is dropped.
    ///
    /// With heartbeats disabled only failed-write checks are performed.
    pub async fn run(mut self) {
        let Some(period) = self.interval else {
            info!("Heartbeat disabled");
            while let Some(id) = self.suspects.recv().await {
                self.recheck(&id);
            }
            return;
        };

        info!(interval_ms = period.as_millis() as u64, "Liveness monitor started");
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                suspect = self.suspects.recv() => match suspect {
                    Some(id) => {
                        self.recheck(&id);
                    }
                    None => break,
                },
            }
        }

        info!("Liveness monitor stopped");
    }
}
