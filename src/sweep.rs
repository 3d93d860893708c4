//! Periodic rescheduling sweep configuration and runtime types.
//!
//! This module provides [`SweepConfig`] for tuning how often scheduled
//! signals are checked, and [`SweepHandle`] for controlling a running
//! sweeper.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::bus::SignalBus;

/// Configuration for the background rescheduling sweep.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_bus::SweepConfig;
///
/// let config = SweepConfig {
///     interval: Duration::from_millis(250),
/// };
/// assert_eq!(SweepConfig::default().interval, Duration::from_secs(1));
/// assert!(config.interval < SweepConfig::default().interval);
/// ```
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between two sweeps.
    ///
    /// A scheduled signal is delivered at most one interval after its
    /// delivery time.
    ///
    /// Default: 1 second.
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Handle for controlling the background sweeper.
///
/// Dropping the handle does **not** stop the sweeper; call
/// [`shutdown`](SweepHandle::shutdown).
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct SweepHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    sweeps: Arc<AtomicU64>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SweepHandle {
    /// Number of sweeps completed so far, successful or not.
    pub fn sweeps_completed(&self) -> u64 {
        self.sweeps.load(Ordering::Acquire)
    }

    /// Stop the sweeper and wait for the sweep in progress to finish.
    ///
    /// Calling `shutdown` more than once is safe -- subsequent calls
    /// return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the sweeper task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        // The receiver is gone if the task already exited.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| io::Error::other(format!("sweeper task panicked: {e}"))),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SweepHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepHandle")
            .field("sweeps_completed", &self.sweeps_completed())
            .finish_non_exhaustive()
    }
}

/// Spawn the sweep loop on the current tokio runtime.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub(crate) fn spawn_sweeper(bus: SignalBus, config: SweepConfig) -> SweepHandle {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweeps = Arc::new(AtomicU64::new(0));
    let task = tokio::spawn(run_sweep_loop(bus, config, Arc::clone(&sweeps), shutdown_rx));
    SweepHandle {
        shutdown_tx,
        sweeps,
        task: Arc::new(tokio::sync::Mutex::new(Some(task))),
    }
}

async fn run_sweep_loop(
    bus: SignalBus,
    config: SweepConfig,
    sweeps: Arc<AtomicU64>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match bus.reschedule().await {
                    Ok(report) if report.delivered > 0 => tracing::info!(
                        delivered = report.delivered,
                        pending = report.pending,
                        "sweep delivered scheduled signals"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "rescheduling sweep failed"),
                }
                sweeps.fetch_add(1, Ordering::AcqRel);
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("sweeper shutting down");
                    return;
                }
            }
        }
    }
}
