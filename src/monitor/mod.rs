//! Periodic reconciliation loops.
//!
//! Two independently scheduled loops share the store's read path: the
//! Guardian (short interval) recovers stuck workers, the Conductor (long
//! interval) watches system-wide health. Both are read-mostly and
//! idempotent — every intervention is guarded by a conditional store
//! write, so overlapping cycles cannot double-act.

pub mod conductor;
pub mod guardian;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::store::models::WorkerRef;

pub use conductor::{Conductor, ConductorReport};
pub use guardian::{Guardian, GuardianReport};

/// Outcome of a message delivery attempt to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Ack,
    Timeout,
}

/// Message channel to running workers — an external collaborator seam.
/// The Guardian uses it for non-destructive nudges before escalating.
#[async_trait]
pub trait WorkerChannel: Send + Sync {
    async fn send(&self, worker: &WorkerRef, message: &str) -> Delivery;
}

/// Default channel: logs the nudge and reports it delivered. Deployments
/// plug in a real transport (sandbox exec, agent mailbox, webhook).
pub struct LogChannel;

#[async_trait]
impl WorkerChannel for LogChannel {
    async fn send(&self, worker: &WorkerRef, message: &str) -> Delivery {
        tracing::info!(worker = %worker, message, "worker nudge (log channel)");
        Delivery::Ack
    }
}

/// Timing and thresholds for both loops.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub guardian_interval: Duration,
    pub conductor_interval: Duration,
    /// A bound worker with no liveness signal for this long is stale.
    pub staleness_threshold: Duration,
    /// Time a nudged worker gets to recover before the forced failure.
    pub nudge_grace_period: Duration,
    /// Active-worker ceiling for Conductor alerts; 0 disables the check.
    pub max_active_workers: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            guardian_interval: Duration::from_secs(30),
            conductor_interval: Duration::from_secs(300),
            staleness_threshold: Duration::from_secs(120),
            nudge_grace_period: Duration::from_secs(180),
            max_active_workers: 0,
        }
    }
}

/// Start both loops. Each runs until the process exits; cycle errors are
/// logged and the loop keeps its cadence.
pub fn spawn(
    guardian: Arc<Guardian>,
    conductor: Arc<Conductor>,
    config: &MonitorConfig,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let guardian_interval = config.guardian_interval;
    let guardian_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(guardian_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match guardian.run_once().await {
                Ok(report) if report.scanned > 0 => {
                    tracing::debug!(
                        scanned = report.scanned,
                        nudged = report.nudged,
                        failed = report.failed,
                        "guardian cycle complete"
                    );
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "guardian cycle failed"),
            }
        }
    });

    let conductor_interval = config.conductor_interval;
    let conductor_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(conductor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match conductor.run_once().await {
                Ok(report) => {
                    tracing::debug!(
                        active_workers = report.active_workers,
                        stuck_tickets = report.newly_stuck.len(),
                        "conductor cycle complete"
                    );
                }
                Err(err) => tracing::error!(error = %err, "conductor cycle failed"),
            }
        }
    });

    (guardian_handle, conductor_handle)
}
