//! Guardian: the fast-interval loop that detects and recovers stuck
//! workers.
//!
//! For every in-flight task the Guardian checks the age of the last
//! liveness signal. A stale task is first nudged (a non-destructive
//! message through the worker channel); if the nudge ages past the grace
//! period with no new heartbeat, the task is force-failed and handed to
//! the queue's retry policy. The nudge record lives in the store, keyed
//! against the last heartbeat, so overlapping Guardian cycles — or a
//! restarted process — cannot nudge or fail the same task twice.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;

use super::{Delivery, MonitorConfig, WorkerChannel};
use crate::errors::QueueError;
use crate::events::{self, EventBus, SystemEvent};
use crate::queue::TaskQueueService;
use crate::store::DbHandle;
use crate::store::models::{InterventionKind, Task, TaskStatus, WorkerRef};

/// What one cycle did.
#[derive(Debug, Default)]
pub struct GuardianReport {
    pub scanned: usize,
    pub nudged: usize,
    pub failed: usize,
}

enum Decision {
    /// Fresh heartbeat or already-terminal task; nothing to do.
    Healthy,
    /// Stale with no live nudge: a nudge row was recorded.
    Nudge(WorkerRef),
    /// Stale past the nudge grace period: force the failure.
    ForceFail,
    /// Nudged recently; still inside the grace period.
    InGrace,
}

pub struct Guardian {
    db: DbHandle,
    queue: Arc<TaskQueueService>,
    bus: Arc<EventBus>,
    channel: Arc<dyn WorkerChannel>,
    staleness_threshold: chrono::Duration,
    nudge_grace_period: chrono::Duration,
}

impl Guardian {
    pub fn new(
        db: DbHandle,
        queue: Arc<TaskQueueService>,
        bus: Arc<EventBus>,
        channel: Arc<dyn WorkerChannel>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            db,
            queue,
            bus,
            channel,
            staleness_threshold: chrono::Duration::from_std(config.staleness_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
            nudge_grace_period: chrono::Duration::from_std(config.nudge_grace_period)
                .unwrap_or_else(|_| chrono::Duration::seconds(180)),
        }
    }

    /// One reconciliation pass over all in-flight tasks.
    pub async fn run_once(&self) -> Result<GuardianReport> {
        let in_flight = self.db.call(|db| db.in_flight_tasks()).await?;
        let mut report = GuardianReport {
            scanned: in_flight.len(),
            ..Default::default()
        };

        for task in in_flight {
            match self.decide(&task).await? {
                Decision::Healthy | Decision::InGrace => {}
                Decision::Nudge(worker) => {
                    report.nudged += 1;
                    self.deliver_nudge(&task, &worker).await;
                }
                Decision::ForceFail => {
                    if self.force_fail(&task).await? {
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Decide on a task, re-reading its state and recording the nudge in
    /// the same store critical section. The nudge row is only inserted
    /// when no nudge newer than the last heartbeat exists — that check is
    /// what makes overlapping cycles idempotent.
    async fn decide(&self, task: &Task) -> Result<Decision> {
        let task_id = task.id.clone();
        let staleness_threshold = self.staleness_threshold;
        let grace = self.nudge_grace_period;

        self.db
            .call(move |db| {
                let Some(task) = db.get_task(&task_id)? else {
                    return Ok(Decision::Healthy);
                };
                if !task.status.is_in_flight() {
                    return Ok(Decision::Healthy);
                }
                let Some(worker) = task.worker.clone() else {
                    // In flight without a worker binding: a direct status
                    // write bypassed claiming. Treat as immediately stale.
                    return Ok(Decision::ForceFail);
                };

                let now = Utc::now();
                let last_seen = task.last_seen_at();
                if now - last_seen <= staleness_threshold {
                    return Ok(Decision::Healthy);
                }

                let live_nudge = db
                    .latest_intervention(InterventionKind::Nudge, &task.id)?
                    .filter(|nudge| nudge.created_at > last_seen);

                match live_nudge {
                    None => {
                        db.insert_intervention(
                            InterventionKind::Nudge,
                            &task.id,
                            Some(&format!("no heartbeat since {}", last_seen.to_rfc3339())),
                            None,
                        )?;
                        Ok(Decision::Nudge(worker))
                    }
                    Some(nudge) if now - nudge.created_at > grace => Ok(Decision::ForceFail),
                    Some(_) => Ok(Decision::InGrace),
                }
            })
            .await
    }

    async fn deliver_nudge(&self, task: &Task, worker: &WorkerRef) {
        let message = format!(
            "Task {} ({}) has not reported progress. Send a heartbeat or your \
             task will be failed and requeued.",
            task.id, task.task_type
        );
        let delivery = self.channel.send(worker, &message).await;
        tracing::warn!(
            task_id = %task.id,
            worker = %worker,
            delivery = ?delivery,
            "stale worker nudged"
        );
        self.bus.publish(SystemEvent::new(
            events::WORKER_NUDGED,
            "task",
            &task.id,
            json!({
                "task_id": task.id,
                "worker": worker,
                "delivered": delivery == Delivery::Ack,
            }),
        ));
    }

    /// Force the stale task to failed and apply the retry policy. The
    /// forced transition goes through the queue's guarded update, so a
    /// task that recovered in the meantime is left alone.
    async fn force_fail(&self, task: &Task) -> Result<bool> {
        let queue = self.queue.clone();
        let db = self.db.clone();
        let task_id = task.id.clone();

        tokio::task::spawn_blocking(move || -> Result<bool> {
            match queue.update_status(
                &task_id,
                TaskStatus::Failed,
                None,
                Some("Worker stale: no heartbeat within the staleness threshold"),
            ) {
                Ok(_) => {}
                Err(QueueError::InvalidTransition { .. }) => {
                    // The worker came back and moved the task first.
                    tracing::debug!(task_id = %task_id, "stale task recovered before forced failure");
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }

            {
                let guard = db.lock_sync()?;
                guard.clear_interventions_for(&task_id)?;
            }

            match queue.retry_task(&task_id) {
                Ok(_) => {}
                Err(QueueError::RetriesExhausted { .. }) => {
                    // Escalation was published by the queue; nothing more
                    // for the Guardian to do.
                }
                Err(err) => return Err(err.into()),
            }
            Ok(true)
        })
        .await?
    }
}
