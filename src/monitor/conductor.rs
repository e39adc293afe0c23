//! Conductor: the slow-interval loop watching system-wide health.
//!
//! Aggregates task/worker counts, flags tickets that have sat in a
//! non-terminal phase longer than the phase's configured timeout, and
//! alerts when the active-worker ceiling is exceeded. Everything here is
//! informational — the Conductor publishes events, it never rewrites
//! task state. Stuck flags are deduplicated per phase entry through the
//! interventions table, so overlapping cycles report a stuck ticket once.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;

use super::MonitorConfig;
use crate::events::{self, EventBus, SystemEvent};
use crate::phases::registry::PhaseRegistry;
use crate::store::DbHandle;
use crate::store::models::InterventionKind;

/// Stuck flags expire after a week; a ticket still parked in the same
/// phase then gets flagged again.
const STUCK_FLAG_TTL_SECS: i64 = 7 * 86_400;

/// Snapshot produced by one Conductor cycle.
#[derive(Debug)]
pub struct ConductorReport {
    pub tasks_by_status: BTreeMap<String, i64>,
    pub active_workers: usize,
    pub active_tickets: usize,
    /// (ticket_id, phase_id) pairs flagged stuck this cycle.
    pub newly_stuck: Vec<(String, String)>,
    pub pruned_interventions: usize,
}

pub struct Conductor {
    db: DbHandle,
    registry: Arc<PhaseRegistry>,
    bus: Arc<EventBus>,
    max_active_workers: usize,
}

impl Conductor {
    pub fn new(
        db: DbHandle,
        registry: Arc<PhaseRegistry>,
        bus: Arc<EventBus>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            db,
            registry,
            bus,
            max_active_workers: config.max_active_workers,
        }
    }

    /// One aggregation pass.
    pub async fn run_once(&self) -> Result<ConductorReport> {
        let registry = self.registry.clone();

        let report = self
            .db
            .call(move |db| {
                let tasks_by_status = db.count_tasks_by_status()?;
                let active_workers = db.active_worker_refs()?.len();
                let tickets = db.active_tickets()?;
                let active_tickets = tickets.len();

                let now = Utc::now();
                let mut newly_stuck = Vec::new();
                for ticket in &tickets {
                    let Some(phase) = registry.get(&ticket.phase_id) else {
                        continue;
                    };
                    if phase.is_terminal {
                        continue;
                    }
                    let timeout = chrono::Duration::seconds(phase.config.timeout_secs as i64);
                    if now - ticket.phase_entered_at <= timeout {
                        continue;
                    }

                    // One flag per phase entry: an existing flag newer
                    // than the entry means this cycle stays quiet.
                    let already_flagged = db
                        .latest_intervention(InterventionKind::StuckFlag, &ticket.id)?
                        .map(|flag| flag.created_at > ticket.phase_entered_at)
                        .unwrap_or(false);
                    if already_flagged {
                        continue;
                    }

                    db.insert_intervention(
                        InterventionKind::StuckFlag,
                        &ticket.id,
                        Some(&format!(
                            "in phase {} since {}",
                            ticket.phase_id,
                            ticket.phase_entered_at.to_rfc3339()
                        )),
                        Some(now + chrono::Duration::seconds(STUCK_FLAG_TTL_SECS)),
                    )?;
                    newly_stuck.push((ticket.id.clone(), ticket.phase_id.clone()));
                }

                let pruned_interventions = db.prune_expired_interventions()?;

                Ok(ConductorReport {
                    tasks_by_status,
                    active_workers,
                    active_tickets,
                    newly_stuck,
                    pruned_interventions,
                })
            })
            .await?;

        for (ticket_id, phase_id) in &report.newly_stuck {
            tracing::warn!(ticket_id = %ticket_id, phase = %phase_id, "ticket stuck past phase timeout");
            self.bus.publish(SystemEvent::new(
                events::TICKET_STUCK,
                "ticket",
                ticket_id,
                json!({ "phase_id": phase_id }),
            ));
        }

        if self.max_active_workers > 0 && report.active_workers > self.max_active_workers {
            tracing::warn!(
                active = report.active_workers,
                ceiling = self.max_active_workers,
                "active workers over ceiling"
            );
            self.bus.publish(SystemEvent::new(
                events::MONITOR_ALERT,
                "monitor",
                "conductor",
                json!({
                    "alert": "active_workers_over_ceiling",
                    "active_workers": report.active_workers,
                    "ceiling": self.max_active_workers,
                    "tasks_by_status": &report.tasks_by_status,
                }),
            ));
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::registry::{PhaseConfig, PhaseDefinition};
    use crate::store::EngineDb;
    use crate::store::models::{Priority, TaskSpec, WorkerRef};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn zero_timeout_registry() -> PhaseRegistry {
        PhaseRegistry::new(vec![
            PhaseDefinition {
                id: "WORK".into(),
                sequence: 1,
                done_criteria: vec![],
                expected_outputs: vec![],
                transitions: vec!["END".into()],
                is_terminal: false,
                initial_tasks: vec![],
                config: PhaseConfig {
                    timeout_secs: 0,
                    ..PhaseConfig::default()
                },
            },
            PhaseDefinition {
                id: "END".into(),
                sequence: 2,
                done_criteria: vec![],
                expected_outputs: vec![],
                transitions: vec![],
                is_terminal: true,
                initial_tasks: vec![],
                config: PhaseConfig::default(),
            },
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_stuck_ticket_flagged_once_per_phase_entry() {
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let stuck_count = Arc::new(AtomicUsize::new(0));
        let counter = stuck_count.clone();
        bus.subscribe(events::TICKET_STUCK, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let conductor = Conductor::new(
            db.clone(),
            Arc::new(zero_timeout_registry()),
            bus,
            &MonitorConfig::default(),
        );

        {
            let guard = db.lock_sync().unwrap();
            guard
                .insert_ticket("t", "", "WORK", Priority::Medium, &serde_json::json!({}))
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let report = conductor.run_once().await.unwrap();
        assert_eq!(report.newly_stuck.len(), 1);
        assert_eq!(stuck_count.load(Ordering::SeqCst), 1);

        // A second overlapping cycle does not re-flag.
        let report = conductor.run_once().await.unwrap();
        assert!(report.newly_stuck.is_empty());
        assert_eq!(stuck_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_ceiling_alert() {
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let alerts = Arc::new(AtomicUsize::new(0));
        let counter = alerts.clone();
        bus.subscribe(events::MONITOR_ALERT, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let conductor = Conductor::new(
            db.clone(),
            Arc::new(PhaseRegistry::default_pipeline()),
            bus,
            &MonitorConfig {
                max_active_workers: 1,
                ..MonitorConfig::default()
            },
        );

        {
            let guard = db.lock_sync().unwrap();
            for i in 0..2 {
                let task = guard
                    .insert_task(&TaskSpec {
                        ticket_id: None,
                        phase_id: "IMPLEMENTATION".into(),
                        task_type: format!("implement_{}", i),
                        description: String::new(),
                        priority: Priority::Medium,
                        dependencies: vec![],
                        required_capabilities: vec![],
                    })
                    .unwrap();
                guard
                    .claim_task(&task.id, &WorkerRef::Ephemeral(format!("sbx-{}", i)))
                    .unwrap();
            }
        }

        let report = conductor.run_once().await.unwrap();
        assert_eq!(report.active_workers, 2);
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_counts_reflect_store() {
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        let conductor = Conductor::new(
            db.clone(),
            Arc::new(PhaseRegistry::default_pipeline()),
            Arc::new(EventBus::new()),
            &MonitorConfig::default(),
        );

        {
            let guard = db.lock_sync().unwrap();
            guard
                .insert_task(&TaskSpec {
                    ticket_id: None,
                    phase_id: "IMPLEMENTATION".into(),
                    task_type: "implement".into(),
                    description: String::new(),
                    priority: Priority::Medium,
                    dependencies: vec![],
                    required_capabilities: vec![],
                })
                .unwrap();
        }

        let report = conductor.run_once().await.unwrap();
        assert_eq!(report.tasks_by_status.get("pending"), Some(&1));
        assert_eq!(report.active_workers, 0);
        assert_eq!(report.active_tickets, 0);
    }
}
