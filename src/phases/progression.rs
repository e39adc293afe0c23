//! Phase progression: the state machine over `Ticket.phase_id`.
//!
//! Two automation hooks drive the machine:
//! - Hook 1 (on task completion): when every task in the ticket's current
//!   phase is completed and the gate passes, advance the ticket.
//! - Hook 2 (on phase entry, including ticket creation): spawn the new
//!   phase's initial tasks, idempotently.
//!
//! Handlers never trust event payload snapshots; they re-read the store,
//! and the advance itself is a conditional update keyed on the expected
//! current phase, so duplicate or racing events cannot double-advance.

use std::sync::Arc;

use serde_json::json;

use crate::errors::PhaseError;
use crate::events::{self, EventBus, SystemEvent};
use crate::phases::gate::{GateEvaluation, evaluate_gate};
use crate::phases::registry::{InitialTask, PhaseDefinition, PhaseRegistry};
use crate::store::models::{Priority, Task, TaskSpec, TaskStatus, Ticket};
use crate::store::{DbHandle, EngineDb};

/// Result of an advancement attempt.
#[derive(Debug, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Not every task in the current phase is completed yet.
    NotReady,
    /// All tasks done but the gate blocked the transition.
    GateFailed { evaluation: GateEvaluation },
    /// Another writer advanced the ticket first (or the event was a
    /// duplicate); nothing was changed.
    Lost,
    /// The ticket moved to a new phase.
    Advanced { from: String, to: String },
}

pub struct PhaseProgressionService {
    db: DbHandle,
    registry: Arc<PhaseRegistry>,
    bus: Arc<EventBus>,
}

impl PhaseProgressionService {
    pub fn new(db: DbHandle, registry: Arc<PhaseRegistry>, bus: Arc<EventBus>) -> Self {
        Self { db, registry, bus }
    }

    /// Wire both hooks onto the bus. Handler errors are logged, never
    /// propagated into the publisher: a broken advance can always be
    /// re-derived from the store via the manual triggers.
    pub fn register_hooks(self: &Arc<Self>) {
        let hook1 = self.clone();
        self.bus.subscribe(events::TASK_COMPLETED, move |event| {
            hook1.handle_task_completed(event);
        });

        let hook2 = self.clone();
        self.bus
            .subscribe(events::TICKET_PHASE_TRANSITIONED, move |event| {
                hook2.handle_phase_entered(event);
            });

        let hook2_create = self.clone();
        self.bus.subscribe(events::TICKET_CREATED, move |event| {
            hook2_create.handle_phase_entered(event);
        });

        tracing::info!("phase progression hooks subscribed");
    }

    // ── Tickets ───────────────────────────────────────────────────────

    /// Create a ticket in the registry's initial phase. Publishing the
    /// creation event counts as entering that phase, so Hook 2 spawns
    /// the initial tasks.
    pub fn create_ticket(
        &self,
        title: &str,
        description: &str,
        priority: Priority,
        context: serde_json::Value,
    ) -> Result<Ticket, PhaseError> {
        let ticket = {
            let db = self.db.lock_sync().map_err(PhaseError::Other)?;
            db.insert_ticket(
                title,
                description,
                self.registry.initial_phase(),
                priority,
                &context,
            )?
        };

        tracing::info!(ticket_id = %ticket.id, phase = %ticket.phase_id, "ticket created");
        self.bus.publish(SystemEvent::new(
            events::TICKET_CREATED,
            "ticket",
            &ticket.id,
            json!({
                "title": ticket.title,
                "phase_id": ticket.phase_id,
                "priority": ticket.priority,
            }),
        ));
        Ok(ticket)
    }

    pub fn get_ticket(&self, ticket_id: &str) -> Result<Ticket, PhaseError> {
        let db = self.db.lock_sync().map_err(PhaseError::Other)?;
        db.get_ticket(ticket_id)?
            .ok_or_else(|| PhaseError::TicketNotFound {
                id: ticket_id.to_string(),
            })
    }

    /// Evaluate the ticket's gate against its current phase, read-only.
    pub fn gate_status(&self, ticket_id: &str) -> Result<GateEvaluation, PhaseError> {
        let db = self.db.lock_sync().map_err(PhaseError::Other)?;
        let ticket = db
            .get_ticket(ticket_id)?
            .ok_or_else(|| PhaseError::TicketNotFound {
                id: ticket_id.to_string(),
            })?;
        let phase = self
            .registry
            .get(&ticket.phase_id)
            .ok_or_else(|| PhaseError::UnknownPhase {
                phase: ticket.phase_id.clone(),
            })?;
        Ok(evaluate_gate(&db, &ticket, phase)?)
    }

    // ── Hook 1: auto-advance on completion ────────────────────────────

    fn handle_task_completed(&self, event: &SystemEvent) {
        let Some(ticket_id) = event.payload.get("ticket_id").and_then(|v| v.as_str()) else {
            // Standalone tasks have no phase machine to drive.
            return;
        };

        match self.advance(ticket_id) {
            Ok(AdvanceOutcome::Advanced { from, to }) => {
                tracing::info!(ticket_id, %from, %to, "ticket auto-advanced");
            }
            Ok(AdvanceOutcome::GateFailed { evaluation }) => {
                tracing::info!(
                    ticket_id,
                    missing = ?evaluation.missing,
                    "phase tasks complete but gate failed"
                );
            }
            Ok(AdvanceOutcome::NotReady) | Ok(AdvanceOutcome::Lost) => {}
            Err(PhaseError::TerminalPhase { .. }) => {}
            Err(err) => {
                tracing::error!(ticket_id, error = %err, "auto-advance failed");
            }
        }
    }

    /// Attempt to advance a ticket out of its current phase.
    ///
    /// Also serves as the manual/recovery trigger: it re-derives
    /// everything from the store, so a missed completion event can be
    /// repaired by calling this directly.
    pub fn advance(&self, ticket_id: &str) -> Result<AdvanceOutcome, PhaseError> {
        let (outcome, gate_failure) = {
            let db = self.db.lock_sync().map_err(PhaseError::Other)?;
            let ticket = db
                .get_ticket(ticket_id)?
                .ok_or_else(|| PhaseError::TicketNotFound {
                    id: ticket_id.to_string(),
                })?;
            let phase = self
                .registry
                .get(&ticket.phase_id)
                .ok_or_else(|| PhaseError::UnknownPhase {
                    phase: ticket.phase_id.clone(),
                })?;
            if phase.is_terminal {
                return Err(PhaseError::TerminalPhase {
                    phase: phase.id.clone(),
                });
            }

            // Re-read the full sibling set; the triggering event may be
            // stale relative to concurrent transitions.
            let tasks = db.tasks_for_ticket_phase(&ticket.id, &phase.id)?;
            if !tasks.iter().all(|t| t.status == TaskStatus::Completed) {
                (AdvanceOutcome::NotReady, None)
            } else {
                let eval = evaluate_gate(&db, &ticket, phase)?;
                if !eval.passed {
                    (
                        AdvanceOutcome::GateFailed {
                            evaluation: eval.clone(),
                        },
                        Some(eval),
                    )
                } else {
                    let next = resolve_next_phase(phase, &tasks)?;
                    if !db.advance_ticket_phase(&ticket.id, &phase.id, &next)? {
                        (AdvanceOutcome::Lost, None)
                    } else {
                        if self
                            .registry
                            .get(&next)
                            .map(|def| def.is_terminal)
                            .unwrap_or(false)
                        {
                            db.set_ticket_status(
                                &ticket.id,
                                crate::store::models::TicketStatus::Done,
                            )?;
                        }
                        (
                            AdvanceOutcome::Advanced {
                                from: phase.id.clone(),
                                to: next,
                            },
                            None,
                        )
                    }
                }
            }
        };

        match (&outcome, gate_failure) {
            (AdvanceOutcome::Advanced { from, to }, _) => {
                self.bus.publish(SystemEvent::new(
                    events::TICKET_PHASE_TRANSITIONED,
                    "ticket",
                    ticket_id,
                    json!({ "from_phase": from, "to_phase": to, "forced": false }),
                ));
            }
            (AdvanceOutcome::GateFailed { .. }, Some(eval)) => {
                self.bus.publish(SystemEvent::new(
                    events::GATE_FAILED,
                    "ticket",
                    ticket_id,
                    json!({
                        "phase_id": eval.phase_id,
                        "missing": eval.missing,
                        "evaluation": eval,
                    }),
                ));
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Administrative override: move a ticket to an explicit phase,
    /// bypassing the gate and the configured transitions. Terminal
    /// current phases still refuse, and the target must exist. Always
    /// logged with the supplied reason.
    pub fn force_advance(
        &self,
        ticket_id: &str,
        target_phase: &str,
        reason: &str,
    ) -> Result<Ticket, PhaseError> {
        let (ticket, from) = {
            let db = self.db.lock_sync().map_err(PhaseError::Other)?;
            let ticket = db
                .get_ticket(ticket_id)?
                .ok_or_else(|| PhaseError::TicketNotFound {
                    id: ticket_id.to_string(),
                })?;
            let phase = self
                .registry
                .get(&ticket.phase_id)
                .ok_or_else(|| PhaseError::UnknownPhase {
                    phase: ticket.phase_id.clone(),
                })?;
            if phase.is_terminal {
                return Err(PhaseError::TerminalPhase {
                    phase: phase.id.clone(),
                });
            }
            let target = self
                .registry
                .get(target_phase)
                .ok_or_else(|| PhaseError::UnknownPhase {
                    phase: target_phase.to_string(),
                })?;

            if !db.advance_ticket_phase(&ticket.id, &ticket.phase_id, &target.id)? {
                return Err(PhaseError::Other(anyhow::anyhow!(
                    "Ticket {} changed phase concurrently",
                    ticket_id
                )));
            }
            if target.is_terminal {
                db.set_ticket_status(&ticket.id, crate::store::models::TicketStatus::Done)?;
            }
            let from = ticket.phase_id.clone();
            let ticket = db
                .get_ticket(ticket_id)?
                .ok_or_else(|| PhaseError::TicketNotFound {
                    id: ticket_id.to_string(),
                })?;
            (ticket, from)
        };

        tracing::warn!(
            ticket_id,
            from = %from,
            to = %target_phase,
            reason,
            "ticket force-advanced"
        );
        self.bus.publish(SystemEvent::new(
            events::TICKET_PHASE_TRANSITIONED,
            "ticket",
            ticket_id,
            json!({
                "from_phase": from,
                "to_phase": target_phase,
                "forced": true,
                "reason": reason,
            }),
        ));
        Ok(ticket)
    }

    // ── Hook 2: auto-spawn on phase entry ─────────────────────────────

    fn handle_phase_entered(&self, event: &SystemEvent) {
        let ticket_id = event.entity_id.clone();
        let phase_id = event
            .payload
            .get("to_phase")
            .or_else(|| event.payload.get("phase_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let Some(phase_id) = phase_id else {
            return;
        };

        match self.spawn_phase_tasks(&ticket_id, &phase_id) {
            Ok(spawned) if spawned > 0 => {
                tracing::info!(ticket_id = %ticket_id, phase = %phase_id, spawned, "phase tasks spawned");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(ticket_id = %ticket_id, phase = %phase_id, error = %err, "task spawn failed");
            }
        }
    }

    /// Spawn the configured initial tasks plus any ticket-declared tasks
    /// for a (ticket, phase) pair.
    ///
    /// Idempotent by (ticket, phase, task_type): templates whose type
    /// already has a task in the pair are skipped, which makes duplicate
    /// phase-entry events harmless. Existence check and inserts happen
    /// under one store lock so concurrent deliveries cannot interleave.
    pub fn spawn_phase_tasks(&self, ticket_id: &str, phase_id: &str) -> Result<usize, PhaseError> {
        let created: Vec<Task> = {
            let db = self.db.lock_sync().map_err(PhaseError::Other)?;
            let Some(ticket) = db.get_ticket(ticket_id)? else {
                tracing::warn!(ticket_id, "ticket not found for task spawn");
                return Ok(0);
            };
            let Some(phase) = self.registry.get(phase_id) else {
                return Err(PhaseError::UnknownPhase {
                    phase: phase_id.to_string(),
                });
            };
            if phase.is_terminal {
                return Ok(0);
            }

            let mut templates = phase.initial_tasks.clone();
            templates.extend(declared_tasks(&ticket, phase_id));

            let mut created = Vec::new();
            let mut created_ids: std::collections::HashMap<String, String> =
                std::collections::HashMap::new();

            for template in templates {
                if db.task_exists_for(ticket_id, phase_id, &template.task_type)? {
                    continue;
                }
                let dependencies =
                    resolve_template_deps(&db, ticket_id, phase_id, &template, &created_ids)?;
                let task = db.insert_task(&TaskSpec {
                    ticket_id: Some(ticket_id.to_string()),
                    phase_id: phase_id.to_string(),
                    task_type: template.task_type.clone(),
                    description: template.description.clone(),
                    priority: template.priority,
                    dependencies,
                    required_capabilities: vec![],
                })?;
                created_ids.insert(template.task_type.clone(), task.id.clone());
                created.push(task);
            }
            created
        };

        for task in &created {
            self.bus.publish(SystemEvent::new(
                events::TASK_CREATED,
                "task",
                &task.id,
                json!({
                    "task_id": task.id,
                    "ticket_id": task.ticket_id,
                    "phase_id": task.phase_id,
                    "task_type": task.task_type,
                    "status": task.status,
                    "priority": task.priority,
                }),
            ));
        }
        Ok(created.len())
    }
}

/// Choose the next phase for an advancing ticket.
///
/// A single configured transition is taken as-is. With several, the
/// completing task must have named one via `result.next_phase`; a silent
/// multi-transition configuration is an error, not a guess.
fn resolve_next_phase(phase: &PhaseDefinition, tasks: &[Task]) -> Result<String, PhaseError> {
    match phase.transitions.as_slice() {
        [single] => Ok(single.clone()),
        [] => Err(PhaseError::AmbiguousTransition {
            phase: phase.id.clone(),
            options: vec![],
        }),
        options => {
            let choice = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .max_by_key(|t| t.completed_at)
                .and_then(|t| t.result.as_ref())
                .and_then(|r| r.get("next_phase"))
                .and_then(|v| v.as_str());

            match choice {
                Some(target) if options.iter().any(|o| o == target) => Ok(target.to_string()),
                Some(target) => Err(PhaseError::TransitionNotAllowed {
                    phase: phase.id.clone(),
                    target: target.to_string(),
                }),
                None => Err(PhaseError::AmbiguousTransition {
                    phase: phase.id.clone(),
                    options: options.to_vec(),
                }),
            }
        }
    }
}

/// Ticket-declared task templates for a phase, from
/// `context.planned_tasks[phase_id]` (seeded by an upstream planner).
fn declared_tasks(ticket: &Ticket, phase_id: &str) -> Vec<InitialTask> {
    let Some(entries) = ticket
        .context
        .get("planned_tasks")
        .and_then(|v| v.get(phase_id))
        .and_then(|v| v.as_array())
    else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| serde_json::from_value::<InitialTask>(entry.clone()).ok())
        .collect()
}

/// Resolve a template's `depends_on` task types to concrete task ids:
/// first tasks created earlier in this batch, then tasks already present
/// in the (ticket, phase) pair. Unresolvable references are skipped.
fn resolve_template_deps(
    db: &EngineDb,
    ticket_id: &str,
    phase_id: &str,
    template: &InitialTask,
    created_ids: &std::collections::HashMap<String, String>,
) -> Result<Vec<String>, PhaseError> {
    let mut deps = Vec::new();
    if template.depends_on.is_empty() {
        return Ok(deps);
    }
    let existing = db.tasks_for_ticket_phase(ticket_id, phase_id)?;
    for dep_type in &template.depends_on {
        if let Some(id) = created_ids.get(dep_type) {
            deps.push(id.clone());
        } else if let Some(task) = existing.iter().find(|t| &t.task_type == dep_type) {
            deps.push(task.id.clone());
        } else {
            tracing::warn!(
                ticket_id,
                phase = phase_id,
                task_type = %template.task_type,
                depends_on = %dep_type,
                "unresolvable task template dependency, skipping"
            );
        }
    }
    Ok(deps)
}
