//! Typed error hierarchy for the orchestration engine.
//!
//! Two top-level enums cover the two stateful subsystems:
//! - `QueueError` — task queue validation and transition failures
//! - `PhaseError` — phase progression and gate-adjacent failures
//!
//! Gate failures are deliberately NOT errors: a failed gate is a
//! first-class `GateEvaluation` result surfaced through events.

use thiserror::Error;

use crate::store::models::TaskStatus;

/// Errors from the task queue subsystem.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Task declares unknown dependency {dependency}")]
    UnknownDependency { dependency: String },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {id} exhausted its {max_retries} retries")]
    RetriesExhausted { id: String, max_retries: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the phase progression subsystem.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Ticket {id} not found")]
    TicketNotFound { id: String },

    #[error("Unknown phase {phase}")]
    UnknownPhase { phase: String },

    #[error("Phase {phase} is terminal and accepts no outgoing transitions")]
    TerminalPhase { phase: String },

    #[error(
        "Phase {phase} configures multiple transitions ({}) and the completing \
         task supplied no next_phase choice",
        .options.join(", ")
    )]
    AmbiguousTransition { phase: String, options: Vec<String> },

    #[error("Phase {phase} does not allow a transition to {target}")]
    TransitionNotAllowed { phase: String, target: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
