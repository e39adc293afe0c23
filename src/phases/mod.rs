//! Phase state machine: definitions, gate validation, and progression.

pub mod gate;
pub mod progression;
pub mod registry;

pub use gate::{GateEvaluation, evaluate_gate};
pub use progression::{AdvanceOutcome, PhaseProgressionService};
pub use registry::{PhaseDefinition, PhaseRegistry};
