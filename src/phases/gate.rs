//! Gate validation: the pass/fail check run before a phase transition.
//!
//! A gate failure is a result, not an error. The evaluation reports the
//! precise missing requirements so a human or an upstream planner can
//! address the gap without guessing.

use anyhow::Result;
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::phases::registry::PhaseDefinition;
use crate::store::EngineDb;
use crate::store::models::{TaskStatus, Ticket};

/// Outcome of one `done_criteria` predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub name: String,
    pub passed: bool,
}

/// Outcome of one `expected_outputs` pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputResult {
    pub pattern: String,
    pub required: bool,
    pub matched: usize,
}

/// Result of checking a ticket against its current phase definition.
/// Derived on demand, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateEvaluation {
    pub ticket_id: String,
    pub phase_id: String,
    pub criteria: Vec<CriterionResult>,
    pub outputs: Vec<OutputResult>,
    pub passed: bool,
    /// Criteria names and artifact patterns that block the transition.
    pub missing: Vec<String>,
}

/// A criterion counts as satisfied when the flag is present and not
/// explicitly false/empty.
fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(_) => true,
    }
}

/// Check a ticket against a phase definition.
///
/// Criteria are evaluated against the ticket context and against the
/// top-level keys of every completed sibling task result; output
/// patterns are glob-matched against the artifacts recorded for the
/// (ticket, phase) pair. Optional pattern misses are recorded but never
/// block the gate.
pub fn evaluate_gate(
    db: &EngineDb,
    ticket: &Ticket,
    phase: &PhaseDefinition,
) -> Result<GateEvaluation> {
    let tasks = db.tasks_for_ticket_phase(&ticket.id, &phase.id)?;
    let completed_results: Vec<&serde_json::Value> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .filter_map(|t| t.result.as_ref())
        .collect();

    let mut criteria = Vec::with_capacity(phase.done_criteria.len());
    let mut missing = Vec::new();

    for name in &phase.done_criteria {
        let in_context = ticket.context.get(name).map(is_truthy).unwrap_or(false);
        let in_results = completed_results
            .iter()
            .any(|result| result.get(name).map(is_truthy).unwrap_or(false));
        let passed = in_context || in_results;
        if !passed {
            missing.push(name.clone());
        }
        criteria.push(CriterionResult {
            name: name.clone(),
            passed,
        });
    }

    let artifacts = db.artifacts_for(&ticket.id, &phase.id)?;
    let mut outputs = Vec::with_capacity(phase.expected_outputs.len());

    for expected in &phase.expected_outputs {
        let matched = match Pattern::new(&expected.pattern) {
            Ok(pattern) => artifacts
                .iter()
                .filter(|a| {
                    pattern.matches(&a.artifact_type)
                        || a.path.as_deref().map(|p| pattern.matches(p)).unwrap_or(false)
                })
                .count(),
            // An unparsable pattern degrades to an exact comparison.
            Err(_) => artifacts
                .iter()
                .filter(|a| {
                    a.artifact_type == expected.pattern
                        || a.path.as_deref() == Some(expected.pattern.as_str())
                })
                .count(),
        };
        if expected.required && matched == 0 {
            missing.push(expected.pattern.clone());
        }
        outputs.push(OutputResult {
            pattern: expected.pattern.clone(),
            required: expected.required,
            matched,
        });
    }

    Ok(GateEvaluation {
        ticket_id: ticket.id.clone(),
        phase_id: phase.id.clone(),
        criteria,
        outputs,
        passed: missing.is_empty(),
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::registry::{ExpectedOutput, PhaseConfig, PhaseRegistry};
    use crate::store::models::{Priority, TaskSpec, WorkerRef};

    fn setup() -> (EngineDb, Ticket) {
        let db = EngineDb::new_in_memory().unwrap();
        let ticket = db
            .insert_ticket(
                "t",
                "",
                "REQUIREMENTS",
                Priority::Medium,
                &serde_json::json!({}),
            )
            .unwrap();
        (db, ticket)
    }

    fn phase_def(id: &str) -> PhaseDefinition {
        PhaseRegistry::default_pipeline().get(id).unwrap().clone()
    }

    fn complete_task_with(db: &EngineDb, ticket: &Ticket, phase: &str, result: serde_json::Value) {
        let task = db
            .insert_task(&TaskSpec {
                ticket_id: Some(ticket.id.clone()),
                phase_id: phase.into(),
                task_type: "work".into(),
                description: String::new(),
                priority: Priority::Medium,
                dependencies: vec![],
                required_capabilities: vec![],
            })
            .unwrap();
        db.claim_task(&task.id, &WorkerRef::Ephemeral("sbx".into()))
            .unwrap();
        db.transition_task(&task.id, &[TaskStatus::Assigned], TaskStatus::Running, None, None)
            .unwrap();
        db.transition_task(
            &task.id,
            &[TaskStatus::Running],
            TaskStatus::Completed,
            Some(&result),
            None,
        )
        .unwrap();
    }

    #[test]
    fn test_missing_criterion_fails_gate() {
        let (db, ticket) = setup();
        let phase = phase_def("REQUIREMENTS");
        complete_task_with(&db, &ticket, "REQUIREMENTS", serde_json::json!({}));

        let eval = evaluate_gate(&db, &ticket, &phase).unwrap();
        assert!(!eval.passed);
        assert!(eval.missing.contains(&"requirements_approved".to_string()));
        assert!(eval.missing.contains(&"requirements_document".to_string()));
    }

    #[test]
    fn test_criterion_from_task_result() {
        let (db, ticket) = setup();
        let phase = phase_def("REQUIREMENTS");
        complete_task_with(
            &db,
            &ticket,
            "REQUIREMENTS",
            serde_json::json!({"requirements_approved": true}),
        );
        db.record_artifact(&ticket.id, "REQUIREMENTS", "requirements_document", Some("prd.md"))
            .unwrap();

        let eval = evaluate_gate(&db, &ticket, &phase).unwrap();
        assert!(eval.passed, "missing: {:?}", eval.missing);
    }

    #[test]
    fn test_criterion_from_ticket_context() {
        let (db, ticket) = setup();
        let phase = phase_def("REQUIREMENTS");
        db.merge_ticket_context(
            &ticket.id,
            serde_json::json!({"requirements_approved": true})
                .as_object()
                .unwrap(),
        )
        .unwrap();
        db.record_artifact(&ticket.id, "REQUIREMENTS", "requirements_document", None)
            .unwrap();

        let ticket = db.get_ticket(&ticket.id).unwrap().unwrap();
        let eval = evaluate_gate(&db, &ticket, &phase).unwrap();
        assert!(eval.passed);
    }

    #[test]
    fn test_optional_output_does_not_block() {
        let (db, ticket) = setup();
        // IMPLEMENTATION requires code_changes, test_coverage is optional.
        let phase = phase_def("IMPLEMENTATION");
        db.merge_ticket_context(
            &ticket.id,
            serde_json::json!({"tests_passing": true}).as_object().unwrap(),
        )
        .unwrap();
        db.record_artifact(&ticket.id, "IMPLEMENTATION", "code_changes", Some("src/lib.rs"))
            .unwrap();

        let ticket = db.get_ticket(&ticket.id).unwrap().unwrap();
        let eval = evaluate_gate(&db, &ticket, &phase).unwrap();
        assert!(eval.passed);

        let coverage = eval
            .outputs
            .iter()
            .find(|o| o.pattern == "test_coverage")
            .unwrap();
        assert_eq!(coverage.matched, 0);
        assert!(!coverage.required);
    }

    #[test]
    fn test_glob_pattern_matches_paths() {
        let (db, ticket) = setup();
        let phase = PhaseDefinition {
            id: "REQUIREMENTS".into(),
            sequence: 1,
            done_criteria: vec![],
            expected_outputs: vec![ExpectedOutput {
                pattern: "docs/*.md".into(),
                required: true,
            }],
            transitions: vec![],
            is_terminal: false,
            initial_tasks: vec![],
            config: PhaseConfig::default(),
        };
        db.record_artifact(&ticket.id, "REQUIREMENTS", "document", Some("docs/prd.md"))
            .unwrap();

        let eval = evaluate_gate(&db, &ticket, &phase).unwrap();
        assert!(eval.passed);
        assert_eq!(eval.outputs[0].matched, 1);
    }

    #[test]
    fn test_false_flag_is_not_satisfied() {
        let (db, ticket) = setup();
        let phase = phase_def("TESTING");
        complete_task_with(
            &db,
            &ticket,
            "TESTING",
            serde_json::json!({"tests_passing": false}),
        );
        db.record_artifact(&ticket.id, "TESTING", "test_results", None)
            .unwrap();

        let eval = evaluate_gate(&db, &ticket, &phase).unwrap();
        assert!(!eval.passed);
        assert_eq!(eval.missing, vec!["tests_passing".to_string()]);
    }
}
