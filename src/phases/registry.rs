//! Phase definitions and registry loading.
//!
//! Phase behavior is expressed entirely as data: completion criteria,
//! expected output patterns, allowed transitions, and retry/timeout
//! configuration live in `PhaseDefinition` records keyed by id in an
//! immutable registry loaded once at process start. A built-in default
//! pipeline is used when no TOML file is supplied.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::store::models::Priority;

/// Backoff strategy applied between retries of a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry immediately.
    #[default]
    None,
    /// Delay grows linearly with the retry count.
    Linear,
    /// Delay doubles with each retry.
    Exponential,
}

impl RetryStrategy {
    /// Compute the delay in seconds before the given retry may be claimed.
    /// `retry_count` is the count AFTER the increment for this retry.
    pub fn delay_secs(&self, retry_count: u32, base_delay_secs: u64) -> u64 {
        match self {
            Self::None => 0,
            Self::Linear => base_delay_secs * u64::from(retry_count),
            Self::Exponential => base_delay_secs.saturating_mul(1u64 << retry_count.min(16)),
        }
    }
}

/// Per-phase operational limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Tickets sitting in this phase longer than this are flagged stuck.
    pub timeout_secs: u64,
    /// Retries allowed per task before terminal escalation.
    pub max_retries: u32,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,
    /// Max tasks of this phase concurrently in flight; 0 = unlimited.
    #[serde(default)]
    pub wip_limit: u32,
}

fn default_retry_base_delay() -> u64 {
    30
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 86_400,
            max_retries: 3,
            retry_strategy: RetryStrategy::Exponential,
            retry_base_delay_secs: default_retry_base_delay(),
            wip_limit: 0,
        }
    }
}

/// An output pattern the gate expects for a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedOutput {
    /// Glob matched against recorded artifact types and paths.
    pub pattern: String,
    /// Required patterns block the gate; optional misses are recorded only.
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// Template for a task spawned automatically on phase entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialTask {
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Task types within the same spawn batch this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A single stage in the ticket lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: String,
    /// Position in the nominal pipeline order, for display.
    pub sequence: u32,
    /// Named completion predicates checked against ticket context and
    /// completed task results.
    #[serde(default)]
    pub done_criteria: Vec<String>,
    #[serde(default)]
    pub expected_outputs: Vec<ExpectedOutput>,
    /// Phase ids a ticket may advance to from here.
    #[serde(default)]
    pub transitions: Vec<String>,
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(default)]
    pub initial_tasks: Vec<InitialTask>,
    #[serde(default)]
    pub config: PhaseConfig,
}

/// TOML file shape: a list of `[[phase]]` tables.
#[derive(Debug, Deserialize)]
struct PhasesFile {
    #[serde(rename = "phase")]
    phases: Vec<PhaseDefinition>,
}

/// Immutable lookup of phase definitions, loaded at startup.
#[derive(Debug, Clone)]
pub struct PhaseRegistry {
    phases: HashMap<String, PhaseDefinition>,
    initial_phase: String,
}

impl PhaseRegistry {
    /// Build a registry from explicit definitions, validating the graph.
    pub fn new(defs: Vec<PhaseDefinition>) -> Result<Self> {
        if defs.is_empty() {
            bail!("Phase registry requires at least one phase");
        }

        let mut phases = HashMap::new();
        for def in defs {
            if phases.insert(def.id.clone(), def).is_some() {
                bail!("Duplicate phase id in registry");
            }
        }

        for def in phases.values() {
            if def.is_terminal && !def.transitions.is_empty() {
                bail!(
                    "Terminal phase {} must not declare outgoing transitions",
                    def.id
                );
            }
            for target in &def.transitions {
                if !phases.contains_key(target) {
                    bail!("Phase {} transitions to unknown phase {}", def.id, target);
                }
            }
        }

        let initial_phase = phases
            .values()
            .min_by_key(|d| d.sequence)
            .map(|d| d.id.clone())
            .context("Phase registry has no initial phase")?;

        Ok(Self {
            phases,
            initial_phase,
        })
    }

    /// Load a registry from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phase file at {}", path.display()))?;
        let file: PhasesFile = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse phase file at {}", path.display()))?;
        Self::new(file.phases)
    }

    /// The built-in pipeline used when no phase file is configured:
    /// REQUIREMENTS -> DESIGN -> IMPLEMENTATION -> TESTING -> DEPLOYMENT -> DONE.
    pub fn default_pipeline() -> Self {
        let defs = vec![
            PhaseDefinition {
                id: "REQUIREMENTS".into(),
                sequence: 1,
                done_criteria: vec!["requirements_approved".into()],
                expected_outputs: vec![ExpectedOutput {
                    pattern: "requirements_document".into(),
                    required: true,
                }],
                transitions: vec!["DESIGN".into()],
                is_terminal: false,
                initial_tasks: vec![InitialTask {
                    task_type: "generate_prd".into(),
                    description: "Generate the requirements document for this ticket".into(),
                    priority: Priority::Critical,
                    depends_on: vec![],
                }],
                config: PhaseConfig {
                    timeout_secs: 14_400,
                    ..PhaseConfig::default()
                },
            },
            PhaseDefinition {
                id: "DESIGN".into(),
                sequence: 2,
                done_criteria: vec!["design_approved".into()],
                expected_outputs: vec![ExpectedOutput {
                    pattern: "design_document".into(),
                    required: true,
                }],
                transitions: vec!["IMPLEMENTATION".into()],
                is_terminal: false,
                initial_tasks: vec![InitialTask {
                    task_type: "create_design".into(),
                    description: "Produce the design document and technical approach".into(),
                    priority: Priority::High,
                    depends_on: vec![],
                }],
                config: PhaseConfig::default(),
            },
            PhaseDefinition {
                id: "IMPLEMENTATION".into(),
                sequence: 3,
                done_criteria: vec!["tests_passing".into()],
                expected_outputs: vec![
                    ExpectedOutput {
                        pattern: "code_changes".into(),
                        required: true,
                    },
                    ExpectedOutput {
                        pattern: "test_coverage".into(),
                        required: false,
                    },
                ],
                transitions: vec!["TESTING".into()],
                is_terminal: false,
                initial_tasks: vec![InitialTask {
                    task_type: "implement_feature".into(),
                    description: "Implement the feature according to the design".into(),
                    priority: Priority::High,
                    depends_on: vec![],
                }],
                config: PhaseConfig::default(),
            },
            PhaseDefinition {
                id: "TESTING".into(),
                sequence: 4,
                done_criteria: vec!["tests_passing".into()],
                expected_outputs: vec![ExpectedOutput {
                    pattern: "test_results".into(),
                    required: true,
                }],
                transitions: vec!["DEPLOYMENT".into()],
                is_terminal: false,
                initial_tasks: vec![InitialTask {
                    task_type: "run_tests".into(),
                    description: "Run the test suite and record evidence".into(),
                    priority: Priority::High,
                    depends_on: vec![],
                }],
                config: PhaseConfig {
                    timeout_secs: 7_200,
                    ..PhaseConfig::default()
                },
            },
            PhaseDefinition {
                id: "DEPLOYMENT".into(),
                sequence: 5,
                done_criteria: vec![],
                expected_outputs: vec![],
                transitions: vec!["DONE".into()],
                is_terminal: false,
                initial_tasks: vec![InitialTask {
                    task_type: "deploy".into(),
                    description: "Deploy the implementation to the target environment".into(),
                    priority: Priority::High,
                    depends_on: vec![],
                }],
                config: PhaseConfig {
                    timeout_secs: 3_600,
                    max_retries: 1,
                    retry_strategy: RetryStrategy::Linear,
                    ..PhaseConfig::default()
                },
            },
            PhaseDefinition {
                id: "DONE".into(),
                sequence: 6,
                done_criteria: vec![],
                expected_outputs: vec![],
                transitions: vec![],
                is_terminal: true,
                initial_tasks: vec![],
                config: PhaseConfig::default(),
            },
        ];

        Self::new(defs).expect("built-in pipeline is valid")
    }

    pub fn get(&self, phase_id: &str) -> Option<&PhaseDefinition> {
        self.phases.get(phase_id)
    }

    pub fn contains(&self, phase_id: &str) -> bool {
        self.phases.contains_key(phase_id)
    }

    /// Phase a freshly created ticket enters.
    pub fn initial_phase(&self) -> &str {
        &self.initial_phase
    }

    /// All phases in pipeline order.
    pub fn ordered(&self) -> Vec<&PhaseDefinition> {
        let mut all: Vec<_> = self.phases.values().collect();
        all.sort_by_key(|d| d.sequence);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pipeline_shape() {
        let registry = PhaseRegistry::default_pipeline();
        assert_eq!(registry.initial_phase(), "REQUIREMENTS");

        let ordered = registry.ordered();
        assert_eq!(ordered.len(), 6);
        assert_eq!(ordered[0].id, "REQUIREMENTS");
        assert_eq!(ordered[5].id, "DONE");
        assert!(ordered[5].is_terminal);
        assert!(ordered[5].transitions.is_empty());
    }

    #[test]
    fn test_rejects_transition_to_unknown_phase() {
        let defs = vec![PhaseDefinition {
            id: "A".into(),
            sequence: 1,
            done_criteria: vec![],
            expected_outputs: vec![],
            transitions: vec!["MISSING".into()],
            is_terminal: false,
            initial_tasks: vec![],
            config: PhaseConfig::default(),
        }];
        assert!(PhaseRegistry::new(defs).is_err());
    }

    #[test]
    fn test_rejects_terminal_phase_with_transitions() {
        let defs = vec![
            PhaseDefinition {
                id: "A".into(),
                sequence: 1,
                done_criteria: vec![],
                expected_outputs: vec![],
                transitions: vec![],
                is_terminal: false,
                initial_tasks: vec![],
                config: PhaseConfig::default(),
            },
            PhaseDefinition {
                id: "END".into(),
                sequence: 2,
                done_criteria: vec![],
                expected_outputs: vec![],
                transitions: vec!["A".into()],
                is_terminal: true,
                initial_tasks: vec![],
                config: PhaseConfig::default(),
            },
        ];
        assert!(PhaseRegistry::new(defs).is_err());
    }

    #[test]
    fn test_retry_strategy_delays() {
        assert_eq!(RetryStrategy::None.delay_secs(3, 30), 0);
        assert_eq!(RetryStrategy::Linear.delay_secs(3, 30), 90);
        assert_eq!(RetryStrategy::Exponential.delay_secs(1, 30), 60);
        assert_eq!(RetryStrategy::Exponential.delay_secs(3, 30), 240);
    }

    #[test]
    fn test_parse_toml_phase_file() {
        let raw = r#"
            [[phase]]
            id = "BUILD"
            sequence = 1
            done_criteria = ["artifact_ready"]
            transitions = ["SHIP"]

            [[phase.expected_outputs]]
            pattern = "bundle/*"

            [[phase.initial_tasks]]
            task_type = "build"
            description = "Build the bundle"
            priority = "high"

            [phase.config]
            timeout_secs = 600
            max_retries = 2
            retry_strategy = "linear"

            [[phase]]
            id = "SHIP"
            sequence = 2
            is_terminal = true
        "#;
        let file: PhasesFile = toml::from_str(raw).unwrap();
        let registry = PhaseRegistry::new(file.phases).unwrap();

        let build = registry.get("BUILD").unwrap();
        assert_eq!(build.config.timeout_secs, 600);
        assert_eq!(build.config.retry_strategy, RetryStrategy::Linear);
        assert!(build.expected_outputs[0].required);
        assert_eq!(build.initial_tasks[0].priority, Priority::High);
        assert!(registry.get("SHIP").unwrap().is_terminal);
        assert_eq!(registry.initial_phase(), "BUILD");
    }
}
