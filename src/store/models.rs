use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task in the queue lifecycle.
///
/// The only legal forward path is pending -> assigned -> running ->
/// {completed, failed}. A retry moves failed back to pending; blocked is
/// entered from pending when a dependency has terminally failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    /// Terminal statuses accept no further transitions other than retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses in which a worker is bound and expected to heartbeat.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Coarse ticket lifecycle flag, independent of the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Active,
    Blocked,
    Done,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid ticket status: {}", s)),
        }
    }
}

/// Task priority, used to order claim candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Numeric rank for claim ordering; higher claims first.
    pub fn rank(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Identity of the worker bound to a task.
///
/// Two identification schemes coexist while workers migrate from
/// long-lived registered agents to throwaway execution sandboxes. The
/// variant makes the scheme explicit instead of spreading "try one
/// column, then the other" logic across callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum WorkerRef {
    /// Stable, registered agent identity.
    Stable(String),
    /// Transient sandbox identity; gone when the sandbox is reaped.
    Ephemeral(String),
}

impl WorkerRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Stable(id) | Self::Ephemeral(id) => id,
        }
    }

    /// Value for the stable agent column, if any.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Stable(id) => Some(id),
            Self::Ephemeral(_) => None,
        }
    }

    /// Value for the sandbox column, if any.
    pub fn sandbox_id(&self) -> Option<&str> {
        match self {
            Self::Ephemeral(id) => Some(id),
            Self::Stable(_) => None,
        }
    }

    /// Reconstruct from the two nullable columns. At most one may be set.
    pub fn from_columns(agent_id: Option<String>, sandbox_id: Option<String>) -> Option<Self> {
        match (agent_id, sandbox_id) {
            (None, Some(id)) => Some(Self::Ephemeral(id)),
            (Some(id), None) => Some(Self::Stable(id)),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable(id) => write!(f, "agent:{}", id),
            Self::Ephemeral(id) => write!(f, "sandbox:{}", id),
        }
    }
}

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub ticket_id: Option<String>,
    pub phase_id: String,
    pub task_type: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub worker: Option<WorkerRef>,
    pub dependencies: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub retry_not_before: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub escalated: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Most recent liveness signal for staleness checks: last heartbeat,
    /// else start time, else last state change.
    pub fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_heartbeat_at
            .or(self.started_at)
            .unwrap_or(self.updated_at)
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub ticket_id: Option<String>,
    pub phase_id: String,
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

/// The work item that moves through phases end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    pub phase_id: String,
    pub status: TicketStatus,
    pub priority: Priority,
    /// Key/value state accumulated by completing tasks; read by gate
    /// validation and by Hook 2 for ticket-declared task templates.
    pub context: serde_json::Value,
    pub phase_entered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An output recorded for a (ticket, phase) pair when a task completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub ticket_id: String,
    pub phase_id: String,
    pub artifact_type: String,
    pub path: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Kind of monitoring intervention recorded against a task or ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    /// Non-destructive wake-up message sent to a worker.
    Nudge,
    /// Ticket flagged as stuck in a phase past its timeout.
    StuckFlag,
}

impl InterventionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nudge => "nudge",
            Self::StuckFlag => "stuck_flag",
        }
    }
}

impl FromStr for InterventionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nudge" => Ok(Self::Nudge),
            "stuck_flag" => Ok(Self::StuckFlag),
            _ => Err(format!("Invalid intervention kind: {}", s)),
        }
    }
}

/// Durable record of a monitoring intervention.
///
/// Interventions live in the store rather than in loop memory so that
/// overlapping monitor cycles and process restarts cannot double-act.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub id: i64,
    pub kind: InterventionKind,
    pub target_id: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}
