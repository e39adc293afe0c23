use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used by the event-driven
    /// hook handlers and the monitor loops, which already run off the async
    /// hot path. Callers must not hold the guard across an await point.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, EngineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct EngineDb {
    conn: Connection,
}

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {}", raw))
}

fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_json_list(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON list in database: {}", raw))
}

/// SQL expression ranking priorities for claim ordering.
const PRIORITY_RANK_SQL: &str =
    "CASE priority WHEN 'critical' THEN 3 WHEN 'high' THEN 2 WHEN 'medium' THEN 1 ELSE 0 END";

const TASK_COLUMNS: &str = "id, ticket_id, phase_id, task_type, description, priority, status, \
     agent_id, sandbox_id, dependencies, required_capabilities, result, error_message, \
     retry_count, retry_not_before, last_heartbeat_at, escalated, created_at, started_at, \
     completed_at, updated_at";

const TICKET_COLUMNS: &str = "id, title, description, phase_id, status, priority, context, \
     phase_entered_at, created_at, updated_at";

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tickets (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    phase_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    context TEXT NOT NULL DEFAULT '{}',
                    phase_entered_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    ticket_id TEXT REFERENCES tickets(id),
                    phase_id TEXT NOT NULL,
                    task_type TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    status TEXT NOT NULL DEFAULT 'pending',
                    agent_id TEXT,
                    sandbox_id TEXT,
                    dependencies TEXT NOT NULL DEFAULT '[]',
                    required_capabilities TEXT NOT NULL DEFAULT '[]',
                    result TEXT,
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    retry_not_before TEXT,
                    last_heartbeat_at TEXT,
                    escalated INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    updated_at TEXT NOT NULL,
                    CHECK (agent_id IS NULL OR sandbox_id IS NULL)
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ticket_id TEXT NOT NULL REFERENCES tickets(id),
                    phase_id TEXT NOT NULL,
                    artifact_type TEXT NOT NULL,
                    path TEXT,
                    recorded_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS interventions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    target_id TEXT NOT NULL,
                    note TEXT,
                    created_at TEXT NOT NULL,
                    expires_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_ticket_phase ON tasks(ticket_id, phase_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_sandbox ON tasks(sandbox_id)
                    WHERE sandbox_id IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(agent_id)
                    WHERE agent_id IS NOT NULL;
                CREATE UNIQUE INDEX IF NOT EXISTS idx_artifacts_unique
                    ON artifacts(ticket_id, phase_id, artifact_type, IFNULL(path, ''));
                CREATE INDEX IF NOT EXISTS idx_interventions_target
                    ON interventions(kind, target_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    fn map_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
        Ok(TaskRow {
            id: row.get(0)?,
            ticket_id: row.get(1)?,
            phase_id: row.get(2)?,
            task_type: row.get(3)?,
            description: row.get(4)?,
            priority: row.get(5)?,
            status: row.get(6)?,
            agent_id: row.get(7)?,
            sandbox_id: row.get(8)?,
            dependencies: row.get(9)?,
            required_capabilities: row.get(10)?,
            result: row.get(11)?,
            error_message: row.get(12)?,
            retry_count: row.get(13)?,
            retry_not_before: row.get(14)?,
            last_heartbeat_at: row.get(15)?,
            escalated: row.get(16)?,
            created_at: row.get(17)?,
            started_at: row.get(18)?,
            completed_at: row.get(19)?,
            updated_at: row.get(20)?,
        })
    }

    fn map_ticket(row: &rusqlite::Row<'_>) -> rusqlite::Result<TicketRow> {
        Ok(TicketRow {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            phase_id: row.get(3)?,
            status: row.get(4)?,
            priority: row.get(5)?,
            context: row.get(6)?,
            phase_entered_at: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn query_tasks(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare query")?;
        let rows = stmt
            .query_map(params, Self::map_task)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    // ── Tickets ───────────────────────────────────────────────────────

    pub fn insert_ticket(
        &self,
        title: &str,
        description: &str,
        phase_id: &str,
        priority: Priority,
        context: &serde_json::Value,
    ) -> Result<Ticket> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        self.conn
            .execute(
                "INSERT INTO tickets (id, title, description, phase_id, status, priority, \
                 context, phase_entered_at, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, ?7, ?7)",
                params![
                    id,
                    title,
                    description,
                    phase_id,
                    priority.as_str(),
                    context.to_string(),
                    now
                ],
            )
            .context("Failed to insert ticket")?;
        self.get_ticket(&id)?
            .context("Ticket not found after insert")
    }

    pub fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tickets WHERE id = ?1", TICKET_COLUMNS),
                params![id],
                Self::map_ticket,
            )
            .optional()
            .context("Failed to query ticket")?;
        row.map(TicketRow::into_ticket).transpose()
    }

    /// Tickets not yet done, for the Conductor's stuck-phase sweep.
    pub fn active_tickets(&self) -> Result<Vec<Ticket>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM tickets WHERE status != 'done' ORDER BY created_at",
                TICKET_COLUMNS
            ))
            .context("Failed to prepare active_tickets")?;
        let rows = stmt
            .query_map([], Self::map_ticket)
            .context("Failed to query tickets")?;
        let mut tickets = Vec::new();
        for row in rows {
            tickets.push(row.context("Failed to read ticket row")?.into_ticket()?);
        }
        Ok(tickets)
    }

    /// Atomically move a ticket from `from_phase` to `to_phase`.
    ///
    /// The WHERE clause guards against concurrent advances and duplicate
    /// completion events: the update only applies while the ticket is
    /// still in the expected phase. Returns false if the guard failed.
    pub fn advance_ticket_phase(
        &self,
        ticket_id: &str,
        from_phase: &str,
        to_phase: &str,
    ) -> Result<bool> {
        let now = now_ts();
        let changed = self
            .conn
            .execute(
                "UPDATE tickets SET phase_id = ?3, phase_entered_at = ?4, updated_at = ?4 \
                 WHERE id = ?1 AND phase_id = ?2",
                params![ticket_id, from_phase, to_phase, now],
            )
            .context("Failed to advance ticket phase")?;
        Ok(changed > 0)
    }

    pub fn set_ticket_status(&self, ticket_id: &str, status: TicketStatus) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE tickets SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![ticket_id, status.as_str(), now_ts()],
            )
            .context("Failed to update ticket status")?;
        Ok(changed > 0)
    }

    /// Merge a JSON object into the ticket's context. Accumulation is
    /// monotonic: keys from `patch` overwrite, nothing is removed.
    pub fn merge_ticket_context(
        &self,
        ticket_id: &str,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT context FROM tickets WHERE id = ?1",
                params![ticket_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read ticket context")?;
        let Some(raw) = raw else {
            return Ok(());
        };

        let mut context: serde_json::Value =
            serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = context.as_object_mut() {
            for (key, value) in patch {
                obj.insert(key.clone(), value.clone());
            }
        }

        self.conn
            .execute(
                "UPDATE tickets SET context = ?2, updated_at = ?3 WHERE id = ?1",
                params![ticket_id, context.to_string(), now_ts()],
            )
            .context("Failed to write ticket context")?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn insert_task(&self, spec: &TaskSpec) -> Result<Task> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        self.conn
            .execute(
                "INSERT INTO tasks (id, ticket_id, phase_id, task_type, description, priority, \
                 status, dependencies, required_capabilities, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9, ?9)",
                params![
                    id,
                    spec.ticket_id,
                    spec.phase_id,
                    spec.task_type,
                    spec.description,
                    spec.priority.as_str(),
                    serde_json::to_string(&spec.dependencies)?,
                    serde_json::to_string(&spec.required_capabilities)?,
                    now
                ],
            )
            .context("Failed to insert task")?;
        self.get_task(&id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                Self::map_task,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn get_tasks_by_ids(&self, ids: &[String]) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.get_task(id)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    pub fn tasks_for_ticket(&self, ticket_id: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE ticket_id = ?1 ORDER BY created_at",
                TASK_COLUMNS
            ),
            &[&ticket_id],
        )
    }

    pub fn tasks_for_ticket_phase(&self, ticket_id: &str, phase_id: &str) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE ticket_id = ?1 AND phase_id = ?2 ORDER BY created_at",
                TASK_COLUMNS
            ),
            &[&ticket_id, &phase_id],
        )
    }

    /// Whether any task (in any status) exists for this triple. Hook 2's
    /// idempotency key.
    pub fn task_exists_for(&self, ticket_id: &str, phase_id: &str, task_type: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM tasks \
                 WHERE ticket_id = ?1 AND phase_id = ?2 AND task_type = ?3",
                params![ticket_id, phase_id, task_type],
                |row| row.get(0),
            )
            .context("Failed to count tasks for spawn dedup")?;
        Ok(count > 0)
    }

    /// Pending, unbound tasks whose retry barrier has elapsed, ordered by
    /// priority rank then age. Dependency and capability filtering happens
    /// in the queue service; the claim itself is a separate conditional
    /// update per candidate.
    pub fn claim_candidates(&self, phase_id: Option<&str>) -> Result<Vec<Task>> {
        let now = now_ts();
        let base = format!(
            "SELECT {} FROM tasks WHERE status = 'pending' \
             AND agent_id IS NULL AND sandbox_id IS NULL \
             AND (retry_not_before IS NULL OR retry_not_before <= ?1)",
            TASK_COLUMNS
        );
        let order = format!(" ORDER BY {} DESC, created_at", PRIORITY_RANK_SQL);
        match phase_id {
            Some(phase) => self.query_tasks(
                &format!("{} AND phase_id = ?2{}", base, order),
                &[&now, &phase],
            ),
            None => self.query_tasks(&format!("{}{}", base, order), &[&now]),
        }
    }

    /// Atomically claim a pending, unbound task for a worker. Exactly one
    /// concurrent caller can win this update.
    pub fn claim_task(&self, task_id: &str, worker: &WorkerRef) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'assigned', agent_id = ?2, sandbox_id = ?3, \
                 updated_at = ?4 \
                 WHERE id = ?1 AND status = 'pending' \
                 AND agent_id IS NULL AND sandbox_id IS NULL",
                params![task_id, worker.agent_id(), worker.sandbox_id(), now_ts()],
            )
            .context("Failed to claim task")?;
        Ok(changed > 0)
    }

    /// Single-statement guarded status transition. The update applies only
    /// while the task is in one of the expected predecessor statuses;
    /// start/completion stamps and the result payload ride along so the
    /// transition is one write.
    pub fn transition_task(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        result: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let now = now_ts();
        let from_list = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE tasks SET status = ?2, updated_at = ?3, \
             result = COALESCE(?4, result), \
             error_message = COALESCE(?5, error_message), \
             started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL \
                 THEN ?3 ELSE started_at END, \
             completed_at = CASE WHEN ?2 IN ('completed', 'failed') AND completed_at IS NULL \
                 THEN ?3 ELSE completed_at END \
             WHERE id = ?1 AND status IN ({})",
            from_list
        );
        let changed = self
            .conn
            .execute(
                &sql,
                params![
                    task_id,
                    to.as_str(),
                    now,
                    result.map(|r| r.to_string()),
                    error_message
                ],
            )
            .context("Failed to transition task")?;
        Ok(changed > 0)
    }

    /// Return a failed task to pending for another attempt, clearing the
    /// worker binding and error. Applies only while the task is failed.
    pub fn reset_task_for_retry(
        &self,
        task_id: &str,
        retry_not_before: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'pending', retry_count = retry_count + 1, \
                 agent_id = NULL, sandbox_id = NULL, error_message = NULL, \
                 last_heartbeat_at = NULL, retry_not_before = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND status = 'failed'",
                params![task_id, retry_not_before.map(|t| t.to_rfc3339()), now_ts()],
            )
            .context("Failed to reset task for retry")?;
        Ok(changed > 0)
    }

    /// Flag a task as terminally escalated. Returns true only for the
    /// first caller, so the escalation event fires once.
    pub fn mark_task_escalated(&self, task_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET escalated = 1, updated_at = ?2 \
                 WHERE id = ?1 AND escalated = 0",
                params![task_id, now_ts()],
            )
            .context("Failed to mark task escalated")?;
        Ok(changed > 0)
    }

    /// Stamp a liveness heartbeat. Only meaningful while a worker is bound.
    pub fn record_heartbeat(&self, task_id: &str) -> Result<bool> {
        let now = now_ts();
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET last_heartbeat_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND status IN ('assigned', 'running')",
                params![task_id, now],
            )
            .context("Failed to record heartbeat")?;
        Ok(changed > 0)
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at",
                TASK_COLUMNS
            ),
            &[&status.as_str()],
        )
    }

    /// Tasks with a bound worker (assigned or running) — the Guardian's
    /// scan set.
    pub fn in_flight_tasks(&self) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE status IN ('assigned', 'running') \
                 ORDER BY created_at",
                TASK_COLUMNS
            ),
            &[],
        )
    }

    pub fn in_flight_count_for_phase(&self, phase_id: &str) -> Result<u32> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM tasks \
                 WHERE phase_id = ?1 AND status IN ('assigned', 'running')",
                params![phase_id],
                |row| row.get(0),
            )
            .context("Failed to count in-flight tasks")?;
        Ok(count as u32)
    }

    /// Active task bound to a sandbox id, if any.
    pub fn task_for_sandbox(&self, sandbox_id: &str) -> Result<Option<Task>> {
        Ok(self
            .query_tasks(
                &format!(
                    "SELECT {} FROM tasks WHERE sandbox_id = ?1 \
                     AND status IN ('assigned', 'running') \
                     ORDER BY updated_at DESC LIMIT 1",
                    TASK_COLUMNS
                ),
                &[&sandbox_id],
            )?
            .into_iter()
            .next())
    }

    /// Most recent non-terminal task bound to a stable agent id, if any.
    pub fn latest_task_for_agent(&self, agent_id: &str) -> Result<Option<Task>> {
        Ok(self
            .query_tasks(
                &format!(
                    "SELECT {} FROM tasks WHERE agent_id = ?1 \
                     AND status NOT IN ('completed', 'failed') \
                     ORDER BY updated_at DESC LIMIT 1",
                    TASK_COLUMNS
                ),
                &[&agent_id],
            )?
            .into_iter()
            .next())
    }

    pub fn count_tasks_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .context("Failed to prepare status histogram")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query status histogram")?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row.context("Failed to read histogram row")?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    /// Distinct workers currently bound to an in-flight task.
    pub fn active_worker_refs(&self) -> Result<Vec<WorkerRef>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT agent_id, sandbox_id FROM tasks \
                 WHERE status IN ('assigned', 'running')",
            )
            .context("Failed to prepare active workers query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                ))
            })
            .context("Failed to query active workers")?;
        let mut refs = Vec::new();
        for row in rows {
            let (agent_id, sandbox_id) = row.context("Failed to read worker row")?;
            if let Some(worker) = WorkerRef::from_columns(agent_id, sandbox_id) {
                refs.push(worker);
            }
        }
        Ok(refs)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    /// Record an artifact for a (ticket, phase). Duplicate tuples are
    /// ignored so re-delivered completion events cannot double-record.
    pub fn record_artifact(
        &self,
        ticket_id: &str,
        phase_id: &str,
        artifact_type: &str,
        path: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO artifacts (ticket_id, phase_id, artifact_type, path, \
                 recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ticket_id, phase_id, artifact_type, path, now_ts()],
            )
            .context("Failed to record artifact")?;
        Ok(changed > 0)
    }

    pub fn artifacts_for(&self, ticket_id: &str, phase_id: &str) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, ticket_id, phase_id, artifact_type, path, recorded_at \
                 FROM artifacts WHERE ticket_id = ?1 AND phase_id = ?2 ORDER BY id",
            )
            .context("Failed to prepare artifacts query")?;
        let rows = stmt
            .query_map(params![ticket_id, phase_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            let (id, ticket_id, phase_id, artifact_type, path, recorded_at) =
                row.context("Failed to read artifact row")?;
            artifacts.push(Artifact {
                id,
                ticket_id,
                phase_id,
                artifact_type,
                path,
                recorded_at: parse_ts(&recorded_at)?,
            });
        }
        Ok(artifacts)
    }

    // ── Interventions ─────────────────────────────────────────────────

    pub fn insert_intervention(
        &self,
        kind: InterventionKind,
        target_id: &str,
        note: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO interventions (kind, target_id, note, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    kind.as_str(),
                    target_id,
                    note,
                    now_ts(),
                    expires_at.map(|t| t.to_rfc3339())
                ],
            )
            .context("Failed to insert intervention")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn latest_intervention(
        &self,
        kind: InterventionKind,
        target_id: &str,
    ) -> Result<Option<Intervention>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, kind, target_id, note, created_at, expires_at FROM interventions \
                 WHERE kind = ?1 AND target_id = ?2 ORDER BY id DESC LIMIT 1",
                params![kind.as_str(), target_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query intervention")?;

        row.map(|(id, kind, target_id, note, created_at, expires_at)| {
            Ok(Intervention {
                id,
                kind: InterventionKind::from_str(&kind)
                    .map_err(|e| anyhow::anyhow!(e))?,
                target_id,
                note,
                created_at: parse_ts(&created_at)?,
                expires_at: parse_ts_opt(expires_at)?,
            })
        })
        .transpose()
    }

    pub fn clear_interventions_for(&self, target_id: &str) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM interventions WHERE target_id = ?1",
                params![target_id],
            )
            .context("Failed to clear interventions")?;
        Ok(removed)
    }

    pub fn prune_expired_interventions(&self) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM interventions WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_ts()],
            )
            .context("Failed to prune interventions")?;
        Ok(removed)
    }
}

// ── Raw row types ─────────────────────────────────────────────────────

struct TaskRow {
    id: String,
    ticket_id: Option<String>,
    phase_id: String,
    task_type: String,
    description: String,
    priority: String,
    status: String,
    agent_id: Option<String>,
    sandbox_id: Option<String>,
    dependencies: String,
    required_capabilities: String,
    result: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
    retry_not_before: Option<String>,
    last_heartbeat_at: Option<String>,
    escalated: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            worker: WorkerRef::from_columns(self.agent_id, self.sandbox_id),
            id: self.id,
            ticket_id: self.ticket_id,
            phase_id: self.phase_id,
            task_type: self.task_type,
            description: self.description,
            priority: Priority::from_str(&self.priority).map_err(|e| anyhow::anyhow!(e))?,
            status: TaskStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            dependencies: parse_json_list(&self.dependencies)?,
            required_capabilities: parse_json_list(&self.required_capabilities)?,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Invalid task result JSON")?,
            error_message: self.error_message,
            retry_count: self.retry_count as u32,
            retry_not_before: parse_ts_opt(self.retry_not_before)?,
            last_heartbeat_at: parse_ts_opt(self.last_heartbeat_at)?,
            escalated: self.escalated != 0,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_ts_opt(self.started_at)?,
            completed_at: parse_ts_opt(self.completed_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct TicketRow {
    id: String,
    title: String,
    description: String,
    phase_id: String,
    status: String,
    priority: String,
    context: String,
    phase_entered_at: String,
    created_at: String,
    updated_at: String,
}

impl TicketRow {
    fn into_ticket(self) -> Result<Ticket> {
        Ok(Ticket {
            id: self.id,
            title: self.title,
            description: self.description,
            phase_id: self.phase_id,
            status: TicketStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            priority: Priority::from_str(&self.priority).map_err(|e| anyhow::anyhow!(e))?,
            context: serde_json::from_str(&self.context).context("Invalid ticket context JSON")?,
            phase_entered_at: parse_ts(&self.phase_entered_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}
