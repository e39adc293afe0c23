//! Worker identity resolution.
//!
//! Two worker-identification schemes coexist while execution migrates
//! from registered long-lived agents to throwaway sandboxes. Callers
//! hand us an opaque identifier; we try it as a sandbox binding first
//! (the canonical scheme) and fall back to the most recent non-terminal
//! task bound to it as a stable agent id. `None` means "unknown", never
//! an error.

use anyhow::Result;

use crate::store::DbHandle;
use crate::store::models::Task;

pub struct WorkerResolver {
    db: DbHandle,
}

impl WorkerResolver {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Map an opaque worker identifier to its currently bound task.
    pub fn resolve_current_task(&self, worker_ref: &str) -> Result<Option<Task>> {
        let db = self.db.lock_sync()?;

        if let Some(task) = db.task_for_sandbox(worker_ref)? {
            return Ok(Some(task));
        }
        db.latest_task_for_agent(worker_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EngineDb;
    use crate::store::models::{Priority, TaskSpec, TaskStatus, WorkerRef};

    fn handle() -> DbHandle {
        DbHandle::new(EngineDb::new_in_memory().unwrap())
    }

    fn insert_claimed(db: &DbHandle, task_type: &str, worker: WorkerRef) -> Task {
        let guard = db.lock_sync().unwrap();
        let task = guard
            .insert_task(&TaskSpec {
                ticket_id: None,
                phase_id: "IMPLEMENTATION".into(),
                task_type: task_type.into(),
                description: String::new(),
                priority: Priority::Medium,
                dependencies: vec![],
                required_capabilities: vec![],
            })
            .unwrap();
        guard.claim_task(&task.id, &worker).unwrap();
        guard.get_task(&task.id).unwrap().unwrap()
    }

    #[test]
    fn test_sandbox_id_resolves_directly() {
        let db = handle();
        let task = insert_claimed(&db, "implement", WorkerRef::Ephemeral("sbx-1".into()));

        let resolver = WorkerResolver::new(db);
        let found = resolver.resolve_current_task("sbx-1").unwrap().unwrap();
        assert_eq!(found.id, task.id);
    }

    #[test]
    fn test_stable_agent_id_falls_back_to_lookup() {
        let db = handle();
        let task = insert_claimed(&db, "review", WorkerRef::Stable("agent-9".into()));

        let resolver = WorkerResolver::new(db);
        let found = resolver.resolve_current_task("agent-9").unwrap().unwrap();
        assert_eq!(found.id, task.id);
    }

    #[test]
    fn test_unknown_ref_is_none_not_error() {
        let db = handle();
        let resolver = WorkerResolver::new(db);
        assert!(resolver.resolve_current_task("nobody").unwrap().is_none());
    }

    #[test]
    fn test_terminal_task_is_not_resolved() {
        let db = handle();
        let task = insert_claimed(&db, "implement", WorkerRef::Ephemeral("sbx-2".into()));
        {
            let guard = db.lock_sync().unwrap();
            guard
                .transition_task(&task.id, &[TaskStatus::Assigned], TaskStatus::Running, None, None)
                .unwrap();
            guard
                .transition_task(&task.id, &[TaskStatus::Running], TaskStatus::Completed, None, None)
                .unwrap();
        }

        let resolver = WorkerResolver::new(db);
        assert!(resolver.resolve_current_task("sbx-2").unwrap().is_none());
    }
}
