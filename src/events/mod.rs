//! In-process event bus.
//!
//! Components observe each other's state changes exclusively through
//! events published here. The bus is a notification layer, not a source
//! of truth: publishers commit to the store first, and a handler that
//! misses or double-receives an event must be able to re-derive the fact
//! from the store.
//!
//! Handlers are plain functions dispatched synchronously in subscription
//! order. The automation hooks chain through here (a completion advances
//! a phase, which spawns tasks, whose creation is published again), so
//! dispatch depth is bounded by the phase pipeline length and handlers
//! can be exercised in tests by direct invocation with synthetic events.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// Task lifecycle events. `TASK_<STATUS>` fires on every successful
// transition; the remainder are queue-level signals.
pub const TASK_CREATED: &str = "TASK_CREATED";
pub const TASK_ASSIGNED: &str = "TASK_ASSIGNED";
pub const TASK_RUNNING: &str = "TASK_RUNNING";
pub const TASK_COMPLETED: &str = "TASK_COMPLETED";
pub const TASK_FAILED: &str = "TASK_FAILED";
pub const TASK_BLOCKED: &str = "TASK_BLOCKED";
pub const TASK_RETRIED: &str = "TASK_RETRIED";
pub const TASK_ESCALATED: &str = "TASK_ESCALATED";

// Ticket / phase machine events.
pub const TICKET_CREATED: &str = "TICKET_CREATED";
pub const TICKET_PHASE_TRANSITIONED: &str = "TICKET_PHASE_TRANSITIONED";
pub const GATE_FAILED: &str = "GATE_FAILED";

// Monitoring events.
pub const WORKER_NUDGED: &str = "WORKER_NUDGED";
pub const TICKET_STUCK: &str = "TICKET_STUCK";
pub const MONITOR_ALERT: &str = "MONITOR_ALERT";

/// A fire-and-forget notification about a committed state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

type Handler = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

struct Subscription {
    pattern: String,
    handler: Handler,
}

impl Subscription {
    /// Exact match, or prefix match for a trailing-`*` pattern
    /// (e.g. `TASK_*`). A bare `*` matches everything.
    fn matches(&self, event_type: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => event_type.starts_with(prefix),
            None => self.pattern == event_type,
        }
    }
}

/// Typed publish/subscribe broker.
///
/// Delivery is at-least-once from the subscriber's perspective (callers
/// may republish after partial failures), so handlers must be idempotent.
/// Ordering is preserved per event type from a single publisher; nothing
/// is guaranteed across types.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    /// Serialized fan-out for WebSocket consumers; lagging receivers drop
    /// messages rather than backpressuring the engine.
    fanout: broadcast::Sender<String>,
}

impl EventBus {
    pub fn new() -> Self {
        let (fanout, _) = broadcast::channel(256);
        Self {
            subscriptions: RwLock::new(Vec::new()),
            fanout,
        }
    }

    /// Register a handler for an event type pattern.
    pub fn subscribe<F>(&self, pattern: &str, handler: F)
    where
        F: Fn(&SystemEvent) + Send + Sync + 'static,
    {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.push(Subscription {
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
    }

    /// Deliver an event to every matching subscriber, then to the
    /// serialized fan-out. Fire-and-forget: the publisher observes no
    /// return value.
    pub fn publish(&self, event: SystemEvent) {
        tracing::debug!(
            event_type = %event.event_type,
            entity_id = %event.entity_id,
            "publishing event"
        );

        // Collect matching handlers before invoking so a handler that
        // publishes a follow-up event re-enters without holding the lock.
        let matching: Vec<Handler> = {
            let subs = self
                .subscriptions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subs.iter()
                .filter(|s| s.matches(&event.event_type))
                .map(|s| s.handler.clone())
                .collect()
        };
        for handler in matching {
            handler(&event);
        }

        if let Ok(json) = serde_json::to_string(&event) {
            // Send fails only when no WS client is connected.
            let _ = self.fanout.send(json);
        }
    }

    /// Subscribe to the serialized stream (WebSocket fan-out).
    pub fn fanout_receiver(&self) -> broadcast::Receiver<String> {
        self.fanout.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
