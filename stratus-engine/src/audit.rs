use std::sync::{Arc, Mutex};

use tracing::{info, warn};

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Normal,
    Warning,
}

/// A lifecycle event worth surfacing to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub level: EventLevel,
    pub reason: String,
    pub message: String,
    pub object_ids: Vec<String>,
}

/// Destination for audit events.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);
}

/// Writes events to the tracing subscriber.
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, event: Event) {
        let objects = event.object_ids.join(",");
        match event.level {
            EventLevel::Normal => {
                info!(reason = %event.reason, objects = %objects, "{}", event.message)
            }
            EventLevel::Warning => {
                warn!(reason = %event.reason, objects = %objects, "{}", event.message)
            }
        }
    }
}

/// Keeps events in memory; used by tests and the simulator.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: Event) {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event);
    }
}

struct NoopRecorder;

impl EventRecorder for NoopRecorder {
    fn record(&self, _event: Event) {}
}

pub const REASON_FUTURE_RESET: &str = "LongRunningOperationReset";
pub const REASON_CREATED: &str = "ResourceCreated";
pub const REASON_UPDATED: &str = "ResourceUpdated";
pub const REASON_DELETED: &str = "ResourceDeleted";
pub const REASON_MUTATED: &str = "ResourceMutated";
pub const REASON_PAUSED: &str = "ResourcePaused";

/// Engine specific audit logger
pub struct AuditLogger {
    inner: Arc<dyn EventRecorder>,
}

impl AuditLogger {
    pub fn new(recorder: Arc<dyn EventRecorder>) -> Self {
        Self { inner: recorder }
    }

    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingRecorder))
    }

    pub fn new_noop() -> Self {
        Self::new(Arc::new(NoopRecorder))
    }

    fn log(&self, level: EventLevel, reason: &str, message: String, object_ids: Vec<String>) {
        self.inner.record(Event {
            level,
            reason: reason.to_string(),
            message,
            object_ids,
        });
    }

    // Long-running operation events
    pub fn future_reset(&self, service: &str, group: &str, name: &str, kind: &str, error: &str) {
        self.log(
            EventLevel::Warning,
            REASON_FUTURE_RESET,
            format!(
                "Discarded {} operation state for {} {}/{}: {}",
                kind, service, group, name, error
            ),
            vec![format!("{}/{}", group, name)],
        );
    }

    // Resource events
    pub fn resource_created(&self, service: &str, group: &str, name: &str) {
        self.log(
            EventLevel::Normal,
            REASON_CREATED,
            format!("Created {} resource {}/{}", service, group, name),
            vec![format!("{}/{}", group, name)],
        );
    }

    pub fn resource_updated(&self, service: &str, group: &str, name: &str) {
        self.log(
            EventLevel::Normal,
            REASON_UPDATED,
            format!("Updated {} resource {}/{}", service, group, name),
            vec![format!("{}/{}", group, name)],
        );
    }

    pub fn resource_deleted(&self, service: &str, group: &str, name: &str) {
        self.log(
            EventLevel::Normal,
            REASON_DELETED,
            format!("Deleted {} resource {}/{}", service, group, name),
            vec![format!("{}/{}", group, name)],
        );
    }

    pub fn resource_paused(&self, service: &str, group: &str, name: &str) {
        self.log(
            EventLevel::Normal,
            REASON_PAUSED,
            format!("Paused {} resource {}/{}", service, group, name),
            vec![format!("{}/{}", group, name)],
        );
    }

    // Mutation events
    pub fn mutation_applied(&self, location: &str, value: &str, reason: &str) {
        self.log(
            EventLevel::Normal,
            REASON_MUTATED,
            format!("Set {} to {}: {}", location, value, reason),
            vec![location.to_string()],
        );
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::tracing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_recorder_captures_events() {
        let recorder = Arc::new(MemoryRecorder::new());
        let audit = AuditLogger::new(recorder.clone());

        audit.resource_created("privateendpoints", "g1", "pe1");
        audit.future_reset("privateendpoints", "g1", "pe1", "PUT", "bad data");

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, EventLevel::Normal);
        assert_eq!(events[0].object_ids, vec!["g1/pe1".to_string()]);
        assert_eq!(events[1].level, EventLevel::Warning);
        assert_eq!(events[1].reason, REASON_FUTURE_RESET);
        assert!(events[1].message.contains("bad data"));
    }

    #[test]
    fn test_noop_recorder() {
        let audit = AuditLogger::new_noop();
        audit.resource_deleted("svc", "g", "n");
    }
}
