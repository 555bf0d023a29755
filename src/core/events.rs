//! Mutation events and the synchronous subscriber bus.
//!
//! The store emits one event per committed mutation. Subscribers run
//! synchronously in registration order and receive copies of the event
//! record; a panicking subscriber is reported through the error sink and
//! never rolls back the mutation that triggered it.

use crate::core::model::{DependencyType, ElementType};
use crate::core::time;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A committed mutation, as observed by subscribers.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ElementCreated {
        id: String,
        element_type: ElementType,
        actor: String,
    },
    ElementUpdated {
        id: String,
        element_type: ElementType,
        actor: String,
    },
    ElementDeleted {
        id: String,
        element_type: ElementType,
        actor: String,
        reason: Option<String>,
    },
    DependencyAdded {
        source_id: String,
        target_id: String,
        dep_type: DependencyType,
    },
    DependencyRemoved {
        source_id: String,
        target_id: String,
        dep_type: DependencyType,
    },
    DocumentVersionCreated {
        document_id: String,
        version: i64,
    },
    WorkflowBurned {
        workflow_id: String,
        tasks_deleted: usize,
        dependencies_deleted: usize,
    },
}

impl StoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ElementCreated { .. } => "element.created",
            Self::ElementUpdated { .. } => "element.updated",
            Self::ElementDeleted { .. } => "element.deleted",
            Self::DependencyAdded { .. } => "dependency.added",
            Self::DependencyRemoved { .. } => "dependency.removed",
            Self::DocumentVersionCreated { .. } => "document.version.created",
            Self::WorkflowBurned { .. } => "workflow.burned",
        }
    }

    /// Envelope shape written to logs and handed to external consumers.
    pub fn to_json(&self) -> Value {
        let body = match self {
            Self::ElementCreated { id, element_type, actor }
            | Self::ElementUpdated { id, element_type, actor } => json!({
                "id": id,
                "type": element_type.as_str(),
                "actor": actor,
            }),
            Self::ElementDeleted { id, element_type, actor, reason } => json!({
                "id": id,
                "type": element_type.as_str(),
                "actor": actor,
                "reason": reason,
            }),
            Self::DependencyAdded { source_id, target_id, dep_type }
            | Self::DependencyRemoved { source_id, target_id, dep_type } => json!({
                "sourceId": source_id,
                "targetId": target_id,
                "type": dep_type.as_str(),
            }),
            Self::DocumentVersionCreated { document_id, version } => json!({
                "documentId": document_id,
                "version": version,
            }),
            Self::WorkflowBurned { workflow_id, tasks_deleted, dependencies_deleted } => json!({
                "workflowId": workflow_id,
                "tasksDeleted": tasks_deleted,
                "dependenciesDeleted": dependencies_deleted,
            }),
        };
        json!({
            "event": self.name(),
            "eventId": time::new_event_id(),
            "ts": time::now_iso(),
            "payload": body,
        })
    }
}

pub type SubscriberId = u64;
type Subscriber = Box<dyn Fn(&StoreEvent) + Send>;
type ErrorSink = Box<dyn Fn(&str) + Send>;

/// Synchronous fan-out of committed mutations.
pub struct EventBus {
    subscribers: Vec<(SubscriberId, Subscriber)>,
    next_id: SubscriberId,
    error_sink: ErrorSink,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 1,
            error_sink: Box::new(|message| {
                eprintln!("Warning: event subscriber failed: {message}");
            }),
        }
    }

    pub fn subscribe<F>(&mut self, subscriber: F) -> SubscriberId
    where
        F: Fn(&StoreEvent) + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, Box::new(subscriber)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    /// Replace the sink that receives subscriber failure reports.
    pub fn set_error_sink<F>(&mut self, sink: F)
    where
        F: Fn(&str) + Send + 'static,
    {
        self.error_sink = Box::new(sink);
    }

    /// Deliver `event` to every subscriber in registration order. A panic in
    /// one subscriber is reported and does not stop delivery to the rest.
    pub fn emit(&self, event: &StoreEvent) {
        for (id, subscriber) in &self.subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber(event)));
            if outcome.is_err() {
                (self.error_sink)(&format!(
                    "subscriber {id} panicked while handling {}",
                    event.name()
                ));
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_subscribers_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        for label in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.lock().unwrap().push(label));
        }
        bus.emit(&StoreEvent::ElementCreated {
            id: "el-abc".to_string(),
            element_type: ElementType::Task,
            actor: "el-sys".to_string(),
        });
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_delivery() {
        let seen = Arc::new(Mutex::new(0));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        {
            let failures = Arc::clone(&failures);
            bus.set_error_sink(move |msg| failures.lock().unwrap().push(msg.to_string()));
        }
        bus.subscribe(|_| panic!("boom"));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| *seen.lock().unwrap() += 1);
        }
        bus.emit(&StoreEvent::DependencyAdded {
            source_id: "el-a".to_string(),
            target_id: "el-b".to_string(),
            dep_type: DependencyType::Blocks,
        });
        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(failures.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let seen = Arc::new(Mutex::new(0));
        let mut bus = EventBus::new();
        let id = {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| *seen.lock().unwrap() += 1)
        };
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&StoreEvent::DocumentVersionCreated {
            document_id: "el-doc".to_string(),
            version: 2,
        });
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn test_event_envelope_shape() {
        let event = StoreEvent::WorkflowBurned {
            workflow_id: "el-wf".to_string(),
            tasks_deleted: 3,
            dependencies_deleted: 5,
        };
        let value = event.to_json();
        assert_eq!(value["event"], "workflow.burned");
        assert_eq!(value["payload"]["tasksDeleted"], 3);
        assert!(value["eventId"].is_string());
    }
}
