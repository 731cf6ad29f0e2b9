//! Engine events published on the event bus.
//!
//! Events are informational: the durable store remains the source of truth,
//! and a lagging or absent subscriber never affects execution.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::Status;
use crate::interrupt::InterruptType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PlanStarted {
        plan_execution_id: Uuid,
        plan_id: String,
    },
    PlanConcluded {
        plan_execution_id: Uuid,
        status: Status,
    },
    NodeStatusChanged {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        identifier: String,
        from: Status,
        to: Status,
    },
    /// A custom-facilitated node needs an out-of-band mode decision.
    FacilitationRequested {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        node_id: String,
    },
    InputRequested {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        correlation_id: String,
        prompt: Option<String>,
    },
    InterventionRequested {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        correlation_id: String,
    },
    InterruptRegistered {
        interrupt_id: Uuid,
        plan_execution_id: Uuid,
        interrupt_type: InterruptType,
    },
    TaskDispatched {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        correlation_id: String,
        step_type: String,
    },
}

impl EngineEvent {
    pub fn plan_execution_id(&self) -> Uuid {
        match self {
            EngineEvent::PlanStarted { plan_execution_id, .. }
            | EngineEvent::PlanConcluded { plan_execution_id, .. }
            | EngineEvent::NodeStatusChanged { plan_execution_id, .. }
            | EngineEvent::FacilitationRequested { plan_execution_id, .. }
            | EngineEvent::InputRequested { plan_execution_id, .. }
            | EngineEvent::InterventionRequested { plan_execution_id, .. }
            | EngineEvent::InterruptRegistered { plan_execution_id, .. }
            | EngineEvent::TaskDispatched { plan_execution_id, .. } => *plan_execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged() {
        let id = Uuid::now_v7();
        let event = EngineEvent::PlanConcluded {
            plan_execution_id: id,
            status: Status::Succeeded,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "plan_concluded");
        assert_eq!(value["status"], "succeeded");
        assert_eq!(event.plan_execution_id(), id);
    }
}
