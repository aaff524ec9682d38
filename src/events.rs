//! Notifications emitted by the ledger, one per successful mutating call.
//!
//! External consumers index task history from these instead of re-scanning
//! ledger state.

use crate::task::{Address, Amount, TaskId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LedgerEvent {
    TaskPosted {
        id: TaskId,
        poster: Address,
        reward: Amount,
        description: String,
    },
    TaskAccepted {
        id: TaskId,
        worker: Address,
    },
    TaskCompleted {
        id: TaskId,
        worker: Address,
    },
    /// `reward` is the amount paid, captured before zeroing.
    TaskConfirmed {
        id: TaskId,
        poster: Address,
        worker: Address,
        reward: Amount,
    },
    TaskCancelled {
        id: TaskId,
        canceller: Address,
    },
    WorkerWithdrew {
        id: TaskId,
        worker: Address,
    },
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::TaskPosted { .. } => "TaskPosted",
            LedgerEvent::TaskAccepted { .. } => "TaskAccepted",
            LedgerEvent::TaskCompleted { .. } => "TaskCompleted",
            LedgerEvent::TaskConfirmed { .. } => "TaskConfirmed",
            LedgerEvent::TaskCancelled { .. } => "TaskCancelled",
            LedgerEvent::WorkerWithdrew { .. } => "WorkerWithdrew",
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            LedgerEvent::TaskPosted { id, .. }
            | LedgerEvent::TaskAccepted { id, .. }
            | LedgerEvent::TaskCompleted { id, .. }
            | LedgerEvent::TaskConfirmed { id, .. }
            | LedgerEvent::TaskCancelled { id, .. }
            | LedgerEvent::WorkerWithdrew { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = LedgerEvent::TaskAccepted { id: 2, worker: "w".to_string() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "TaskAccepted");
        assert_eq!(json["data"]["id"], 2);
        assert_eq!(json["data"]["worker"], "w");
        assert_eq!(event.name(), "TaskAccepted");
        assert_eq!(event.task_id(), 2);
    }
}
