//! The task escrow ledger.
//!
//! Every operation validates existence, then authority and status, before it
//! touches state. Operations that release custody commit the terminal status
//! and zero the reward *before* handing value to the recipient, so a recipient
//! that calls back into the ledger during the transfer only ever sees the
//! settled task.

use crate::error::{LedgerError, TransferError};
use crate::events::LedgerEvent;
use crate::task::{Address, Amount, Task, TaskId, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Ambient data of a single call into the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub caller: Address,
    /// Value attached to the call. Only `post_task` reads it.
    pub value: Amount,
    pub timestamp: i64,
}

impl CallContext {
    pub fn new(caller: impl Into<Address>) -> Self {
        Self {
            caller: caller.into(),
            value: 0,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn with_value(mut self, value: Amount) -> Self {
        self.value = value;
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Moves value out of the ledger's custody.
///
/// The implementation gets the ledger back mutably because the recipient may
/// run code that re-enters it before the transfer returns. On `Err` nothing
/// may have been moved.
pub trait ValueTransfer {
    fn transfer(
        &mut self,
        ledger: &mut TaskLedger,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TransferError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLedger {
    task_count: TaskId,
    tasks: Vec<Task>,
    custody: Amount,
    /// Events since the host last drained them. Receipts carry them durably.
    #[serde(skip)]
    events: Vec<LedgerEvent>,
}

/// Ledger state captured before a payout, restored if the payout fails.
struct Checkpoint {
    task_count: TaskId,
    tasks: Vec<Task>,
    custody: Amount,
    events: usize,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the checks of `post_task` without changing anything. Returns the
    /// custody the post would leave behind.
    pub fn validate_post(&self, ctx: &CallContext, description: &str) -> Result<Amount, LedgerError> {
        if ctx.value == 0 {
            return Err(LedgerError::InvalidReward);
        }
        if description.is_empty() {
            return Err(LedgerError::InvalidDescription);
        }
        self.custody
            .checked_add(ctx.value)
            .ok_or(LedgerError::CustodyOverflow { held: self.custody, deposit: ctx.value })
    }

    pub fn post_task(&mut self, ctx: &CallContext, description: &str) -> Result<TaskId, LedgerError> {
        let custody = self.validate_post(ctx, description)?;

        let id = self.task_count;
        self.tasks.push(Task::new(
            id,
            ctx.caller.clone(),
            description.to_string(),
            ctx.value,
            ctx.timestamp,
        ));
        self.task_count += 1;
        self.custody = custody;

        self.emit(LedgerEvent::TaskPosted {
            id,
            poster: ctx.caller.clone(),
            reward: ctx.value,
            description: description.to_string(),
        });
        Ok(id)
    }

    pub fn accept_task(&mut self, ctx: &CallContext, id: TaskId) -> Result<(), LedgerError> {
        let task = self.find_mut(id)?;
        match task.status {
            TaskStatus::Open => {}
            status @ (TaskStatus::Accepted
            | TaskStatus::Completed
            | TaskStatus::Confirmed
            | TaskStatus::Cancelled) => return Err(LedgerError::TaskNotOpen { id, status }),
        }
        if task.poster == ctx.caller {
            return Err(LedgerError::SelfAcceptNotAllowed(id));
        }

        task.worker = Some(ctx.caller.clone());
        task.status = TaskStatus::Accepted;
        task.accepted_at = Some(ctx.timestamp);

        self.emit(LedgerEvent::TaskAccepted { id, worker: ctx.caller.clone() });
        Ok(())
    }

    pub fn complete_task(&mut self, ctx: &CallContext, id: TaskId) -> Result<(), LedgerError> {
        let task = self.find_mut(id)?;
        if !task.is_worker(&ctx.caller) {
            return Err(LedgerError::NotWorker(id));
        }
        match task.status {
            TaskStatus::Accepted => {}
            status @ (TaskStatus::Open
            | TaskStatus::Completed
            | TaskStatus::Confirmed
            | TaskStatus::Cancelled) => {
                return Err(LedgerError::InvalidStateForComplete { id, status })
            }
        }

        task.status = TaskStatus::Completed;
        task.completed_at = Some(ctx.timestamp);

        self.emit(LedgerEvent::TaskCompleted { id, worker: ctx.caller.clone() });
        Ok(())
    }

    /// Pays the worker and settles the task. Returns the amount paid.
    pub fn confirm_completion<T: ValueTransfer + ?Sized>(
        &mut self,
        ctx: &CallContext,
        id: TaskId,
        transfer: &mut T,
    ) -> Result<Amount, LedgerError> {
        let task = self.find(id)?;
        if task.poster != ctx.caller {
            return Err(LedgerError::NotPoster(id));
        }
        match task.status {
            TaskStatus::Completed => {}
            status @ (TaskStatus::Open
            | TaskStatus::Accepted
            | TaskStatus::Confirmed
            | TaskStatus::Cancelled) => {
                return Err(LedgerError::InvalidStateForConfirm { id, status })
            }
        }
        // Completed always carries a worker; a record without one is not payable.
        let worker = task
            .worker
            .clone()
            .ok_or(LedgerError::InvalidStateForConfirm { id, status: task.status })?;
        let poster = task.poster.clone();

        let checkpoint = self.checkpoint();
        let reward = self.settle(id, TaskStatus::Confirmed)?;
        self.release(transfer, &worker, reward, checkpoint)?;

        self.emit(LedgerEvent::TaskConfirmed { id, poster, worker, reward });
        Ok(reward)
    }

    /// Refunds the poster and settles the task. Returns the amount refunded.
    pub fn cancel_task<T: ValueTransfer + ?Sized>(
        &mut self,
        ctx: &CallContext,
        id: TaskId,
        transfer: &mut T,
    ) -> Result<Amount, LedgerError> {
        let task = self.find(id)?;
        if task.poster != ctx.caller {
            return Err(LedgerError::NotPoster(id));
        }
        match task.status {
            TaskStatus::Open => {}
            status @ (TaskStatus::Accepted
            | TaskStatus::Completed
            | TaskStatus::Confirmed
            | TaskStatus::Cancelled) => return Err(LedgerError::CancelOnlyWhenOpen { id, status }),
        }
        let poster = task.poster.clone();

        let checkpoint = self.checkpoint();
        let reward = self.settle(id, TaskStatus::Cancelled)?;
        self.release(transfer, &poster, reward, checkpoint)?;

        self.emit(LedgerEvent::TaskCancelled { id, canceller: ctx.caller.clone() });
        Ok(reward)
    }

    pub fn withdraw_from_task(&mut self, ctx: &CallContext, id: TaskId) -> Result<(), LedgerError> {
        let task = self.find_mut(id)?;
        if !task.is_worker(&ctx.caller) {
            return Err(LedgerError::NotWorker(id));
        }
        match task.status {
            TaskStatus::Accepted => {}
            status @ (TaskStatus::Open
            | TaskStatus::Completed
            | TaskStatus::Confirmed
            | TaskStatus::Cancelled) => {
                return Err(LedgerError::InvalidStateForWithdraw { id, status })
            }
        }

        task.status = TaskStatus::Open;
        task.worker = None;
        task.accepted_at = None;

        self.emit(LedgerEvent::WorkerWithdrew { id, worker: ctx.caller.clone() });
        Ok(())
    }

    pub fn get_task(&self, id: TaskId) -> Result<Task, LedgerError> {
        self.find(id).cloned()
    }

    pub fn open_tasks(&self) -> Vec<TaskId> {
        self.ids_where(|task| task.status == TaskStatus::Open)
    }

    pub fn tasks_by_poster(&self, poster: &str) -> Vec<TaskId> {
        self.ids_where(|task| task.poster == poster)
    }

    pub fn tasks_by_worker(&self, worker: &str) -> Vec<TaskId> {
        self.ids_where(|task| task.is_worker(worker))
    }

    pub fn task_count(&self) -> TaskId {
        self.task_count
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Total value currently held for live tasks.
    pub fn custody(&self) -> Amount {
        self.custody
    }

    /// Events not yet drained by `take_events`.
    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<LedgerEvent> {
        std::mem::take(&mut self.events)
    }

    fn find(&self, id: TaskId) -> Result<&Task, LedgerError> {
        if id >= self.task_count {
            return Err(LedgerError::TaskNotFound(id));
        }
        usize::try_from(id)
            .ok()
            .and_then(|index| self.tasks.get(index))
            .ok_or(LedgerError::TaskNotFound(id))
    }

    fn find_mut(&mut self, id: TaskId) -> Result<&mut Task, LedgerError> {
        if id >= self.task_count {
            return Err(LedgerError::TaskNotFound(id));
        }
        usize::try_from(id)
            .ok()
            .and_then(|index| self.tasks.get_mut(index))
            .ok_or(LedgerError::TaskNotFound(id))
    }

    fn ids_where(&self, predicate: impl Fn(&Task) -> bool) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|task| predicate(task))
            .map(|task| task.id)
            .collect()
    }

    /// Commits the terminal status and zeroes the reward, returning what was held.
    fn settle(&mut self, id: TaskId, terminal: TaskStatus) -> Result<Amount, LedgerError> {
        let held = self.custody;
        let task = self.find_mut(id)?;
        let custody = held
            .checked_sub(task.reward)
            .ok_or(LedgerError::CustodyUnderflow { held, release: task.reward })?;
        task.status = terminal;
        let reward = std::mem::take(&mut task.reward);
        self.custody = custody;
        Ok(reward)
    }

    fn release<T: ValueTransfer + ?Sized>(
        &mut self,
        transfer: &mut T,
        to: &Address,
        amount: Amount,
        checkpoint: Checkpoint,
    ) -> Result<(), LedgerError> {
        debug!(to = %to, amount, "releasing custody");
        match transfer.transfer(self, to, amount) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(to = %to, amount, error = %err, "transfer failed, rolling back");
                self.restore(checkpoint);
                Err(LedgerError::TransferFailed {
                    to: to.clone(),
                    amount,
                    reason: err.0,
                })
            }
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            task_count: self.task_count,
            tasks: self.tasks.clone(),
            custody: self.custody,
            events: self.events.len(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.task_count = checkpoint.task_count;
        self.tasks = checkpoint.tasks;
        self.custody = checkpoint.custody;
        self.events.truncate(checkpoint.events);
    }

    fn emit(&mut self, event: LedgerEvent) {
        info!(event = event.name(), task_id = event.task_id(), "ledger event");
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::UNIT;

    struct Refusing;

    impl ValueTransfer for Refusing {
        fn transfer(&mut self, _: &mut TaskLedger, _: &Address, _: Amount) -> Result<(), TransferError> {
            Err(TransferError("recipient rejected value".to_string()))
        }
    }

    /// Posts a second task from inside the transfer, then refuses it.
    struct PostsThenRefuses;

    impl ValueTransfer for PostsThenRefuses {
        fn transfer(&mut self, ledger: &mut TaskLedger, to: &Address, _: Amount) -> Result<(), TransferError> {
            let ctx = CallContext::new(to.clone()).with_value(UNIT);
            ledger
                .post_task(&ctx, "nested")
                .map_err(|e| TransferError(e.to_string()))?;
            Err(TransferError("refused after nested call".to_string()))
        }
    }

    fn ledger_with_open_task() -> TaskLedger {
        let mut ledger = TaskLedger::new();
        let ctx = CallContext::new("poster").with_value(3 * UNIT).at(10);
        ledger.post_task(&ctx, "paint the shed").unwrap();
        ledger
    }

    #[test]
    fn failed_refund_restores_the_task() {
        let mut ledger = ledger_with_open_task();
        let before = ledger.clone();

        let err = ledger
            .cancel_task(&CallContext::new("poster"), 0, &mut Refusing)
            .unwrap_err();

        assert!(matches!(err, LedgerError::TransferFailed { amount, .. } if amount == 3 * UNIT));
        assert_eq!(ledger, before);
    }

    #[test]
    fn failed_transfer_discards_nested_effects() {
        let mut ledger = ledger_with_open_task();
        let before = ledger.clone();

        let err = ledger
            .cancel_task(&CallContext::new("poster"), 0, &mut PostsThenRefuses)
            .unwrap_err();

        assert!(matches!(err, LedgerError::TransferFailed { .. }));
        assert_eq!(ledger.task_count(), 1);
        assert_eq!(ledger.custody(), 3 * UNIT);
        assert_eq!(ledger, before);
    }

    #[test]
    fn short_custody_refuses_to_settle() {
        let mut ledger = ledger_with_open_task();
        let mut raw = serde_json::to_value(&ledger).unwrap();
        raw["custody"] = serde_json::json!(UNIT);
        let mut ledger: TaskLedger = serde_json::from_value(raw).unwrap();
        let before = ledger.clone();

        let err = ledger
            .cancel_task(&CallContext::new("poster"), 0, &mut Refusing)
            .unwrap_err();

        assert_eq!(err, LedgerError::CustodyUnderflow { held: UNIT, release: 3 * UNIT });
        assert_eq!(ledger, before);
        assert_eq!(ledger.get_task(0).unwrap().status, TaskStatus::Open);
    }

    #[test]
    fn events_drain_and_are_not_persisted() {
        let mut ledger = ledger_with_open_task();
        ledger.accept_task(&CallContext::new("worker"), 0).unwrap();

        let raw = serde_json::to_value(&ledger).unwrap();
        assert!(raw.get("events").is_none());

        let drained = ledger.take_events();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].name(), "TaskPosted");
        assert!(ledger.events().is_empty());
        assert!(ledger.take_events().is_empty());
    }

    #[test]
    fn validate_post_changes_nothing() {
        let ledger = ledger_with_open_task();
        let before = ledger.clone();
        let ctx = CallContext::new("poster").with_value(UNIT);

        assert_eq!(ledger.validate_post(&ctx, "trim the hedge"), Ok(4 * UNIT));
        assert_eq!(
            ledger.validate_post(&ctx, ""),
            Err(LedgerError::InvalidDescription)
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn lookups_are_bounded_by_the_counter() {
        let ledger = ledger_with_open_task();
        assert!(ledger.get_task(0).is_ok());
        assert_eq!(ledger.get_task(1), Err(LedgerError::TaskNotFound(1)));
        assert_eq!(ledger.get_task(TaskId::MAX), Err(LedgerError::TaskNotFound(TaskId::MAX)));
    }

    #[test]
    fn timestamps_come_from_the_call_context() {
        let mut ledger = ledger_with_open_task();
        ledger.accept_task(&CallContext::new("worker").at(20), 0).unwrap();
        ledger.complete_task(&CallContext::new("worker").at(30), 0).unwrap();

        let task = ledger.get_task(0).unwrap();
        assert_eq!(task.created_at, 10);
        assert_eq!(task.accepted_at, Some(20));
        assert_eq!(task.completed_at, Some(30));
    }
}
