use crate::task::{Address, Amount, TaskId, TaskStatus};
use thiserror::Error;

/// Broad classes of ledger failure, used to map errors onto API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    InvalidState,
    InvalidInput,
    Transfer,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Caller is not the poster of task {0}")]
    NotPoster(TaskId),

    #[error("Caller is not the worker of task {0}")]
    NotWorker(TaskId),

    #[error("Poster cannot accept their own task {0}")]
    SelfAcceptNotAllowed(TaskId),

    #[error("Task {id} is not open (status {status})")]
    TaskNotOpen { id: TaskId, status: TaskStatus },

    #[error("Task {id} cannot be completed from status {status}")]
    InvalidStateForComplete { id: TaskId, status: TaskStatus },

    #[error("Task {id} cannot be confirmed from status {status}")]
    InvalidStateForConfirm { id: TaskId, status: TaskStatus },

    #[error("Task {id} can only be cancelled while open (status {status})")]
    CancelOnlyWhenOpen { id: TaskId, status: TaskStatus },

    #[error("Task {id} cannot be withdrawn from in status {status}")]
    InvalidStateForWithdraw { id: TaskId, status: TaskStatus },

    #[error("Reward must be greater than zero")]
    InvalidReward,

    #[error("Description must not be empty")]
    InvalidDescription,

    #[error("Custody overflow: holding {held}, deposit {deposit}")]
    CustodyOverflow { held: Amount, deposit: Amount },

    #[error("Transfer of {amount} to {to} failed: {reason}")]
    TransferFailed { to: Address, amount: Amount, reason: String },

    #[error("Custody underflow: holding {held}, releasing {release}")]
    CustodyUnderflow { held: Amount, release: Amount },
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::TaskNotFound(_) => ErrorKind::NotFound,
            LedgerError::NotPoster(_)
            | LedgerError::NotWorker(_)
            | LedgerError::SelfAcceptNotAllowed(_) => ErrorKind::Unauthorized,
            LedgerError::TaskNotOpen { .. }
            | LedgerError::InvalidStateForComplete { .. }
            | LedgerError::InvalidStateForConfirm { .. }
            | LedgerError::CancelOnlyWhenOpen { .. }
            | LedgerError::InvalidStateForWithdraw { .. } => ErrorKind::InvalidState,
            LedgerError::InvalidReward
            | LedgerError::InvalidDescription
            | LedgerError::CustodyOverflow { .. } => ErrorKind::InvalidInput,
            LedgerError::TransferFailed { .. } | LedgerError::CustodyUnderflow { .. } => {
                ErrorKind::Transfer
            }
        }
    }
}

/// Reported by a `ValueTransfer` implementation. A failed transfer has moved nothing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransferError(pub String);

#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Wallet {0} not found")]
    UnknownWallet(Address),

    #[error("Invalid key for wallet {0}")]
    Unauthorized(Address),

    #[error("Wallet creation failed: {0}")]
    WalletCreation(String),

    #[error("Insufficient funds in {address}: has {available}, needs {needed}")]
    InsufficientFunds { address: Address, available: Amount, needed: Amount },

    #[error("Chain state unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
