//! Escrow ledger for a peer-to-peer task marketplace.
//!
//! A poster deposits a reward, a worker accepts and performs the task, and the
//! reward is paid out on the poster's confirmation or refunded on
//! cancellation. [`ledger::TaskLedger`] is the state machine; [`chain::Chain`]
//! hosts it with wallets, atomic calls and a receipt chain.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod p2p;
pub mod task;
pub mod utils;
pub mod wallet;

pub use chain::{Block, Call, Chain, Receipt};
pub use error::{ChainError, ErrorKind, LedgerError, TransferError};
pub use events::LedgerEvent;
pub use ledger::{CallContext, TaskLedger, ValueTransfer};
pub use task::{Address, Amount, Task, TaskId, TaskStatus, UNIT};
