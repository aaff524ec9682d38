use crate::config::NodeConfig;
use crate::error::{ChainError, StoreError};
use crate::events::LedgerEvent;
use crate::ledger::{CallContext, TaskLedger};
use crate::task::{Address, Amount, TaskId};
use crate::utils::hash_data;
use crate::wallet::{NewWallet, WalletManager};
use chrono::Utc;
use serde::{Serialize, Deserialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

const CHAIN_FILE: &str = "chain.json";
const WALLET_FILE: &str = "wallets.json";

/// One ledger operation as submitted by a caller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    PostTask { description: String, reward: Amount },
    AcceptTask { id: TaskId },
    CompleteTask { id: TaskId },
    ConfirmCompletion { id: TaskId },
    CancelTask { id: TaskId },
    WithdrawFromTask { id: TaskId },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::PostTask { .. } => "post_task",
            Call::AcceptTask { .. } => "accept_task",
            Call::CompleteTask { .. } => "complete_task",
            Call::ConfirmCompletion { .. } => "confirm_completion",
            Call::CancelTask { .. } => "cancel_task",
            Call::WithdrawFromTask { .. } => "withdraw_from_task",
        }
    }
}

/// Record of one committed call and the events it emitted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub nonce: u64,
    pub tx_hash: String,
    pub caller: Address,
    pub call: Call,
    pub events: Vec<LedgerEvent>,
    pub timestamp: i64,
}

impl Receipt {
    pub fn new(nonce: u64, caller: Address, call: Call, events: Vec<LedgerEvent>, timestamp: i64) -> Self {
        let tx_hash = hash_data(&format!("{}{}{:?}{}", nonce, caller, call, timestamp));
        Self { nonce, tx_hash, caller, call, events, timestamp }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub timestamp: i64,
    pub receipts: Vec<Receipt>,
    pub previous_hash: String,
    pub hash: String,
}

impl Block {
    pub fn new(index: u64, receipts: Vec<Receipt>, previous_hash: String) -> Self {
        let timestamp = Utc::now().timestamp();
        let hash = Self::compute_hash(index, timestamp, &receipts, &previous_hash);
        Self { index, timestamp, receipts, previous_hash, hash }
    }

    fn compute_hash(index: u64, timestamp: i64, receipts: &[Receipt], previous_hash: &str) -> String {
        hash_data(&format!("{}{}{:?}{}", index, timestamp, receipts, previous_hash))
    }
}

#[derive(Serialize, Deserialize)]
pub struct Chain {
    pub blocks: Vec<Block>,
    pub ledger: TaskLedger,
    pending: Vec<Receipt>,
    nonce: u64,
    // Wallets live in their own file; the data dir is runtime-only.
    #[serde(skip)]
    pub wallets: WalletManager,
    #[serde(skip)]
    data_dir: Option<PathBuf>,
}

impl Chain {
    /// In-memory chain starting from genesis. Nothing is persisted.
    pub fn new(faucet: Amount) -> Self {
        Self {
            blocks: vec![Block::new(0, vec![], "0".to_string())],
            ledger: TaskLedger::new(),
            pending: Vec::new(),
            nonce: 0,
            wallets: WalletManager::new(faucet),
            data_dir: None,
        }
    }

    /// Loads chain and wallets from the configured data dir, or starts fresh.
    pub fn open(config: &NodeConfig) -> Result<Self, StoreError> {
        let wallets = WalletManager::load(&config.data_dir.join(WALLET_FILE), config.faucet)?;
        let chain_path = config.data_dir.join(CHAIN_FILE);
        let mut chain = match fs::read_to_string(&chain_path) {
            Ok(data) => {
                let chain: Chain = serde_json::from_str(&data)?;
                info!(path = %chain_path.display(), blocks = chain.blocks.len(), "loaded chain");
                chain
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %chain_path.display(), "no chain found, starting from genesis");
                Chain::new(config.faucet)
            }
            Err(e) => return Err(e.into()),
        };
        chain.wallets = wallets;
        chain.data_dir = Some(config.data_dir.clone());
        Ok(chain)
    }

    pub fn save(&self) -> Result<(), StoreError> {
        if let Some(dir) = &self.data_dir {
            fs::create_dir_all(dir)?;
            fs::write(dir.join(CHAIN_FILE), serde_json::to_string(self)?)?;
            self.wallets.save(&dir.join(WALLET_FILE))?;
        }
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist chain state");
        }
    }

    pub fn execute(&mut self, caller: &str, call: Call) -> Result<Receipt, ChainError> {
        self.execute_at(caller, call, Utc::now().timestamp())
    }

    /// Runs `call` on behalf of `caller` once `key` proves it owns that wallet.
    pub fn execute_authenticated(&mut self, caller: &str, key: &str, call: Call) -> Result<Receipt, ChainError> {
        if let Err(err) = self.wallets.authenticate(caller, key) {
            warn!(caller = %caller, op = call.name(), error = %err, "call rejected");
            return Err(err);
        }
        self.execute(caller, call)
    }

    /// Runs one call atomically. A failed call leaves ledger and wallets as
    /// they were, including effects of nested calls.
    pub fn execute_at(&mut self, caller: &str, call: Call, timestamp: i64) -> Result<Receipt, ChainError> {
        if let Err(err) = self.dispatch(caller, &call, timestamp) {
            warn!(caller = %caller, op = call.name(), error = %err, "call reverted");
            return Err(err);
        }

        let events = self.ledger.take_events();
        self.nonce += 1;
        let receipt = Receipt::new(self.nonce, caller.to_string(), call, events, timestamp);
        info!(tx = %receipt.tx_hash, op = receipt.call.name(), "call committed");
        self.pending.push(receipt.clone());
        self.persist();
        Ok(receipt)
    }

    // Ledger operations either commit or leave the ledger untouched, and
    // wallet transfers never fail halfway. Posting is the one call that
    // touches both sides, so it validates first and refunds if the post fails.
    fn dispatch(&mut self, caller: &str, call: &Call, timestamp: i64) -> Result<(), ChainError> {
        let ctx = CallContext::new(caller).at(timestamp);
        match call {
            Call::PostTask { description, reward } => {
                let ctx = ctx.with_value(*reward);
                self.ledger.validate_post(&ctx, description)?;
                self.wallets.debit(caller, *reward)?;
                if let Err(err) = self.ledger.post_task(&ctx, description) {
                    self.wallets.refund(caller, *reward);
                    return Err(err.into());
                }
            }
            Call::AcceptTask { id } => self.ledger.accept_task(&ctx, *id)?,
            Call::CompleteTask { id } => self.ledger.complete_task(&ctx, *id)?,
            Call::ConfirmCompletion { id } => {
                self.ledger.confirm_completion(&ctx, *id, &mut self.wallets)?;
            }
            Call::CancelTask { id } => {
                self.ledger.cancel_task(&ctx, *id, &mut self.wallets)?;
            }
            Call::WithdrawFromTask { id } => self.ledger.withdraw_from_task(&ctx, *id)?,
        }
        Ok(())
    }

    /// Packages pending receipts into a new block.
    pub fn seal_block(&mut self) -> Option<Block> {
        if self.pending.is_empty() {
            return None;
        }
        let (index, previous_hash) = match self.blocks.last() {
            Some(previous) => (previous.index + 1, previous.hash.clone()),
            None => (0, "0".to_string()),
        };
        let block = Block::new(index, std::mem::take(&mut self.pending), previous_hash);
        info!(index = block.index, hash = %block.hash, receipts = block.receipts.len(), "block sealed");
        self.blocks.push(block.clone());
        self.persist();
        Some(block)
    }

    /// Checks every block's hash and its link to the previous block.
    pub fn verify(&self) -> bool {
        self.blocks.iter().enumerate().all(|(i, block)| {
            let linked = match i {
                0 => true,
                _ => block.previous_hash == self.blocks[i - 1].hash,
            };
            linked
                && block.hash
                    == Block::compute_hash(block.index, block.timestamp, &block.receipts, &block.previous_hash)
        })
    }

    pub fn pending_receipts(&self) -> &[Receipt] {
        &self.pending
    }

    pub fn create_wallet(&mut self) -> Result<NewWallet, ChainError> {
        let created = self.wallets.create_wallet()?;
        self.persist();
        Ok(created)
    }

    pub fn set_rejects_deposits(&mut self, address: &str, rejects: bool) -> Result<(), ChainError> {
        self.wallets.set_rejects_deposits(address, rejects)?;
        self.persist();
        Ok(())
    }

    /// Wallet balances plus value held in custody. Constant across calls.
    pub fn total_value(&self) -> u128 {
        self.wallets.total_balance() + u128::from(self.ledger.custody())
    }
}
