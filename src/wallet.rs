use crate::error::{ChainError, StoreError, TransferError};
use crate::ledger::{TaskLedger, ValueTransfer};
use crate::task::{Address, Amount};
use crate::utils::hash_data;
use bip39::Mnemonic;
use rand::{RngCore, thread_rng};
use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Wallet {
    pub address: Address,
    pub balance: Amount,
    /// Incoming transfers are refused, like a recipient that reverts on receipt.
    #[serde(default)]
    pub rejects_deposits: bool,
    /// SHA-256 of the wallet key. Wallets without one cannot authenticate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_hash: Option<String>,
}

impl Wallet {
    pub fn new(address: Address, balance: Amount) -> Self {
        Self {
            address,
            balance,
            rejects_deposits: false,
            key_hash: None,
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key_hash = Some(hash_data(key));
        self
    }
}

/// A freshly created wallet with the secrets its owner must keep.
/// Neither secret is stored.
#[derive(Debug, Clone, Serialize)]
pub struct NewWallet {
    pub wallet: Wallet,
    pub mnemonic: String,
    /// Presented with every authenticated call; derived from the mnemonic.
    pub key: String,
}

/// Derives the wallet key from its recovery phrase.
pub fn wallet_key(mnemonic: &str) -> String {
    hash_data(&format!("wallet-key:{}", mnemonic))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WalletManager {
    wallets: HashMap<Address, Wallet>,
    faucet: Amount,
}

impl WalletManager {
    /// `faucet` is the starting balance of every wallet created here.
    pub fn new(faucet: Amount) -> Self {
        Self { wallets: HashMap::new(), faucet }
    }

    /// Create a new wallet from random 32 bytes => 24 words in bip39
    pub fn create_wallet(&mut self) -> Result<NewWallet, ChainError> {
        let mut rng = thread_rng();
        let mut entropy = [0u8; 32];
        rng.fill_bytes(&mut entropy);

        let mnemonic = Mnemonic::from_entropy(&entropy)
            .map_err(|e| ChainError::WalletCreation(e.to_string()))?
            .to_string();
        let key = wallet_key(&mnemonic);

        let address = hash_data(&format!("{:?}", entropy));
        let wallet = Wallet::new(address.clone(), self.faucet).with_key(&key);
        self.wallets.insert(address.clone(), wallet.clone());
        info!(address = %address, balance = self.faucet, "wallet created");
        Ok(NewWallet { wallet, mnemonic, key })
    }

    /// Checks that `key` belongs to the wallet at `address`.
    pub fn authenticate(&self, address: &str, key: &str) -> Result<(), ChainError> {
        let wallet = self
            .wallets
            .get(address)
            .ok_or_else(|| ChainError::UnknownWallet(address.to_string()))?;
        match &wallet.key_hash {
            Some(expected) if *expected == hash_data(key) => Ok(()),
            _ => Err(ChainError::Unauthorized(address.to_string())),
        }
    }

    /// Registers a wallet under a caller-chosen address.
    pub fn insert(&mut self, wallet: Wallet) {
        self.wallets.insert(wallet.address.clone(), wallet);
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn get_mut_wallet(&mut self, address: &str) -> Option<&mut Wallet> {
        self.wallets.get_mut(address)
    }

    pub fn balance(&self, address: &str) -> Amount {
        self.wallets.get(address).map(|w| w.balance).unwrap_or(0)
    }

    // Helper for API
    pub fn get_all_wallets(&self) -> Vec<Wallet> {
        let mut wallets: Vec<Wallet> = self.wallets.values().cloned().collect();
        wallets.sort_by(|a, b| a.address.cmp(&b.address));
        wallets
    }

    pub fn total_balance(&self) -> u128 {
        self.wallets.values().map(|w| u128::from(w.balance)).sum()
    }

    pub fn debit(&mut self, address: &str, amount: Amount) -> Result<(), ChainError> {
        let wallet = self
            .wallets
            .get_mut(address)
            .ok_or_else(|| ChainError::UnknownWallet(address.to_string()))?;
        if wallet.balance < amount {
            return Err(ChainError::InsufficientFunds {
                address: address.to_string(),
                available: wallet.balance,
                needed: amount,
            });
        }
        wallet.balance -= amount;
        Ok(())
    }

    /// Puts back a debit that could not be used. Ignores `rejects_deposits`.
    pub fn refund(&mut self, address: &str, amount: Amount) {
        if let Some(wallet) = self.wallets.get_mut(address) {
            wallet.balance = wallet.balance.saturating_add(amount);
        }
    }

    pub fn credit(&mut self, address: &str, amount: Amount) -> Result<(), TransferError> {
        let wallet = self
            .wallets
            .get_mut(address)
            .ok_or_else(|| TransferError(format!("unknown recipient {}", address)))?;
        if wallet.rejects_deposits {
            return Err(TransferError(format!("recipient {} rejects deposits", address)));
        }
        wallet.balance = wallet
            .balance
            .checked_add(amount)
            .ok_or_else(|| TransferError(format!("balance overflow for {}", address)))?;
        Ok(())
    }

    pub fn set_rejects_deposits(&mut self, address: &str, rejects: bool) -> Result<(), ChainError> {
        let wallet = self
            .wallets
            .get_mut(address)
            .ok_or_else(|| ChainError::UnknownWallet(address.to_string()))?;
        wallet.rejects_deposits = rejects;
        Ok(())
    }

    pub fn view_wallets(&self) {
        for wallet in self.get_all_wallets() {
            println!(
                "Address: {} | Balance: {}{}",
                wallet.address,
                crate::task::format_amount(wallet.balance),
                if wallet.rejects_deposits { " | rejects deposits" } else { "" }
            );
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let data = serde_json::to_string(&self.wallets)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Loads wallets from `path`; a missing file yields an empty registry.
    pub fn load(path: &Path, faucet: Amount) -> Result<Self, StoreError> {
        let wallets = match fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { wallets, faucet })
    }
}

impl ValueTransfer for WalletManager {
    fn transfer(
        &mut self,
        _ledger: &mut TaskLedger,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TransferError> {
        self.credit(to, amount)?;
        debug!(to = %to, amount, "custody released to wallet");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::UNIT;

    #[test]
    fn created_wallets_get_the_faucet_amount() {
        let mut wallets = WalletManager::new(10 * UNIT);
        let created = wallets.create_wallet().unwrap();
        assert_eq!(created.wallet.address.len(), 64);
        assert_eq!(created.mnemonic.split_whitespace().count(), 24);
        assert_eq!(wallets.balance(&created.wallet.address), 10 * UNIT);
    }

    #[test]
    fn only_the_wallet_key_authenticates() {
        let mut wallets = WalletManager::new(UNIT);
        let created = wallets.create_wallet().unwrap();
        let address = created.wallet.address.clone();

        assert!(wallets.authenticate(&address, &created.key).is_ok());
        assert_eq!(created.key, wallet_key(&created.mnemonic));
        assert!(matches!(
            wallets.authenticate(&address, "guess"),
            Err(ChainError::Unauthorized(_))
        ));
        assert!(matches!(
            wallets.authenticate("nobody", &created.key),
            Err(ChainError::UnknownWallet(_))
        ));

        wallets.insert(Wallet::new("keyless".to_string(), 1));
        assert!(matches!(
            wallets.authenticate("keyless", ""),
            Err(ChainError::Unauthorized(_))
        ));
    }

    #[test]
    fn debit_rejects_overdraft() {
        let mut wallets = WalletManager::new(0);
        wallets.insert(Wallet::new("alice".to_string(), 5));
        let err = wallets.debit("alice", 6).unwrap_err();
        assert!(matches!(err, ChainError::InsufficientFunds { available: 5, needed: 6, .. }));
        assert!(matches!(wallets.debit("bob", 1), Err(ChainError::UnknownWallet(_))));
        wallets.debit("alice", 5).unwrap();
        assert_eq!(wallets.balance("alice"), 0);
    }

    #[test]
    fn refusing_recipient_fails_transfer_without_credit() {
        let mut wallets = WalletManager::new(0);
        wallets.insert(Wallet::new("alice".to_string(), 1));
        wallets.set_rejects_deposits("alice", true).unwrap();

        let mut ledger = TaskLedger::new();
        assert!(wallets.transfer(&mut ledger, &"alice".to_string(), 4).is_err());
        assert!(wallets.transfer(&mut ledger, &"nobody".to_string(), 4).is_err());
        assert_eq!(wallets.balance("alice"), 1);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallets.json");
        let mut wallets = WalletManager::new(UNIT);
        let created = wallets.create_wallet().unwrap();
        wallets.save(&path).unwrap();

        let loaded = WalletManager::load(&path, UNIT).unwrap();
        assert_eq!(loaded.get_wallet(&created.wallet.address), Some(&created.wallet));
        assert!(loaded.authenticate(&created.wallet.address, &created.key).is_ok());
        assert!(WalletManager::load(&dir.path().join("missing.json"), UNIT)
            .unwrap()
            .get_all_wallets()
            .is_empty());
    }
}
