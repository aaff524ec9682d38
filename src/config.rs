//! Node configuration, read from the environment.

use crate::error::ConfigError;
use crate::task::{parse_amount, Amount, UNIT};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding chain.json and wallets.json
    pub data_dir: PathBuf,
    pub api_addr: String,
    /// Gossipsub topic the node publishes ledger notifications on
    pub topic: String,
    /// Starting balance of newly created wallets, in base units.
    /// `TASK_ESCROW_FAUCET` gives it in whole coins, e.g. `10` or `2.5`.
    pub faucet: Amount,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("TASK_ESCROW_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let api_addr = std::env::var("TASK_ESCROW_API_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3030".to_string());

        let topic = std::env::var("TASK_ESCROW_TOPIC")
            .unwrap_or_else(|_| "task-escrow".to_string());
        if topic.is_empty() {
            return Err(ConfigError::InvalidValue(
                "TASK_ESCROW_TOPIC".to_string(),
                "must not be empty".to_string(),
            ));
        }

        let faucet = match std::env::var("TASK_ESCROW_FAUCET") {
            Ok(raw) => parse_faucet(&raw)?,
            Err(_) => 10 * UNIT,
        };

        Ok(Self { data_dir, api_addr, topic, faucet })
    }

    /// Defaults rooted at `data_dir` (useful for testing).
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            api_addr: "127.0.0.1:3030".to_string(),
            topic: "task-escrow".to_string(),
            faucet: 10 * UNIT,
        }
    }
}

/// Parses a coin amount such as `10` or `0.25` into base units.
pub fn parse_faucet(raw: &str) -> Result<Amount, ConfigError> {
    parse_amount(raw).ok_or_else(|| {
        ConfigError::InvalidValue(
            "TASK_ESCROW_FAUCET".to_string(),
            format!("{:?} is not a coin amount", raw),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faucet_is_read_in_coins() {
        assert_eq!(parse_faucet("10").unwrap(), 10 * UNIT);
        assert_eq!(parse_faucet("2.5").unwrap(), 2 * UNIT + UNIT / 2);
        assert!(matches!(parse_faucet("ten"), Err(ConfigError::InvalidValue(..))));
        assert!(parse_faucet("").is_err());
    }
}
