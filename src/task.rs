use serde::{Serialize, Deserialize};
use std::fmt;

pub type TaskId = u64;
pub type Address = String;
/// Native value in base units.
pub type Amount = u64;

/// Base units per whole coin.
pub const UNIT: Amount = 1_000_000_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Open,
    Accepted,
    Completed,
    Confirmed,
    Cancelled,
}

impl TaskStatus {
    /// Confirmed and Cancelled never transition again.
    pub fn is_terminal(self) -> bool {
        match self {
            TaskStatus::Open | TaskStatus::Accepted | TaskStatus::Completed => false,
            TaskStatus::Confirmed | TaskStatus::Cancelled => true,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Open => "Open",
            TaskStatus::Accepted => "Accepted",
            TaskStatus::Completed => "Completed",
            TaskStatus::Confirmed => "Confirmed",
            TaskStatus::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub poster: Address,
    pub worker: Option<Address>,
    pub description: String,
    pub reward: Amount,
    pub status: TaskStatus,
    pub created_at: i64,
    pub accepted_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn new(id: TaskId, poster: Address, description: String, reward: Amount, created_at: i64) -> Self {
        Self {
            id,
            poster,
            worker: None,
            description,
            reward,
            status: TaskStatus::Open,
            created_at,
            accepted_at: None,
            completed_at: None,
        }
    }

    pub fn is_worker(&self, who: &str) -> bool {
        self.worker.as_deref() == Some(who)
    }
}

/// Formats base units as a decimal coin amount, e.g. `1500000000` -> `1.5`.
pub fn format_amount(amount: Amount) -> String {
    let whole = amount / UNIT;
    let frac = amount % UNIT;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:09}", frac);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Parses a decimal coin amount such as `0.5` into base units.
pub fn parse_amount(input: &str) -> Option<Amount> {
    let input = input.trim();
    let (whole, frac) = match input.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (input, ""),
    };
    if (whole.is_empty() && frac.is_empty()) || frac.len() > 9 {
        return None;
    }
    let whole: Amount = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac: Amount = if frac.is_empty() {
        0
    } else {
        format!("{:0<9}", frac).parse().ok()?
    };
    whole.checked_mul(UNIT)?.checked_add(frac)
}
