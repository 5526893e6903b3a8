//! Balance ledger model.

use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of history entries returned per page.
pub const HISTORY_PAGE_SIZE: u64 = 15;

/// Kind of balance mutation recorded in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceOperation {
    Replenishment,
    Debit,
}

impl BalanceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceOperation::Replenishment => "replenishment",
            BalanceOperation::Debit => "debit",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "replenishment" => Some(BalanceOperation::Replenishment),
            "debit" => Some(BalanceOperation::Debit),
            _ => None,
        }
    }

    pub fn to_proto(&self) -> i32 {
        match self {
            BalanceOperation::Replenishment => 1,
            BalanceOperation::Debit => 2,
        }
    }
}

/// Immutable record of one balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub entry_id: i64,
    pub account_id: String,
    pub amount: u64,
    pub operation: BalanceOperation,
    pub made_at: DateTime<Utc>,
}

/// Validate a ledger amount and convert it to the stored BIGINT representation.
pub fn stored_amount(amount: u64) -> BillingResult<i64> {
    if amount == 0 {
        return Err(BillingError::InvalidArgument(
            "amount must be greater than zero".to_string(),
        ));
    }
    i64::try_from(amount).map_err(|_| {
        BillingError::InvalidArgument(format!("amount {} exceeds the supported maximum", amount))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_round_trips_through_storage_name() {
        for op in [BalanceOperation::Replenishment, BalanceOperation::Debit] {
            assert_eq!(BalanceOperation::from_string(op.as_str()), Some(op));
        }
        assert_eq!(BalanceOperation::from_string("refund"), None);
    }

    #[test]
    fn zero_and_oversized_amounts_are_rejected() {
        assert!(matches!(
            stored_amount(0),
            Err(BillingError::InvalidArgument(_))
        ));
        assert!(matches!(
            stored_amount(u64::MAX),
            Err(BillingError::InvalidArgument(_))
        ));
        assert_eq!(stored_amount(101).unwrap(), 101);
    }
}
