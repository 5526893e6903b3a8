//! Weekly billing run model.

use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingRunStatus {
    Running,
    Completed,
    Failed,
}

impl BillingRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingRunStatus::Running => "running",
            BillingRunStatus::Completed => "completed",
            BillingRunStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => BillingRunStatus::Completed,
            "failed" => BillingRunStatus::Failed,
            _ => BillingRunStatus::Running,
        }
    }
}

/// Persisted record of the sweep for one billing week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BillingRun {
    pub run_id: Uuid,
    pub week_number: i64,
    pub status: String,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub processed: i32,
    pub charged: i32,
    pub insufficient_funds: i32,
    pub cancelled: i32,
    pub failed: i32,
}

impl BillingRun {
    pub fn parsed_status(&self) -> BillingRunStatus {
        BillingRunStatus::from_string(&self.status)
    }
}

/// Outcome counters of one charge sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub week_number: u64,
    pub status: BillingRunStatus,
    /// Subscriptions in the snapshot that were attempted.
    pub processed: u32,
    pub charged: u32,
    pub insufficient_funds: u32,
    /// Subscriptions cancelled after their notification was accepted.
    pub cancelled: u32,
    /// Accounts skipped because of a store, catalog or dispatcher error.
    pub failed: u32,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: DateTime<Utc>,
}

impl SweepReport {
    pub fn new(week_number: u64, started_utc: DateTime<Utc>) -> Self {
        Self {
            week_number,
            status: BillingRunStatus::Running,
            processed: 0,
            charged: 0,
            insufficient_funds: 0,
            cancelled: 0,
            failed: 0,
            started_utc,
            completed_utc: started_utc,
        }
    }

    pub fn finish(mut self, status: BillingRunStatus) -> Self {
        self.status = status;
        self.completed_utc = Utc::now();
        self
    }

    /// Counters as stored in `billing_runs`, which keeps them as INTEGER columns.
    pub fn row_counts(&self) -> BillingResult<RunCounts> {
        Ok(RunCounts {
            processed: count_to_row("processed", self.processed)?,
            charged: count_to_row("charged", self.charged)?,
            insufficient_funds: count_to_row("insufficient_funds", self.insufficient_funds)?,
            cancelled: count_to_row("cancelled", self.cancelled)?,
            failed: count_to_row("failed", self.failed)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunCounts {
    pub processed: i32,
    pub charged: i32,
    pub insufficient_funds: i32,
    pub cancelled: i32,
    pub failed: i32,
}

fn count_to_row(name: &str, count: u32) -> BillingResult<i32> {
    i32::try_from(count).map_err(|_| {
        BillingError::InvalidArgument(format!("{} count {} is out of range", name, count))
    })
}
