//! Storage seams of the billing engine.
//!
//! `Database` implements every trait against PostgreSQL; `InMemoryStore`
//! implements them for tests and local runs.

use crate::error::BillingResult;
use crate::models::{ActiveSubscription, BillingRun, HistoryEntry, OutboxEntry, Subscription, SweepReport};
use async_trait::async_trait;
use uuid::Uuid;

/// Balance per account plus its append-only history.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Increase the balance, creating it when absent, and record a replenishment.
    /// Returns the new balance.
    async fn credit(&self, account_id: &str, amount: u64) -> BillingResult<u64>;

    /// Decrease the balance only when it strictly exceeds `amount`, and record a debit.
    /// Returns the new balance or `InsufficientFunds` without mutating anything.
    async fn debit(&self, account_id: &str, amount: u64) -> BillingResult<u64>;

    /// Current balance, `NoBalance` if the account was never credited.
    async fn balance(&self, account_id: &str) -> BillingResult<u64>;

    /// Page `page` (1-indexed) of history, newest first.
    async fn read_history(&self, account_id: &str, page: u64) -> BillingResult<Vec<HistoryEntry>>;

    async fn health_check(&self) -> BillingResult<()>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Fails with `AlreadyActive` while an active row exists. Re-activates a cancelled row.
    async fn create(&self, account_id: &str, bundle_id: i64) -> BillingResult<Subscription>;

    /// The subscription row, cancelled or not.
    async fn get(&self, account_id: &str) -> BillingResult<Subscription>;

    async fn change_bundle(&self, account_id: &str, bundle_id: i64) -> BillingResult<Subscription>;

    /// Soft-delete the active subscription, `NotFound` when there is none.
    async fn cancel(&self, account_id: &str) -> BillingResult<Subscription>;

    /// Snapshot of every active subscription.
    async fn list_active(&self) -> BillingResult<Vec<ActiveSubscription>>;
}

#[async_trait]
pub trait BillingRunStore: Send + Sync {
    /// Record the start of the sweep for `week_number`. `None` if that week already has a run.
    async fn begin_run(&self, week_number: u64) -> BillingResult<Option<BillingRun>>;

    async fn complete_run(&self, run_id: Uuid, report: &SweepReport) -> BillingResult<BillingRun>;

    async fn latest_run(&self) -> BillingResult<Option<BillingRun>>;
}

#[async_trait]
pub trait NotificationOutbox: Send + Sync {
    async fn store(&self, account_id: &str, topic: &str, reason: &str) -> BillingResult<i64>;

    /// Undelivered entries, oldest first.
    async fn pending(&self, limit: i64) -> BillingResult<Vec<OutboxEntry>>;

    async fn mark_delivered(&self, outbox_id: i64) -> BillingResult<()>;

    async fn record_failure(&self, outbox_id: i64, error: &str) -> BillingResult<()>;
}
