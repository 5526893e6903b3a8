//! Domain models for subscription-service.

mod balance;
mod billing_run;
mod outbox;
mod subscription;

pub use balance::{stored_amount, BalanceOperation, HistoryEntry, HISTORY_PAGE_SIZE};
pub use billing_run::{BillingRun, BillingRunStatus, RunCounts, SweepReport};
pub use outbox::OutboxEntry;
pub use subscription::{ActiveSubscription, Subscription};
