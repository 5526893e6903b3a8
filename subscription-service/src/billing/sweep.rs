//! One pass over every active subscription for a billing week.

use crate::error::{BillingError, BillingResult};
use crate::models::{ActiveSubscription, BillingRunStatus, SweepReport};
use crate::notification::NotificationDispatcher;
use crate::services::catalog::PriceCatalog;
use crate::services::metrics::{record_balance_operation, record_charge, record_sweep_run};
use crate::services::store::{LedgerStore, SubscriptionStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChargeOutcome {
    Charged,
    /// Notification accepted; `cancelled` is false when the account was already cancelled.
    Insufficient { cancelled: bool },
}

#[derive(Clone)]
pub struct ChargeSweep {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn LedgerStore>,
    catalog: Arc<dyn PriceCatalog>,
    notifications: NotificationDispatcher,
}

impl ChargeSweep {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn LedgerStore>,
        catalog: Arc<dyn PriceCatalog>,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            catalog,
            notifications,
        }
    }

    /// Charge every subscription active at the start of the sweep.
    ///
    /// Per-account failures are counted and logged; they never stop the sweep.
    /// Not idempotent: running it twice for the same week charges twice.
    #[instrument(skip(self), fields(week_number = week_number))]
    pub async fn run(&self, week_number: u64) -> SweepReport {
        let mut report = SweepReport::new(week_number, Utc::now());

        let snapshot = match self.subscriptions.list_active().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list active subscriptions, sweep aborted");
                record_sweep_run(BillingRunStatus::Failed.as_str());
                return report.finish(BillingRunStatus::Failed);
            }
        };

        tracing::info!(subscriptions = snapshot.len(), "Charge sweep started");

        for subscription in &snapshot {
            report.processed += 1;
            match self.charge(subscription).await {
                Ok(ChargeOutcome::Charged) => {
                    report.charged += 1;
                    record_charge("charged");
                }
                Ok(ChargeOutcome::Insufficient { cancelled }) => {
                    report.insufficient_funds += 1;
                    record_charge("insufficient_funds");
                    if cancelled {
                        report.cancelled += 1;
                        record_charge("cancelled");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    record_charge("failed");
                    tracing::error!(
                        account_id = %subscription.account_id,
                        bundle_id = subscription.bundle_id,
                        error = %e,
                        error_kind = e.kind(),
                        "Failed to charge subscription, continuing sweep"
                    );
                }
            }
        }

        let report = report.finish(BillingRunStatus::Completed);
        record_sweep_run(report.status.as_str());
        tracing::info!(
            processed = report.processed,
            charged = report.charged,
            insufficient_funds = report.insufficient_funds,
            cancelled = report.cancelled,
            failed = report.failed,
            "Charge sweep completed"
        );
        report
    }

    async fn charge(&self, subscription: &ActiveSubscription) -> BillingResult<ChargeOutcome> {
        let account_id = subscription.account_id.as_str();
        let fee = self.catalog.price(subscription.bundle_id).await?;

        match self.ledger.debit(account_id, fee).await {
            Ok(balance) => {
                record_balance_operation("debit", "success");
                tracing::info!(account_id = %account_id, fee = fee, balance = balance, "Weekly fee charged");
                Ok(ChargeOutcome::Charged)
            }
            Err(BillingError::InsufficientFunds { .. }) => {
                record_balance_operation("debit", "insufficient_funds");
                tracing::info!(account_id = %account_id, fee = fee, "Insufficient funds for weekly fee");

                // Cancel only once the warning is safely queued or stored.
                let enqueued = self.notifications.enqueue(account_id).await?;
                tracing::debug!(account_id = %account_id, ?enqueued, "Insufficient-funds notification accepted");

                match self.subscriptions.cancel(account_id).await {
                    Ok(_) => {
                        tracing::info!(account_id = %account_id, "Subscription cancelled for insufficient funds");
                        Ok(ChargeOutcome::Insufficient { cancelled: true })
                    }
                    Err(BillingError::NotFound { .. }) => {
                        tracing::info!(account_id = %account_id, "Subscription already cancelled");
                        Ok(ChargeOutcome::Insufficient { cancelled: false })
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                record_balance_operation("debit", "error");
                Err(e)
            }
        }
    }
}
