//! In-memory implementation of every store, for tests and local runs.

use crate::error::{BillingError, BillingResult};
use crate::models::{
    stored_amount, ActiveSubscription, BalanceOperation, BillingRun, HistoryEntry, OutboxEntry,
    Subscription, SweepReport, HISTORY_PAGE_SIZE,
};
use crate::services::store::{BillingRunStore, LedgerStore, NotificationOutbox, SubscriptionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    balances: HashMap<String, u64>,
    history: Vec<HistoryEntry>,
    next_entry_id: i64,
    subscriptions: BTreeMap<String, Subscription>,
    runs: HashMap<u64, BillingRun>,
    outbox: Vec<StoredOutboxEntry>,
    next_outbox_id: i64,
    faulty_accounts: HashSet<String>,
    outbox_unavailable: bool,
}

struct StoredOutboxEntry {
    entry: OutboxEntry,
    delivered_utc: Option<DateTime<Utc>>,
}

/// Shared-state store guarded by a single mutex, so every operation is atomic.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> BillingResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| {
            BillingError::StoreUnavailable(anyhow::anyhow!("in-memory store lock poisoned"))
        })
    }

    /// Make every ledger call for `account_id` fail as if the store were unreachable.
    pub fn inject_fault(&self, account_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.faulty_accounts.insert(account_id.to_string());
        }
    }

    /// Make outbox writes fail as if the store were unreachable.
    pub fn set_outbox_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.outbox_unavailable = unavailable;
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.faulty_accounts.clear();
            state.outbox_unavailable = false;
        }
    }

    /// Full history of an account, oldest first.
    pub fn full_history(&self, account_id: &str) -> Vec<HistoryEntry> {
        self.state
            .lock()
            .map(|state| {
                state
                    .history
                    .iter()
                    .filter(|entry| entry.account_id == account_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of outbox entries not yet delivered.
    pub fn pending_outbox_len(&self) -> usize {
        self.state
            .lock()
            .map(|state| {
                state
                    .outbox
                    .iter()
                    .filter(|stored| stored.delivered_utc.is_none())
                    .count()
            })
            .unwrap_or_default()
    }

    pub fn run_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.runs.len())
            .unwrap_or_default()
    }
}

fn check_fault(state: &MemoryState, account_id: &str) -> BillingResult<()> {
    if state.faulty_accounts.contains(account_id) {
        return Err(BillingError::StoreUnavailable(anyhow::anyhow!(
            "simulated store fault for account {}",
            account_id
        )));
    }
    Ok(())
}

fn append_history(state: &mut MemoryState, account_id: &str, amount: u64, operation: BalanceOperation) {
    state.next_entry_id += 1;
    let entry = HistoryEntry {
        entry_id: state.next_entry_id,
        account_id: account_id.to_string(),
        amount,
        operation,
        made_at: Utc::now(),
    };
    state.history.push(entry);
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn credit(&self, account_id: &str, amount: u64) -> BillingResult<u64> {
        stored_amount(amount)?;
        let mut state = self.state()?;
        check_fault(&state, account_id)?;

        let current = state.balances.get(account_id).copied().unwrap_or(0);
        let updated = current
            .checked_add(amount)
            .filter(|balance| i64::try_from(*balance).is_ok())
            .ok_or_else(|| {
                BillingError::InvalidArgument(format!(
                    "crediting {} would overflow the balance of {}",
                    amount, account_id
                ))
            })?;

        state.balances.insert(account_id.to_string(), updated);
        append_history(&mut state, account_id, amount, BalanceOperation::Replenishment);
        Ok(updated)
    }

    async fn debit(&self, account_id: &str, amount: u64) -> BillingResult<u64> {
        stored_amount(amount)?;
        let mut state = self.state()?;
        check_fault(&state, account_id)?;

        let updated = match state.balances.get(account_id) {
            Some(current) if *current > amount => current - amount,
            _ => {
                return Err(BillingError::InsufficientFunds {
                    account: account_id.to_string(),
                })
            }
        };

        state.balances.insert(account_id.to_string(), updated);
        append_history(&mut state, account_id, amount, BalanceOperation::Debit);
        Ok(updated)
    }

    async fn balance(&self, account_id: &str) -> BillingResult<u64> {
        let state = self.state()?;
        check_fault(&state, account_id)?;
        state
            .balances
            .get(account_id)
            .copied()
            .ok_or_else(|| BillingError::NoBalance {
                account: account_id.to_string(),
            })
    }

    async fn read_history(&self, account_id: &str, page: u64) -> BillingResult<Vec<HistoryEntry>> {
        if page == 0 {
            return Err(BillingError::InvalidArgument(
                "page must be at least 1".to_string(),
            ));
        }
        let state = self.state()?;
        check_fault(&state, account_id)?;

        let mut entries: Vec<&HistoryEntry> = state
            .history
            .iter()
            .filter(|entry| entry.account_id == account_id)
            .collect();
        entries.sort_by(|a, b| {
            b.made_at
                .cmp(&a.made_at)
                .then_with(|| b.entry_id.cmp(&a.entry_id))
        });

        let skip = (page - 1)
            .checked_mul(HISTORY_PAGE_SIZE)
            .and_then(|skip| usize::try_from(skip).ok())
            .unwrap_or(usize::MAX);
        let page_entries: Vec<HistoryEntry> = entries
            .into_iter()
            .skip(skip)
            .take(HISTORY_PAGE_SIZE as usize)
            .cloned()
            .collect();

        if page_entries.is_empty() {
            return Err(BillingError::NoHistory {
                account: account_id.to_string(),
                page,
            });
        }
        Ok(page_entries)
    }

    async fn health_check(&self) -> BillingResult<()> {
        self.state().map(|_| ())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn create(&self, account_id: &str, bundle_id: i64) -> BillingResult<Subscription> {
        let mut state = self.state()?;
        if let Some(existing) = state.subscriptions.get(account_id) {
            if !existing.is_deleted {
                return Err(BillingError::AlreadyActive {
                    account: account_id.to_string(),
                });
            }
        }

        let now = Utc::now();
        let subscription = Subscription {
            account_id: account_id.to_string(),
            bundle_id,
            is_deleted: false,
            created_utc: now,
            updated_utc: now,
        };
        state
            .subscriptions
            .insert(account_id.to_string(), subscription.clone());
        Ok(subscription)
    }

    async fn get(&self, account_id: &str) -> BillingResult<Subscription> {
        let state = self.state()?;
        state
            .subscriptions
            .get(account_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound {
                account: account_id.to_string(),
            })
    }

    async fn change_bundle(&self, account_id: &str, bundle_id: i64) -> BillingResult<Subscription> {
        let mut state = self.state()?;
        match state.subscriptions.get_mut(account_id) {
            Some(subscription) if !subscription.is_deleted => {
                subscription.bundle_id = bundle_id;
                subscription.updated_utc = Utc::now();
                Ok(subscription.clone())
            }
            _ => Err(BillingError::NotFound {
                account: account_id.to_string(),
            }),
        }
    }

    async fn cancel(&self, account_id: &str) -> BillingResult<Subscription> {
        let mut state = self.state()?;
        match state.subscriptions.get_mut(account_id) {
            Some(subscription) if !subscription.is_deleted => {
                subscription.is_deleted = true;
                subscription.updated_utc = Utc::now();
                Ok(subscription.clone())
            }
            _ => Err(BillingError::NotFound {
                account: account_id.to_string(),
            }),
        }
    }

    async fn list_active(&self) -> BillingResult<Vec<ActiveSubscription>> {
        let state = self.state()?;
        Ok(state
            .subscriptions
            .values()
            .filter(|subscription| !subscription.is_deleted)
            .map(|subscription| ActiveSubscription {
                account_id: subscription.account_id.clone(),
                bundle_id: subscription.bundle_id,
            })
            .collect())
    }
}

#[async_trait]
impl BillingRunStore for InMemoryStore {
    async fn begin_run(&self, week_number: u64) -> BillingResult<Option<BillingRun>> {
        let week = i64::try_from(week_number).map_err(|_| {
            BillingError::InvalidArgument(format!("week number {} is out of range", week_number))
        })?;
        let mut state = self.state()?;
        if state.runs.contains_key(&week_number) {
            return Ok(None);
        }

        let run = BillingRun {
            run_id: Uuid::new_v4(),
            week_number: week,
            status: "running".to_string(),
            started_utc: Utc::now(),
            completed_utc: None,
            processed: 0,
            charged: 0,
            insufficient_funds: 0,
            cancelled: 0,
            failed: 0,
        };
        state.runs.insert(week_number, run.clone());
        Ok(Some(run))
    }

    async fn complete_run(&self, run_id: Uuid, report: &SweepReport) -> BillingResult<BillingRun> {
        let counts = report.row_counts()?;
        let mut state = self.state()?;
        let run = state
            .runs
            .values_mut()
            .find(|run| run.run_id == run_id)
            .ok_or_else(|| {
                BillingError::StoreUnavailable(anyhow::anyhow!("Billing run {} disappeared", run_id))
            })?;

        run.status = report.status.as_str().to_string();
        run.completed_utc = Some(report.completed_utc);
        run.processed = counts.processed;
        run.charged = counts.charged;
        run.insufficient_funds = counts.insufficient_funds;
        run.cancelled = counts.cancelled;
        run.failed = counts.failed;
        Ok(run.clone())
    }

    async fn latest_run(&self) -> BillingResult<Option<BillingRun>> {
        let state = self.state()?;
        Ok(state
            .runs
            .values()
            .max_by_key(|run| run.week_number)
            .cloned())
    }
}

#[async_trait]
impl NotificationOutbox for InMemoryStore {
    async fn store(&self, account_id: &str, topic: &str, reason: &str) -> BillingResult<i64> {
        let mut state = self.state()?;
        if state.outbox_unavailable {
            return Err(BillingError::StoreUnavailable(anyhow::anyhow!(
                "simulated outbox fault for account {}",
                account_id
            )));
        }
        state.next_outbox_id += 1;
        let outbox_id = state.next_outbox_id;
        state.outbox.push(StoredOutboxEntry {
            entry: OutboxEntry {
                outbox_id,
                account_id: account_id.to_string(),
                topic: topic.to_string(),
                attempts: 0,
                last_error: Some(reason.to_string()),
                created_utc: Utc::now(),
            },
            delivered_utc: None,
        });
        Ok(outbox_id)
    }

    async fn pending(&self, limit: i64) -> BillingResult<Vec<OutboxEntry>> {
        let state = self.state()?;
        Ok(state
            .outbox
            .iter()
            .filter(|stored| stored.delivered_utc.is_none())
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|stored| stored.entry.clone())
            .collect())
    }

    async fn mark_delivered(&self, outbox_id: i64) -> BillingResult<()> {
        let mut state = self.state()?;
        if let Some(stored) = state
            .outbox
            .iter_mut()
            .find(|stored| stored.entry.outbox_id == outbox_id)
        {
            stored.entry.attempts += 1;
            stored.delivered_utc = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_failure(&self, outbox_id: i64, error: &str) -> BillingResult<()> {
        let mut state = self.state()?;
        if let Some(stored) = state
            .outbox
            .iter_mut()
            .find(|stored| stored.entry.outbox_id == outbox_id)
        {
            stored.entry.attempts += 1;
            stored.entry.last_error = Some(error.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = "gopher@example.com";

    #[tokio::test]
    async fn balance_equal_to_fee_is_insufficient() {
        let store = InMemoryStore::new();
        store.credit(ACCOUNT, 100).await.unwrap();

        let result = store.debit(ACCOUNT, 100).await;
        assert!(matches!(result, Err(BillingError::InsufficientFunds { .. })));
        assert_eq!(store.balance(ACCOUNT).await.unwrap(), 100);
        assert_eq!(store.full_history(ACCOUNT).len(), 1);
    }

    #[tokio::test]
    async fn fee_plus_one_leaves_one() {
        let store = InMemoryStore::new();
        store.credit(ACCOUNT, 101).await.unwrap();

        assert_eq!(store.debit(ACCOUNT, 100).await.unwrap(), 1);

        let history = store.read_history(ACCOUNT, 1).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].operation, BalanceOperation::Debit);
        assert_eq!(history[0].amount, 100);
        assert_eq!(history[1].operation, BalanceOperation::Replenishment);
        assert_eq!(history[1].amount, 101);
    }

    #[tokio::test]
    async fn debit_without_balance_is_insufficient() {
        let store = InMemoryStore::new();
        let result = store.debit(ACCOUNT, 1).await;
        assert!(matches!(result, Err(BillingError::InsufficientFunds { .. })));
        assert!(matches!(
            store.balance(ACCOUNT).await,
            Err(BillingError::NoBalance { .. })
        ));
    }

    #[tokio::test]
    async fn replayed_history_matches_balance() {
        let store = InMemoryStore::new();
        let operations: [(bool, u64); 8] = [
            (true, 50),
            (false, 20),
            (false, 40),
            (true, 7),
            (false, 30),
            (false, 6),
            (true, 1),
            (false, 1),
        ];
        for (is_credit, amount) in operations {
            let _ = if is_credit {
                store.credit(ACCOUNT, amount).await
            } else {
                store.debit(ACCOUNT, amount).await
            };
        }

        let replayed: i128 = store
            .full_history(ACCOUNT)
            .iter()
            .map(|entry| match entry.operation {
                BalanceOperation::Replenishment => entry.amount as i128,
                BalanceOperation::Debit => -(entry.amount as i128),
            })
            .sum();
        let balance = store.balance(ACCOUNT).await.unwrap();
        assert!(replayed >= 0);
        assert_eq!(replayed, balance as i128);
    }

    #[tokio::test]
    async fn history_pages_are_stable_and_bounded() {
        let store = InMemoryStore::new();
        for amount in 1..=20u64 {
            store.credit(ACCOUNT, amount).await.unwrap();
        }

        let first = store.read_history(ACCOUNT, 1).await.unwrap();
        assert_eq!(first.len(), HISTORY_PAGE_SIZE as usize);
        assert_eq!(first[0].amount, 20);
        assert_eq!(first, store.read_history(ACCOUNT, 1).await.unwrap());

        let second = store.read_history(ACCOUNT, 2).await.unwrap();
        assert_eq!(second.len(), 5);
        assert_eq!(second.last().unwrap().amount, 1);

        assert!(matches!(
            store.read_history(ACCOUNT, 3).await,
            Err(BillingError::NoHistory { page: 3, .. })
        ));
        assert!(matches!(
            store.read_history("nobody@example.com", 1).await,
            Err(BillingError::NoHistory { .. })
        ));
        assert!(matches!(
            store.read_history(ACCOUNT, 0).await,
            Err(BillingError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn create_after_cancel_reactivates() {
        let store = InMemoryStore::new();
        store.create(ACCOUNT, 1).await.unwrap();
        assert!(matches!(
            store.create(ACCOUNT, 2).await,
            Err(BillingError::AlreadyActive { .. })
        ));

        let cancelled = store.cancel(ACCOUNT).await.unwrap();
        assert!(cancelled.is_deleted);
        assert!(matches!(
            store.cancel(ACCOUNT).await,
            Err(BillingError::NotFound { .. })
        ));

        let renewed = store.create(ACCOUNT, 2).await.unwrap();
        assert_eq!(renewed.bundle_id, 2);
        assert!(!renewed.is_deleted);
    }

    #[tokio::test]
    async fn list_active_skips_cancelled() {
        let store = InMemoryStore::new();
        store.create("a@example.com", 1).await.unwrap();
        store.create("b@example.com", 2).await.unwrap();
        store.cancel("a@example.com").await.unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(
            active,
            vec![ActiveSubscription {
                account_id: "b@example.com".to_string(),
                bundle_id: 2
            }]
        );
    }

    #[tokio::test]
    async fn billing_week_runs_once() {
        let store = InMemoryStore::new();
        let run = store.begin_run(3).await.unwrap().unwrap();
        assert!(store.begin_run(3).await.unwrap().is_none());

        let report = SweepReport::new(3, run.started_utc)
            .finish(crate::models::BillingRunStatus::Completed);
        let completed = store.complete_run(run.run_id, &report).await.unwrap();
        assert_eq!(completed.status, "completed");
        assert_eq!(
            store.latest_run().await.unwrap().unwrap().run_id,
            run.run_id
        );
    }

    #[tokio::test]
    async fn outbox_tracks_pending_entries() {
        let store = InMemoryStore::new();
        let first = store.store("a@example.com", "cancel-subscription", "queue full").await.unwrap();
        store.store("b@example.com", "cancel-subscription", "queue full").await.unwrap();

        store.record_failure(first, "bus down").await.unwrap();
        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("bus down"));

        store.mark_delivered(first).await.unwrap();
        assert_eq!(store.pending_outbox_len(), 1);
    }
}
