//! Charge sweep behaviour against the in-memory stores.

mod common;

use common::{dispatcher_settings, eventually, FEE, TOPIC};
use std::collections::HashMap;
use std::sync::Arc;
use subscription_service::billing::ChargeSweep;
use subscription_service::models::{BalanceOperation, BillingRunStatus};
use subscription_service::notification::{
    notification_channel, DispatchWorker, InMemoryBus, MockEmailSender, NotificationDispatcher,
};
use subscription_service::services::{
    InMemoryStore, LedgerStore, PriceCatalog, StaticPriceCatalog, SubscriptionStore,
};
use tokio_util::sync::CancellationToken;

struct Harness {
    store: Arc<InMemoryStore>,
    bus: Arc<InMemoryBus>,
    sweep: ChargeSweep,
    worker: Option<DispatchWorker>,
    shutdown: CancellationToken,
}

fn harness(queue_capacity: usize, catalog: Arc<dyn PriceCatalog>) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let shutdown = CancellationToken::new();
    let (dispatcher, worker): (NotificationDispatcher, DispatchWorker) = notification_channel(
        dispatcher_settings(queue_capacity),
        bus.clone(),
        Arc::new(MockEmailSender::new(true)),
        store.clone(),
        shutdown.clone(),
    );
    let sweep = ChargeSweep::new(store.clone(), store.clone(), catalog, dispatcher);

    Harness {
        store,
        bus,
        sweep,
        worker: Some(worker),
        shutdown,
    }
}

impl Harness {
    fn start_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            tokio::spawn(worker.run());
        }
    }

    async fn subscribe(&self, account_id: &str, balance: u64) {
        self.store
            .create(account_id, 1)
            .await
            .expect("create subscription");
        if balance > 0 {
            self.store.credit(account_id, balance).await.expect("credit");
        }
    }

    async fn is_active(&self, account_id: &str) -> bool {
        self.store
            .get(account_id)
            .await
            .map(|subscription| !subscription.is_deleted)
            .unwrap_or(false)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn one_failing_account_does_not_stop_the_sweep() {
    let mut h = harness(8, Arc::new(StaticPriceCatalog::flat(FEE)));
    h.start_worker();
    h.subscribe("a", 100).await;
    h.subscribe("b", 100).await;
    h.subscribe("c", 100).await;
    h.store.inject_fault("b");

    let report = h.sweep.run(3).await;

    assert_eq!(report.week_number, 3);
    assert_eq!(report.status, BillingRunStatus::Completed);
    assert_eq!(report.processed, 3);
    assert_eq!(report.charged, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.insufficient_funds, 0);

    h.store.clear_faults();
    assert_eq!(h.store.balance("a").await.unwrap(), 100 - FEE);
    assert_eq!(h.store.balance("b").await.unwrap(), 100);
    assert_eq!(h.store.balance("c").await.unwrap(), 100 - FEE);
    assert!(h.is_active("b").await);
    assert!(h.bus.published(TOPIC).is_empty());
}

#[tokio::test]
async fn balance_equal_to_fee_cancels_and_notifies() {
    let mut h = harness(8, Arc::new(StaticPriceCatalog::flat(FEE)));
    h.start_worker();
    h.subscribe("exact", FEE).await;
    h.subscribe("rich", FEE + 1).await;
    h.subscribe("empty", 0).await;

    let report = h.sweep.run(3).await;

    assert_eq!(report.processed, 3);
    assert_eq!(report.charged, 1);
    assert_eq!(report.insufficient_funds, 2);
    assert_eq!(report.cancelled, 2);

    assert!(!h.is_active("exact").await);
    assert!(!h.is_active("empty").await);
    assert!(h.is_active("rich").await);

    // Declined debits leave the ledger untouched
    assert_eq!(h.store.balance("exact").await.unwrap(), FEE);
    assert_eq!(h.store.full_history("exact").len(), 1);

    let rich = h.store.full_history("rich");
    assert_eq!(rich.len(), 2);
    assert_eq!(rich[1].operation, BalanceOperation::Debit);
    assert_eq!(h.store.balance("rich").await.unwrap(), 1);

    let bus = &h.bus;
    assert!(eventually(|| async move { bus.published(TOPIC).len() == 2 }).await);
    let mut published = bus.published(TOPIC);
    published.sort();
    assert_eq!(published, vec!["empty".to_string(), "exact".to_string()]);
}

#[tokio::test]
async fn full_queue_spills_to_outbox_and_still_cancels() {
    // Worker never started: the single queue slot fills immediately
    let h = harness(1, Arc::new(StaticPriceCatalog::flat(FEE)));
    h.subscribe("x", 0).await;
    h.subscribe("y", 0).await;
    h.subscribe("z", 0).await;

    let report = h.sweep.run(3).await;

    assert_eq!(report.insufficient_funds, 3);
    assert_eq!(report.cancelled, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(h.store.pending_outbox_len(), 2);
    for account in ["x", "y", "z"] {
        assert!(!h.is_active(account).await);
    }
}

#[tokio::test]
async fn cancelled_subscriptions_are_not_charged() {
    let mut h = harness(8, Arc::new(StaticPriceCatalog::flat(FEE)));
    h.start_worker();
    h.subscribe("stays", 50).await;
    h.subscribe("leaves", 50).await;
    h.store.cancel("leaves").await.expect("cancel");

    let report = h.sweep.run(4).await;

    assert_eq!(report.processed, 1);
    assert_eq!(report.charged, 1);
    assert_eq!(h.store.balance("leaves").await.unwrap(), 50);
    assert_eq!(h.store.balance("stays").await.unwrap(), 50 - FEE);
}

#[tokio::test]
async fn missing_price_is_counted_as_failure() {
    let catalog = StaticPriceCatalog::new(HashMap::new(), None).with_price(1, FEE);
    let mut h = harness(8, Arc::new(catalog));
    h.start_worker();
    h.subscribe("priced", 100).await;
    h.store.create("unpriced", 99).await.expect("create");
    h.store.credit("unpriced", 100).await.expect("credit");

    let report = h.sweep.run(3).await;

    assert_eq!(report.processed, 2);
    assert_eq!(report.charged, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(h.store.balance("unpriced").await.unwrap(), 100);
    assert!(h.is_active("unpriced").await);
}

#[tokio::test]
async fn second_sweep_charges_again() {
    let mut h = harness(8, Arc::new(StaticPriceCatalog::flat(FEE)));
    h.start_worker();
    h.subscribe("twice", 25).await;

    h.sweep.run(3).await;
    let report = h.sweep.run(3).await;

    // Duplicate weeks are guarded by the billing run store, not the sweep
    assert_eq!(report.charged, 1);
    assert_eq!(h.store.balance("twice").await.unwrap(), 25 - 2 * FEE);
}

#[tokio::test]
async fn undeliverable_notification_keeps_the_subscription() {
    let mut h = harness(1, Arc::new(StaticPriceCatalog::flat(FEE)));
    // No consumer: the queue is closed and every notification must go to the outbox
    drop(h.worker.take());
    h.store.set_outbox_unavailable(true);
    h.subscribe("stranded", 0).await;

    let report = h.sweep.run(3).await;

    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.cancelled, 0);
    assert_eq!(report.insufficient_funds, 0);
    assert!(h.is_active("stranded").await);
    assert_eq!(h.store.pending_outbox_len(), 0);

    // Once the outbox is back the next sweep notifies and cancels
    h.store.set_outbox_unavailable(false);
    let retry = h.sweep.run(4).await;
    assert_eq!(retry.cancelled, 1);
    assert!(!h.is_active("stranded").await);
    assert_eq!(h.store.pending_outbox_len(), 1);
}
