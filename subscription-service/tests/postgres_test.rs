//! PostgreSQL store tests. Skipped unless TEST_DATABASE_URL is set.

mod common;

use common::{drop_schema, postgres_database, TOPIC};
use subscription_service::error::BillingError;
use subscription_service::models::{BalanceOperation, BillingRunStatus, SweepReport};
use subscription_service::services::{
    BillingRunStore, LedgerStore, NotificationOutbox, SubscriptionStore,
};

macro_rules! require_database {
    () => {
        match postgres_database().await {
            Some(db) => db,
            None => {
                eprintln!("TEST_DATABASE_URL not set, skipping");
                return;
            }
        }
    };
}

#[tokio::test]
async fn debit_requires_balance_above_amount() {
    let (db, schema) = require_database!();

    db.credit("equal", 100).await.expect("credit");
    let err = db.debit("equal", 100).await.unwrap_err();
    assert!(matches!(err, BillingError::InsufficientFunds { .. }));
    assert_eq!(db.balance("equal").await.unwrap(), 100);

    db.credit("above", 101).await.expect("credit");
    assert_eq!(db.debit("above", 100).await.unwrap(), 1);

    let history = db.read_history("above", 1).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].operation, BalanceOperation::Debit);
    assert_eq!(history[0].amount, 100);
    assert_eq!(history[1].operation, BalanceOperation::Replenishment);
    assert_eq!(history[1].amount, 101);

    assert!(matches!(
        db.debit("nobody", 1).await.unwrap_err(),
        BillingError::InsufficientFunds { .. }
    ));
    assert!(matches!(
        db.read_history("nobody", 1).await.unwrap_err(),
        BillingError::NoHistory { .. }
    ));

    drop_schema(&schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_take_the_balance_once() {
    let (db, schema) = require_database!();
    db.credit("race", 15).await.expect("credit");

    let debits: Vec<_> = (0..8)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move { db.debit("race", 10).await })
        })
        .collect();

    let mut succeeded = 0;
    for debit in debits {
        match debit.await.expect("debit task") {
            Ok(remaining) => {
                assert_eq!(remaining, 5);
                succeeded += 1;
            }
            Err(err) => assert!(matches!(err, BillingError::InsufficientFunds { .. })),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(db.balance("race").await.unwrap(), 5);
    assert_eq!(db.read_history("race", 1).await.unwrap().len(), 2);

    drop_schema(&schema).await;
}

#[tokio::test]
async fn subscription_can_be_recreated_after_cancel() {
    let (db, schema) = require_database!();

    db.create("acct", 1).await.expect("create");
    assert!(matches!(
        db.create("acct", 2).await.unwrap_err(),
        BillingError::AlreadyActive { .. }
    ));

    db.cancel("acct").await.expect("cancel");
    assert!(matches!(
        db.cancel("acct").await.unwrap_err(),
        BillingError::NotFound { .. }
    ));
    assert!(db.list_active().await.unwrap().is_empty());

    let recreated = db.create("acct", 3).await.expect("re-create");
    assert!(!recreated.is_deleted);
    assert_eq!(recreated.bundle_id, 3);

    let changed = db.change_bundle("acct", 5).await.expect("change");
    assert_eq!(changed.bundle_id, 5);
    let active = db.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].bundle_id, 5);

    drop_schema(&schema).await;
}

#[tokio::test]
async fn billing_run_is_claimed_once_per_week() {
    let (db, schema) = require_database!();

    let run = db
        .begin_run(3)
        .await
        .expect("begin run")
        .expect("first claim");
    assert!(db.begin_run(3).await.expect("begin run").is_none());

    let report = SweepReport::new(3, run.started_utc).finish(BillingRunStatus::Completed);
    let completed = db.complete_run(run.run_id, &report).await.expect("complete");
    assert_eq!(completed.parsed_status(), BillingRunStatus::Completed);

    let latest = db.latest_run().await.unwrap().expect("latest run");
    assert_eq!(latest.week_number, 3);
    assert!(latest.completed_utc.is_some());

    drop_schema(&schema).await;
}

#[tokio::test]
async fn outbox_entries_stay_pending_until_delivered() {
    let (db, schema) = require_database!();

    let first = db.store("a", TOPIC, "queue full").await.expect("store");
    let second = db.store("b", TOPIC, "queue full").await.expect("store");

    db.record_failure(first, "bus unavailable").await.expect("record failure");
    db.mark_delivered(second).await.expect("mark delivered");

    let pending = db.pending(10).await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].outbox_id, first);
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[0].last_error.as_deref(), Some("bus unavailable"));

    drop_schema(&schema).await;
}
