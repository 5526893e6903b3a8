//! PostgreSQL storage for subscription-service.

use crate::error::{BillingError, BillingResult};
use crate::models::{
    stored_amount, ActiveSubscription, BalanceOperation, BillingRun, HistoryEntry, OutboxEntry,
    Subscription, SweepReport, HISTORY_PAGE_SIZE,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{BillingRunStore, LedgerStore, NotificationOutbox, SubscriptionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// SQLSTATE raised when a BIGINT computation overflows.
const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn db_error(action: &str, err: sqlx::Error) -> BillingError {
    BillingError::StoreUnavailable(anyhow::anyhow!("Failed to {}: {}", action, err))
}

fn is_out_of_range(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == NUMERIC_VALUE_OUT_OF_RANGE)
}

#[derive(FromRow)]
struct HistoryRow {
    entry_id: i64,
    account_id: String,
    amount: i64,
    operation: String,
    made_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for HistoryEntry {
    type Error = BillingError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let operation = BalanceOperation::from_string(&row.operation).ok_or_else(|| {
            BillingError::StoreUnavailable(anyhow::anyhow!(
                "Unknown balance operation {:?} in entry {}",
                row.operation,
                row.entry_id
            ))
        })?;
        let amount = u64::try_from(row.amount).map_err(|_| {
            BillingError::StoreUnavailable(anyhow::anyhow!(
                "Negative amount in history entry {}",
                row.entry_id
            ))
        })?;
        Ok(HistoryEntry {
            entry_id: row.entry_id,
            account_id: row.account_id,
            amount,
            operation,
            made_at: row.made_at,
        })
    }
}

fn balance_from_row(account_id: &str, balance: i64) -> BillingResult<u64> {
    u64::try_from(balance).map_err(|_| {
        BillingError::StoreUnavailable(anyhow::anyhow!(
            "Negative balance stored for account {}",
            account_id
        ))
    })
}

fn week_to_row(week_number: u64) -> BillingResult<i64> {
    i64::try_from(week_number).map_err(|_| {
        BillingError::InvalidArgument(format!("week number {} is out of range", week_number))
    })
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> BillingResult<Self> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> BillingResult<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                BillingError::StoreUnavailable(anyhow::anyhow!("Migration failed: {}", e))
            })?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =========================================================================
// Ledger
// =========================================================================

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self), fields(account_id = %account_id, amount = amount))]
    async fn credit(&self, account_id: &str, amount: u64) -> BillingResult<u64> {
        let stored = stored_amount(amount)?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&["credit"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin credit transaction", e))?;

        let balance: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO balances (account_id, current_balance)
            VALUES ($1, $2)
            ON CONFLICT (account_id) DO UPDATE
            SET current_balance = balances.current_balance + EXCLUDED.current_balance,
                updated_utc = NOW()
            RETURNING current_balance
            "#,
        )
        .bind(account_id)
        .bind(stored)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_out_of_range(&e) {
                BillingError::InvalidArgument(format!(
                    "crediting {} would overflow the balance of {}",
                    amount, account_id
                ))
            } else {
                db_error("credit balance", e)
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO balance_history (account_id, amount, operation)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(account_id)
        .bind(stored)
        .bind(BalanceOperation::Replenishment.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("record replenishment", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit credit", e))?;

        timer.observe_duration();
        balance_from_row(account_id, balance)
    }

    #[instrument(skip(self), fields(account_id = %account_id, amount = amount))]
    async fn debit(&self, account_id: &str, amount: u64) -> BillingResult<u64> {
        let stored = stored_amount(amount)?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&["debit"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin debit transaction", e))?;

        // The conditional update holds the row lock, so concurrent debits re-check the guard.
        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE balances
            SET current_balance = current_balance - $1, updated_utc = NOW()
            WHERE account_id = $2 AND current_balance > $1
            RETURNING current_balance
            "#,
        )
        .bind(stored)
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("debit balance", e))?;

        let Some(balance) = balance else {
            tx.rollback()
                .await
                .map_err(|e| db_error("roll back debit", e))?;
            return Err(BillingError::InsufficientFunds {
                account: account_id.to_string(),
            });
        };

        sqlx::query(
            r#"
            INSERT INTO balance_history (account_id, amount, operation)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(account_id)
        .bind(stored)
        .bind(BalanceOperation::Debit.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("record debit", e))?;

        tx.commit().await.map_err(|e| db_error("commit debit", e))?;

        timer.observe_duration();
        balance_from_row(account_id, balance)
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn balance(&self, account_id: &str) -> BillingResult<u64> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["balance"])
            .start_timer();

        let balance: Option<i64> =
            sqlx::query_scalar("SELECT current_balance FROM balances WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("read balance", e))?;

        timer.observe_duration();
        match balance {
            Some(balance) => balance_from_row(account_id, balance),
            None => Err(BillingError::NoBalance {
                account: account_id.to_string(),
            }),
        }
    }

    #[instrument(skip(self), fields(account_id = %account_id, page = page))]
    async fn read_history(&self, account_id: &str, page: u64) -> BillingResult<Vec<HistoryEntry>> {
        if page == 0 {
            return Err(BillingError::InvalidArgument(
                "page must be at least 1".to_string(),
            ));
        }
        let no_history = || BillingError::NoHistory {
            account: account_id.to_string(),
            page,
        };
        let offset = (page - 1)
            .checked_mul(HISTORY_PAGE_SIZE)
            .and_then(|offset| i64::try_from(offset).ok())
            .ok_or_else(no_history)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["read_history"])
            .start_timer();

        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT entry_id, account_id, amount, operation, made_at
            FROM balance_history
            WHERE account_id = $1
            ORDER BY made_at DESC, entry_id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(account_id)
        .bind(HISTORY_PAGE_SIZE as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("read balance history", e))?;

        timer.observe_duration();

        if rows.is_empty() {
            return Err(no_history());
        }
        rows.into_iter().map(HistoryEntry::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> BillingResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("run health check", e))?;

        timer.observe_duration();
        Ok(())
    }
}

// =========================================================================
// Subscriptions
// =========================================================================

#[async_trait]
impl SubscriptionStore for Database {
    #[instrument(skip(self), fields(account_id = %account_id, bundle_id = bundle_id))]
    async fn create(&self, account_id: &str, bundle_id: i64) -> BillingResult<Subscription> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        // A cancelled row is reactivated; an active one makes the upsert return nothing.
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (account_id, bundle_id)
            VALUES ($1, $2)
            ON CONFLICT (account_id) DO UPDATE
            SET bundle_id = EXCLUDED.bundle_id,
                is_deleted = FALSE,
                created_utc = NOW(),
                updated_utc = NOW()
            WHERE subscriptions.is_deleted = TRUE
            RETURNING account_id, bundle_id, is_deleted, created_utc, updated_utc
            "#,
        )
        .bind(account_id)
        .bind(bundle_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("create subscription", e))?;

        timer.observe_duration();
        subscription.ok_or_else(|| BillingError::AlreadyActive {
            account: account_id.to_string(),
        })
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn get(&self, account_id: &str) -> BillingResult<Subscription> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT account_id, bundle_id, is_deleted, created_utc, updated_utc
            FROM subscriptions
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get subscription", e))?;

        timer.observe_duration();
        subscription.ok_or_else(|| BillingError::NotFound {
            account: account_id.to_string(),
        })
    }

    #[instrument(skip(self), fields(account_id = %account_id, bundle_id = bundle_id))]
    async fn change_bundle(&self, account_id: &str, bundle_id: i64) -> BillingResult<Subscription> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["change_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET bundle_id = $2, updated_utc = NOW()
            WHERE account_id = $1 AND is_deleted = FALSE
            RETURNING account_id, bundle_id, is_deleted, created_utc, updated_utc
            "#,
        )
        .bind(account_id)
        .bind(bundle_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("change subscription", e))?;

        timer.observe_duration();
        subscription.ok_or_else(|| BillingError::NotFound {
            account: account_id.to_string(),
        })
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn cancel(&self, account_id: &str) -> BillingResult<Subscription> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET is_deleted = TRUE, updated_utc = NOW()
            WHERE account_id = $1 AND is_deleted = FALSE
            RETURNING account_id, bundle_id, is_deleted, created_utc, updated_utc
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("cancel subscription", e))?;

        timer.observe_duration();
        subscription.ok_or_else(|| BillingError::NotFound {
            account: account_id.to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn list_active(&self) -> BillingResult<Vec<ActiveSubscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_subscriptions"])
            .start_timer();

        let subscriptions = sqlx::query_as::<_, ActiveSubscription>(
            r#"
            SELECT account_id, bundle_id
            FROM subscriptions
            WHERE is_deleted = FALSE
            ORDER BY account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list active subscriptions", e))?;

        timer.observe_duration();
        Ok(subscriptions)
    }
}

// =========================================================================
// Billing runs
// =========================================================================

const BILLING_RUN_COLUMNS: &str = "run_id, week_number, status, started_utc, completed_utc, \
     processed, charged, insufficient_funds, cancelled, failed";

#[async_trait]
impl BillingRunStore for Database {
    #[instrument(skip(self), fields(week_number = week_number))]
    async fn begin_run(&self, week_number: u64) -> BillingResult<Option<BillingRun>> {
        let week = week_to_row(week_number)?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&["begin_billing_run"])
            .start_timer();

        let run = sqlx::query_as::<_, BillingRun>(&format!(
            r#"
            INSERT INTO billing_runs (run_id, week_number)
            VALUES ($1, $2)
            ON CONFLICT (week_number) DO NOTHING
            RETURNING {}
            "#,
            BILLING_RUN_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(week)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("begin billing run", e))?;

        timer.observe_duration();
        Ok(run)
    }

    #[instrument(skip(self, report), fields(run_id = %run_id, week_number = report.week_number))]
    async fn complete_run(&self, run_id: Uuid, report: &SweepReport) -> BillingResult<BillingRun> {
        let counts = report.row_counts()?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_billing_run"])
            .start_timer();

        let run = sqlx::query_as::<_, BillingRun>(&format!(
            r#"
            UPDATE billing_runs
            SET status = $2, completed_utc = $3, processed = $4, charged = $5,
                insufficient_funds = $6, cancelled = $7, failed = $8
            WHERE run_id = $1
            RETURNING {}
            "#,
            BILLING_RUN_COLUMNS
        ))
        .bind(run_id)
        .bind(report.status.as_str())
        .bind(report.completed_utc)
        .bind(counts.processed)
        .bind(counts.charged)
        .bind(counts.insufficient_funds)
        .bind(counts.cancelled)
        .bind(counts.failed)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("complete billing run", e))?;

        timer.observe_duration();
        run.ok_or_else(|| {
            BillingError::StoreUnavailable(anyhow::anyhow!("Billing run {} disappeared", run_id))
        })
    }

    #[instrument(skip(self))]
    async fn latest_run(&self) -> BillingResult<Option<BillingRun>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_billing_run"])
            .start_timer();

        let run = sqlx::query_as::<_, BillingRun>(&format!(
            "SELECT {} FROM billing_runs ORDER BY week_number DESC LIMIT 1",
            BILLING_RUN_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("read latest billing run", e))?;

        timer.observe_duration();
        Ok(run)
    }
}

// =========================================================================
// Notification outbox
// =========================================================================

#[async_trait]
impl NotificationOutbox for Database {
    #[instrument(skip(self, reason), fields(account_id = %account_id, topic = %topic))]
    async fn store(&self, account_id: &str, topic: &str, reason: &str) -> BillingResult<i64> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["store_outbox"])
            .start_timer();

        let outbox_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO notification_outbox (account_id, topic, last_error)
            VALUES ($1, $2, $3)
            RETURNING outbox_id
            "#,
        )
        .bind(account_id)
        .bind(topic)
        .bind(reason)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("store outbox entry", e))?;

        timer.observe_duration();
        Ok(outbox_id)
    }

    #[instrument(skip(self))]
    async fn pending(&self, limit: i64) -> BillingResult<Vec<OutboxEntry>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["pending_outbox"])
            .start_timer();

        let entries = sqlx::query_as::<_, OutboxEntry>(
            r#"
            SELECT outbox_id, account_id, topic, attempts, last_error, created_utc
            FROM notification_outbox
            WHERE delivered_utc IS NULL
            ORDER BY outbox_id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("read pending outbox entries", e))?;

        timer.observe_duration();
        Ok(entries)
    }

    #[instrument(skip(self))]
    async fn mark_delivered(&self, outbox_id: i64) -> BillingResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_outbox_delivered"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE notification_outbox
            SET delivered_utc = NOW(), attempts = attempts + 1
            WHERE outbox_id = $1
            "#,
        )
        .bind(outbox_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark outbox entry delivered", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn record_failure(&self, outbox_id: i64, error: &str) -> BillingResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_outbox_failure"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE notification_outbox
            SET attempts = attempts + 1, last_error = $2
            WHERE outbox_id = $1
            "#,
        )
        .bind(outbox_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("record outbox failure", e))?;

        timer.observe_duration();
        Ok(())
    }
}
