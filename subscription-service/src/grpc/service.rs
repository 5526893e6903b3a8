//! SubscriptionService gRPC implementation.

use crate::billing::WeekHandle;
use crate::error::BillingError;
use crate::grpc::proto::subscription_service_server::SubscriptionService;
use crate::grpc::proto::*;
use crate::models::BillingRun;
use crate::services::metrics::{
    record_balance_operation, record_error, record_grpc_request, record_grpc_request_duration,
    record_subscription_operation,
};
use crate::services::store::{BillingRunStore, LedgerStore, SubscriptionStore};
use prost_types::Timestamp;
use service_core::error::AppError;
use service_core::grpc::IntoStatus;
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};

/// SubscriptionService implementation.
pub struct SubscriptionServiceImpl {
    ledger: Arc<dyn LedgerStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    runs: Arc<dyn BillingRunStore>,
    week: WeekHandle,
}

impl SubscriptionServiceImpl {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        runs: Arc<dyn BillingRunStore>,
        week: WeekHandle,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            runs,
            week,
        }
    }
}

fn datetime_to_timestamp(dt: chrono::DateTime<chrono::Utc>) -> Option<Timestamp> {
    Some(Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    })
}

fn subscription_to_proto(s: crate::models::Subscription) -> Subscription {
    Subscription {
        account_id: s.account_id,
        bundle_id: s.bundle_id,
        is_deleted: s.is_deleted,
        created_at: datetime_to_timestamp(s.created_utc),
        updated_at: datetime_to_timestamp(s.updated_utc),
    }
}

fn history_to_proto(e: crate::models::HistoryEntry) -> HistoryEntry {
    HistoryEntry {
        account_id: e.account_id,
        amount: e.amount,
        operation: e.operation.to_proto(),
        made_at: datetime_to_timestamp(e.made_at),
    }
}

fn billing_run_to_proto(run: BillingRun) -> SweepReport {
    SweepReport {
        run_id: run.run_id.to_string(),
        week_number: u64::try_from(run.week_number).unwrap_or_default(),
        status: run.parsed_status().as_str().to_string(),
        processed: u32::try_from(run.processed).unwrap_or_default(),
        charged: u32::try_from(run.charged).unwrap_or_default(),
        insufficient_funds: u32::try_from(run.insufficient_funds).unwrap_or_default(),
        cancelled: u32::try_from(run.cancelled).unwrap_or_default(),
        failed: u32::try_from(run.failed).unwrap_or_default(),
        started_at: datetime_to_timestamp(run.started_utc),
        completed_at: run.completed_utc.and_then(datetime_to_timestamp),
    }
}

fn account_id(raw: String) -> Result<String, BillingError> {
    let account_id = raw.trim().to_string();
    if account_id.is_empty() {
        return Err(BillingError::InvalidArgument(
            "account_id must not be empty".to_string(),
        ));
    }
    Ok(account_id)
}

fn status_label(err: &BillingError) -> &'static str {
    match err {
        BillingError::NotFound { .. }
        | BillingError::NoHistory { .. }
        | BillingError::NoBalance { .. } => "not_found",
        BillingError::AlreadyActive { .. } => "already_exists",
        BillingError::InvalidArgument(_) => "invalid_argument",
        BillingError::InsufficientFunds { .. } => "failed_precondition",
        BillingError::StoreUnavailable(_) => "unavailable",
        BillingError::Configuration(_) | BillingError::Catalog(_) => "error",
    }
}

/// Record metrics for a failed call and convert the error for the client.
fn fail(method: &str, start: Instant, err: BillingError) -> Status {
    let label = status_label(&err);
    if matches!(label, "unavailable" | "error") {
        tracing::error!(method = method, error = %err, "Request failed");
        record_error(err.kind(), method);
    } else {
        tracing::debug!(method = method, error = %err, "Request rejected");
    }
    record_grpc_request(method, label);
    record_grpc_request_duration(method, start.elapsed().as_secs_f64());
    AppError::from(err).into_status()
}

fn succeed(method: &str, start: Instant) {
    record_grpc_request(method, "ok");
    record_grpc_request_duration(method, start.elapsed().as_secs_f64());
}

#[tonic::async_trait]
impl SubscriptionService for SubscriptionServiceImpl {
    // =========================================================================
    // Subscriptions
    // =========================================================================

    #[tracing::instrument(skip(self, request), fields(method = "CreateSubscription"))]
    async fn create_subscription(
        &self,
        request: Request<CreateSubscriptionRequest>,
    ) -> Result<Response<CreateSubscriptionResponse>, Status> {
        let start = Instant::now();
        let method = "CreateSubscription";
        let req = request.into_inner();

        let account_id = account_id(req.account_id).map_err(|e| fail(method, start, e))?;
        tracing::info!(account_id = %account_id, bundle_id = req.bundle_id, "Creating subscription");

        let subscription = self
            .subscriptions
            .create(&account_id, req.bundle_id)
            .await
            .map_err(|e| fail(method, start, e))?;

        record_subscription_operation("created");
        succeed(method, start);

        Ok(Response::new(CreateSubscriptionResponse {
            subscription: Some(subscription_to_proto(subscription)),
        }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "ReadSubscription"))]
    async fn read_subscription(
        &self,
        request: Request<ReadSubscriptionRequest>,
    ) -> Result<Response<ReadSubscriptionResponse>, Status> {
        let start = Instant::now();
        let method = "ReadSubscription";
        let req = request.into_inner();

        let account_id = account_id(req.account_id).map_err(|e| fail(method, start, e))?;
        let subscription = self
            .subscriptions
            .get(&account_id)
            .await
            .map_err(|e| fail(method, start, e))?;

        succeed(method, start);
        Ok(Response::new(ReadSubscriptionResponse {
            subscription: Some(subscription_to_proto(subscription)),
        }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "ChangeSubscription"))]
    async fn change_subscription(
        &self,
        request: Request<ChangeSubscriptionRequest>,
    ) -> Result<Response<ChangeSubscriptionResponse>, Status> {
        let start = Instant::now();
        let method = "ChangeSubscription";
        let req = request.into_inner();

        let account_id = account_id(req.account_id).map_err(|e| fail(method, start, e))?;
        tracing::info!(account_id = %account_id, bundle_id = req.bundle_id, "Changing subscription bundle");

        let subscription = self
            .subscriptions
            .change_bundle(&account_id, req.bundle_id)
            .await
            .map_err(|e| fail(method, start, e))?;

        record_subscription_operation("changed");
        succeed(method, start);

        Ok(Response::new(ChangeSubscriptionResponse {
            subscription: Some(subscription_to_proto(subscription)),
        }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "CancelSubscription"))]
    async fn cancel_subscription(
        &self,
        request: Request<CancelSubscriptionRequest>,
    ) -> Result<Response<CancelSubscriptionResponse>, Status> {
        let start = Instant::now();
        let method = "CancelSubscription";
        let req = request.into_inner();

        let account_id = account_id(req.account_id).map_err(|e| fail(method, start, e))?;
        tracing::info!(account_id = %account_id, "Cancelling subscription");

        let subscription = self
            .subscriptions
            .cancel(&account_id)
            .await
            .map_err(|e| fail(method, start, e))?;

        record_subscription_operation("cancelled");
        succeed(method, start);

        Ok(Response::new(CancelSubscriptionResponse {
            subscription: Some(subscription_to_proto(subscription)),
        }))
    }

    // =========================================================================
    // Balance ledger
    // =========================================================================

    #[tracing::instrument(skip(self, request), fields(method = "AddBalance"))]
    async fn add_balance(
        &self,
        request: Request<AddBalanceRequest>,
    ) -> Result<Response<AddBalanceResponse>, Status> {
        let start = Instant::now();
        let method = "AddBalance";
        let req = request.into_inner();

        let account_id = account_id(req.account_id).map_err(|e| fail(method, start, e))?;
        tracing::info!(account_id = %account_id, amount = req.amount, "Adding balance");

        let balance = self
            .ledger
            .credit(&account_id, req.amount)
            .await
            .map_err(|e| {
                record_balance_operation("replenishment", "error");
                fail(method, start, e)
            })?;

        record_balance_operation("replenishment", "success");
        succeed(method, start);

        Ok(Response::new(AddBalanceResponse { balance }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "ReadUserData"))]
    async fn read_user_data(
        &self,
        request: Request<ReadUserDataRequest>,
    ) -> Result<Response<ReadUserDataResponse>, Status> {
        let start = Instant::now();
        let method = "ReadUserData";
        let req = request.into_inner();

        let account_id = account_id(req.account_id).map_err(|e| fail(method, start, e))?;

        let active_bundle = match self.subscriptions.get(&account_id).await {
            Ok(subscription) if !subscription.is_deleted => Some(subscription.bundle_id),
            Ok(_) | Err(BillingError::NotFound { .. }) => None,
            Err(e) => return Err(fail(method, start, e)),
        };
        let balance = match self.ledger.balance(&account_id).await {
            Ok(balance) => balance,
            Err(BillingError::NoBalance { .. }) => 0,
            Err(e) => return Err(fail(method, start, e)),
        };

        succeed(method, start);
        Ok(Response::new(ReadUserDataResponse {
            bundle_id: active_bundle.unwrap_or_default(),
            has_active_subscription: active_bundle.is_some(),
            balance,
        }))
    }

    #[tracing::instrument(skip(self, request), fields(method = "ReadBalanceHistory"))]
    async fn read_balance_history(
        &self,
        request: Request<ReadBalanceHistoryRequest>,
    ) -> Result<Response<ReadBalanceHistoryResponse>, Status> {
        let start = Instant::now();
        let method = "ReadBalanceHistory";
        let req = request.into_inner();

        let account_id = account_id(req.account_id).map_err(|e| fail(method, start, e))?;
        let history = self
            .ledger
            .read_history(&account_id, req.page)
            .await
            .map_err(|e| fail(method, start, e))?;

        succeed(method, start);
        Ok(Response::new(ReadBalanceHistoryResponse {
            history: history.into_iter().map(history_to_proto).collect(),
            page: req.page,
        }))
    }

    // =========================================================================
    // Scheduler
    // =========================================================================

    #[tracing::instrument(skip(self, _request), fields(method = "GetBillingWeek"))]
    async fn get_billing_week(
        &self,
        _request: Request<GetBillingWeekRequest>,
    ) -> Result<Response<GetBillingWeekResponse>, Status> {
        let start = Instant::now();
        let method = "GetBillingWeek";

        let snapshot = self.week.current();
        let last_sweep = self
            .runs
            .latest_run()
            .await
            .map_err(|e| fail(method, start, e))?;

        succeed(method, start);
        Ok(Response::new(GetBillingWeekResponse {
            week_number: snapshot.week_number,
            phase: snapshot.phase.to_proto(),
            last_sweep: last_sweep.map(billing_run_to_proto),
        }))
    }
}
