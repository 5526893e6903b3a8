//! Application startup and lifecycle management.

use crate::billing::{BillingCalendar, BillingScheduler, ChargeSweep};
use crate::config::SubscriptionConfig;
use crate::grpc::{
    proto::{subscription_service_server::SubscriptionServiceServer, FILE_DESCRIPTOR_SET},
    trace_context_interceptor, SubscriptionServiceImpl,
};
use crate::notification::{
    notification_channel, DispatcherSettings, EmailSender, MessageBus, RedisStreamBus,
    SmtpEmailSender,
};
use crate::services::{
    get_metrics, init_metrics, BillingRunStore, Database, InMemoryStore, LedgerStore,
    NotificationOutbox, PriceCatalog, StaticPriceCatalog, SubscriptionStore,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde_json::json;
use service_core::error::AppError;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server as GrpcServer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Everything the billing engine talks to.
#[derive(Clone)]
pub struct Dependencies {
    pub ledger: Arc<dyn LedgerStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub runs: Arc<dyn BillingRunStore>,
    pub outbox: Arc<dyn NotificationOutbox>,
    pub bus: Arc<dyn MessageBus>,
    pub mailer: Arc<dyn EmailSender>,
    pub catalog: Arc<dyn PriceCatalog>,
}

impl Dependencies {
    /// PostgreSQL stores, Redis Streams bus and SMTP mailer from configuration.
    pub async fn connect(config: &SubscriptionConfig, run_migrations: bool) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            AppError::from(e)
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                AppError::from(e)
            })?;
        }

        let bus = RedisStreamBus::connect(&config.redis.url)
            .await
            .map_err(|e| AppError::BusError(e.to_string()))?;

        let mailer = SmtpEmailSender::new(config.smtp.clone())
            .map_err(|e| AppError::EmailError(e.to_string()))?;

        let db = Arc::new(db);
        Ok(Self {
            ledger: db.clone(),
            subscriptions: db.clone(),
            runs: db.clone(),
            outbox: db,
            bus: Arc::new(bus),
            mailer: Arc::new(mailer),
            catalog: Arc::new(StaticPriceCatalog::from_config(&config.billing)),
        })
    }

    /// All four stores backed by one in-memory store.
    pub fn in_memory(
        store: Arc<InMemoryStore>,
        bus: Arc<dyn MessageBus>,
        mailer: Arc<dyn EmailSender>,
        catalog: Arc<dyn PriceCatalog>,
    ) -> Self {
        Self {
            ledger: store.clone(),
            subscriptions: store.clone(),
            runs: store.clone(),
            outbox: store,
            bus,
            mailer,
            catalog,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SubscriptionConfig,
    pub deps: Dependencies,
    pub calendar: BillingCalendar,
    pub started_at: DateTime<Utc>,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    ledger: Arc<dyn LedgerStore>,
    bus: Arc<dyn MessageBus>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.ledger.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "subscription-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "subscription-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes. Requires the store and the bus.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    if let Err(e) = state.ledger.health_check().await {
        tracing::warn!(error = %e, "Readiness check failed - database unavailable");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if let Err(e) = state.bus.health_check().await {
        tracing::warn!(error = %e, "Readiness check failed - message bus unavailable");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    tracing::debug!("Readiness check passed");
    StatusCode::OK
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    grpc_port: u16,
    http_listener: TcpListener,
    grpc_listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: SubscriptionConfig) -> Result<Self, AppError> {
        init_metrics();
        let deps = Dependencies::connect(&config, true).await?;
        Self::build_with(config, deps, Utc::now()).await
    }

    /// Build around already constructed dependencies. `started_at` seeds the week counter.
    pub async fn build_with(
        config: SubscriptionConfig,
        deps: Dependencies,
        started_at: DateTime<Utc>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let calendar = BillingCalendar::new(config.billing.anchor_date, started_at).map_err(|e| {
            tracing::error!(error = %e, "Invalid billing anchor");
            AppError::from(e)
        })?;

        // Bind HTTP listener
        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        // Bind gRPC listener (port + 1)
        let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.common.grpc_port()));
        let grpc_listener = TcpListener::bind(grpc_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %grpc_addr, "Failed to bind gRPC listener");
            AppError::from(e)
        })?;
        let grpc_port = grpc_listener.local_addr()?.port();

        tracing::info!(
            http_port = http_port,
            grpc_port = grpc_port,
            "Subscription service listeners bound"
        );

        Ok(Self {
            http_port,
            grpc_port,
            http_listener,
            grpc_listener,
            state: AppState {
                config,
                deps,
                calendar,
                started_at,
            },
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get the gRPC port the server is listening on.
    pub fn grpc_port(&self) -> u16 {
        self.grpc_port
    }

    /// Cancelling this token stops the servers, the scheduler and the dispatcher.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let deps = self.state.deps.clone();

        // Notification dispatcher
        let (dispatcher, worker) = notification_channel(
            DispatcherSettings::from(&self.state.config.notification),
            deps.bus.clone(),
            deps.mailer.clone(),
            deps.outbox.clone(),
            self.shutdown.clone(),
        );
        let dispatcher_task = tokio::spawn(worker.run());

        // Weekly scheduler driving the charge sweep
        let sweep = ChargeSweep::new(
            deps.subscriptions.clone(),
            deps.ledger.clone(),
            deps.catalog.clone(),
            dispatcher,
        );
        let (scheduler, week) = BillingScheduler::new(
            self.state.calendar,
            sweep,
            deps.runs.clone(),
            self.state.started_at,
            self.shutdown.clone(),
        );
        let scheduler_task = tokio::spawn(scheduler.run());

        // Build minimal HTTP router (health + metrics)
        let health_state = HealthState {
            ledger: deps.ledger.clone(),
            bus: deps.bus.clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(health_state);

        // Build gRPC server
        let subscription_service = SubscriptionServiceImpl::new(
            deps.ledger.clone(),
            deps.subscriptions.clone(),
            deps.runs.clone(),
            week,
        );

        // gRPC health service
        let (mut health_reporter, grpc_health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<SubscriptionServiceServer<SubscriptionServiceImpl>>()
            .await;

        // Reflection service for debugging
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| {
                std::io::Error::other(format!("Failed to build reflection service: {}", e))
            })?;

        // gRPC trace layer for observability
        let grpc_trace_layer = TraceLayer::new_for_grpc()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG));

        let subscription_service_with_interceptor = SubscriptionServiceServer::with_interceptor(
            subscription_service,
            trace_context_interceptor,
        );

        let grpc_shutdown = self.shutdown.clone();
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(self.grpc_listener);
        let grpc_server = GrpcServer::builder()
            .layer(grpc_trace_layer)
            .add_service(grpc_health_service)
            .add_service(reflection_service)
            .add_service(subscription_service_with_interceptor)
            .serve_with_incoming_shutdown(incoming, async move { grpc_shutdown.cancelled().await });

        let http_shutdown = self.shutdown.clone();
        let http_server = axum::serve(self.http_listener, http_router)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .into_future();

        tracing::info!(
            service = "subscription-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            grpc_port = self.grpc_port,
            "Service ready to accept connections"
        );

        // Run both servers until shutdown or the first failure
        let result = tokio::select! {
            result = http_server => result.map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            }),
            result = grpc_server => result.map_err(|e| {
                tracing::error!(error = %e, "gRPC server error");
                std::io::Error::other(format!("gRPC server error: {}", e))
            }),
        };

        // A sweep in progress finishes before the scheduler returns.
        self.shutdown.cancel();
        if let Err(e) = scheduler_task.await {
            tracing::error!(error = %e, "Billing scheduler task failed");
        }
        if let Err(e) = dispatcher_task.await {
            tracing::error!(error = %e, "Notification dispatcher task failed");
        }
        tracing::info!("Background tasks stopped");

        result
    }
}
