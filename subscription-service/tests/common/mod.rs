//! Test helper module for subscription-service integration tests.
//!
//! `TestApp` runs the real HTTP and gRPC servers on random ports, backed by
//! in-memory stores, a recording bus and a mock mailer. PostgreSQL-backed
//! tests use `postgres_database`, which returns `None` when
//! `TEST_DATABASE_URL` is not set.

#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use service_core::config::Config as CoreConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subscription_service::config::{
    BillingConfig, DatabaseConfig, NotificationConfig, RedisConfig, SmtpConfig,
    SubscriptionConfig, DEFAULT_TOPIC,
};
use subscription_service::grpc::proto::subscription_service_client::SubscriptionServiceClient;
use subscription_service::notification::{DispatcherSettings, InMemoryBus, MockEmailSender};
use subscription_service::services::{init_metrics, Database, InMemoryStore, StaticPriceCatalog};
use subscription_service::startup::{Application, Dependencies};
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = DEFAULT_TOPIC;
pub const FEE: u64 = 10;

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

pub fn anchor() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 11, 2).unwrap()
}

/// Midnight UTC of the anchor plus `days`.
pub fn days_after_anchor(days: i64) -> DateTime<Utc> {
    anchor().and_hms_opt(0, 0, 0).unwrap().and_utc() + ChronoDuration::days(days)
}

pub fn test_config() -> SubscriptionConfig {
    SubscriptionConfig {
        common: CoreConfig {
            port: 0, // Random port
            environment: "test".to_string(),
        },
        service_name: "subscription-service-test".to_string(),
        log_level: "warn".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: get_test_database_url().unwrap_or_default(),
            max_connections: 5,
            min_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
        },
        billing: BillingConfig {
            anchor_date: anchor(),
            default_price: Some(FEE),
            bundle_prices: HashMap::new(),
        },
        notification: NotificationConfig {
            topic: TOPIC.to_string(),
            queue_capacity: 1,
            outbox_poll_interval_secs: 3600,
            publish_timeout_secs: 0,
        },
        smtp: SmtpConfig {
            host: "localhost".to_string(),
            port: 2525,
            user: String::new(),
            password: String::new(),
            from_email: "noreply@example.com".to_string(),
            from_name: "GopherEats".to_string(),
            enabled: false,
        },
    }
}

pub fn dispatcher_settings(queue_capacity: usize) -> DispatcherSettings {
    DispatcherSettings {
        topic: TOPIC.to_string(),
        queue_capacity,
        outbox_poll_interval: Duration::from_secs(3600),
        publish_timeout: Duration::ZERO,
    }
}

/// Poll `check` every 20ms for up to five seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub http_address: String,
    pub grpc_address: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub store: Arc<InMemoryStore>,
    pub bus: Arc<InMemoryBus>,
    pub mailer: Arc<MockEmailSender>,
    shutdown: CancellationToken,
}

impl TestApp {
    /// Spawn a new test application on random ports.
    pub async fn spawn() -> Self {
        Self::spawn_at(Utc::now()).await
    }

    /// Spawn with the scheduler seeded as if the service started at `started_at`.
    pub async fn spawn_at(started_at: DateTime<Utc>) -> Self {
        // Initialize metrics (required for metrics endpoint test)
        init_metrics();

        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let mailer = Arc::new(MockEmailSender::new(true));
        let deps = Dependencies::in_memory(
            store.clone(),
            bus.clone(),
            mailer.clone(),
            Arc::new(StaticPriceCatalog::flat(FEE)),
        );

        let app = Application::build_with(test_config(), deps, started_at)
            .await
            .expect("Failed to build test application");

        let http_port = app.http_port();
        let grpc_port = app.grpc_port();
        let shutdown = app.shutdown_token();

        let http_address = format!("http://127.0.0.1:{}", http_port);
        let grpc_address = format!("http://127.0.0.1:{}", grpc_port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", http_address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Additional wait for gRPC server
        tokio::time::sleep(Duration::from_millis(100)).await;

        TestApp {
            http_address,
            grpc_address,
            http_port,
            grpc_port,
            store,
            bus,
            mailer,
            shutdown,
        }
    }

    /// Create a gRPC client connected to this test app.
    pub async fn grpc_client(&self) -> SubscriptionServiceClient<tonic::transport::Channel> {
        SubscriptionServiceClient::connect(self.grpc_address.clone())
            .await
            .expect("Failed to connect to gRPC server")
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Get the database URL for testing, if one is configured.
pub fn get_test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok().filter(|url| !url.is_empty())
}

/// A migrated database in a fresh schema, or `None` when no test database is configured.
pub async fn postgres_database() -> Option<(Database, String)> {
    let base_url = get_test_database_url()?;
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    let schema_name = format!("test_subscription_{}_{}", std::process::id(), counter);

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&base_url)
        .await
        .expect("Failed to connect to test database");
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
        .execute(&pool)
        .await
        .ok();
    sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
        .execute(&pool)
        .await
        .expect("Failed to create test schema");
    pool.close().await;

    // Use ? or & depending on whether URL already has query parameters
    let separator = if base_url.contains('?') { "&" } else { "?" };
    let url = format!(
        "{}{}options=-c search_path%3D{}",
        base_url, separator, schema_name
    );

    let db = Database::new(&url, 5, 1)
        .await
        .expect("Failed to connect to test schema");
    db.run_migrations().await.expect("Failed to run migrations");
    Some((db, schema_name))
}

/// Drop a schema created by `postgres_database`.
pub async fn drop_schema(schema_name: &str) {
    let Some(base_url) = get_test_database_url() else {
        return;
    };
    if let Ok(pool) = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&base_url)
        .await
    {
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await;
        pool.close().await;
    }
}
