//! Durable notification outbox model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An insufficient-funds notification that has not reached the message bus yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct OutboxEntry {
    pub outbox_id: i64,
    pub account_id: String,
    pub topic: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_utc: DateTime<Utc>,
}
