//! Insufficient-funds notifications: message bus, warning email and the dispatcher between them.

pub mod bus;
pub mod dispatcher;
pub mod email;

use async_trait::async_trait;
use thiserror::Error;

pub use bus::{InMemoryBus, RedisStreamBus};
pub use dispatcher::{
    notification_channel, DispatchWorker, DispatcherSettings, Enqueued, NotificationDispatcher,
};
pub use email::{MockEmailSender, SmtpEmailSender};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider not enabled: {0}")]
    NotEnabled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body_text: String,
}

impl EmailMessage {
    /// Warning sent after a subscription was cancelled for lack of funds.
    pub fn insufficient_funds(account_id: &str) -> Self {
        Self {
            to: account_id.to_string(),
            subject: "Your weekly subscription was cancelled".to_string(),
            body_text: "We could not charge this week's bundle because your balance was too low, \
                        so the subscription has been cancelled. Top up your balance and subscribe \
                        again to keep receiving deliveries."
                .to_string(),
        }
    }
}

/// Publishes account ids to a topic of the message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Returns the bus-assigned message id.
    async fn publish(&self, topic: &str, account_id: &str) -> Result<String, ProviderError>;

    async fn health_check(&self) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Returns the provider message id when one is reported.
    async fn send(&self, email: &EmailMessage) -> Result<Option<String>, ProviderError>;

    fn is_enabled(&self) -> bool;
}
