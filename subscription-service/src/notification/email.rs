use super::{EmailMessage, EmailSender, ProviderError};
use crate::config::SmtpConfig;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct SmtpEmailSender {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpEmailSender {
    pub fn new(config: SmtpConfig) -> Result<Self, ProviderError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(config.user.clone(), config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| {
                ProviderError::Configuration(format!("Failed to create SMTP relay: {}", e))
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, email: &EmailMessage) -> Result<Option<String>, ProviderError> {
        let transport = self.transport.as_ref().ok_or_else(|| {
            ProviderError::NotEnabled("SMTP email sender is not enabled".to_string())
        })?;

        let from_mailbox: Mailbox = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| ProviderError::Configuration(format!("Invalid from address: {}", e)))?;

        let to_mailbox: Mailbox = email
            .to
            .parse()
            .map_err(|e| ProviderError::InvalidRecipient(format!("Invalid recipient: {}", e)))?;

        let message = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(&email.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(email.body_text.clone())
            .map_err(|e| ProviderError::SendFailed(format!("Failed to build message: {}", e)))?;

        let response = transport
            .send(message)
            .await
            .map_err(|e| ProviderError::SendFailed(format!("Failed to send email: {}", e)))?;

        let provider_id = response.message().next().map(|s| s.to_string());
        tracing::info!(to = %email.to, subject = %email.subject, "Email sent successfully");

        Ok(provider_id)
    }

    fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }
}

/// Mock email sender for testing
pub struct MockEmailSender {
    enabled: bool,
    failing: bool,
    send_count: AtomicU64,
}

impl MockEmailSender {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            failing: false,
            send_count: AtomicU64::new(0),
        }
    }

    /// A sender whose every delivery attempt fails.
    pub fn failing() -> Self {
        Self {
            enabled: true,
            failing: true,
            send_count: AtomicU64::new(0),
        }
    }

    /// Number of attempted sends, failed ones included.
    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailSender for MockEmailSender {
    async fn send(&self, email: &EmailMessage) -> Result<Option<String>, ProviderError> {
        if !self.enabled {
            return Err(ProviderError::NotEnabled(
                "Mock email sender is not enabled".to_string(),
            ));
        }

        let count = self.send_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing {
            return Err(ProviderError::SendFailed(format!(
                "mock SMTP rejected mail to {}",
                email.to
            )));
        }

        tracing::info!(to = %email.to, subject = %email.subject, "[MOCK] Email would be sent");

        Ok(Some(format!("mock-email-{}", count)))
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
