//! Decouples the charge sweep from message-bus latency.
//!
//! The sweep hands account ids to [`NotificationDispatcher::enqueue`], which never
//! waits on the consumer: when the bounded queue is full (or already closed) the
//! entry is spilled to the durable outbox instead. A single [`DispatchWorker`]
//! drains the queue, publishes each account id with bounded retries, writes
//! undeliverable entries to the outbox and periodically relays the outbox.

use super::{EmailMessage, EmailSender, MessageBus, ProviderError};
use crate::config::NotificationConfig;
use crate::error::BillingResult;
use crate::services::metrics::record_notification;
use crate::services::store::NotificationOutbox;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Outbox rows re-published per relay pass.
const RELAY_BATCH_SIZE: i64 = 100;

/// Relay period used in place of a zero interval, which `tokio::time::interval` rejects.
const MIN_OUTBOX_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn relay_period(configured: Duration) -> Duration {
    if configured.is_zero() {
        MIN_OUTBOX_POLL_INTERVAL
    } else {
        configured
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub topic: String,
    pub queue_capacity: usize,
    pub outbox_poll_interval: Duration,
    /// Upper bound on the time spent retrying one publish.
    pub publish_timeout: Duration,
}

impl From<&NotificationConfig> for DispatcherSettings {
    fn from(config: &NotificationConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            queue_capacity: config.queue_capacity.max(1),
            outbox_poll_interval: relay_period(config.outbox_poll_interval()),
            publish_timeout: config.publish_timeout(),
        }
    }
}

/// Where an accepted notification went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    Spilled { outbox_id: i64 },
}

/// Producer side, cloned into the charge sweep.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<String>,
    outbox: Arc<dyn NotificationOutbox>,
    topic: String,
}

/// Consumer side. Run exactly once with [`DispatchWorker::run`].
pub struct DispatchWorker {
    rx: mpsc::Receiver<String>,
    bus: Arc<dyn MessageBus>,
    mailer: Arc<dyn EmailSender>,
    outbox: Arc<dyn NotificationOutbox>,
    settings: DispatcherSettings,
    shutdown: CancellationToken,
}

pub fn notification_channel(
    settings: DispatcherSettings,
    bus: Arc<dyn MessageBus>,
    mailer: Arc<dyn EmailSender>,
    outbox: Arc<dyn NotificationOutbox>,
    shutdown: CancellationToken,
) -> (NotificationDispatcher, DispatchWorker) {
    let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));

    let dispatcher = NotificationDispatcher {
        tx,
        outbox: outbox.clone(),
        topic: settings.topic.clone(),
    };
    let worker = DispatchWorker {
        rx,
        bus,
        mailer,
        outbox,
        settings,
        shutdown,
    };

    (dispatcher, worker)
}

impl NotificationDispatcher {
    /// Accept an insufficient-funds notification without waiting for the consumer.
    ///
    /// Fails only when the queue is unavailable and the outbox write fails too.
    pub async fn enqueue(&self, account_id: &str) -> BillingResult<Enqueued> {
        match self.tx.try_send(account_id.to_string()) {
            Ok(()) => {
                record_notification("queued");
                tracing::debug!(account_id = %account_id, "Notification queued");
                Ok(Enqueued::Queued)
            }
            Err(TrySendError::Full(account_id)) => {
                self.spill(&account_id, "notification queue full").await
            }
            Err(TrySendError::Closed(account_id)) => {
                self.spill(&account_id, "notification queue closed").await
            }
        }
    }

    async fn spill(&self, account_id: &str, reason: &str) -> BillingResult<Enqueued> {
        let outbox_id = self.outbox.store(account_id, &self.topic, reason).await?;
        record_notification("spilled");
        tracing::warn!(
            account_id = %account_id,
            outbox_id = outbox_id,
            reason = reason,
            "Notification spilled to outbox"
        );
        Ok(Enqueued::Spilled { outbox_id })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempts {
    Retry,
    Once,
}

impl DispatchWorker {
    pub async fn run(mut self) {
        tracing::info!(
            topic = %self.settings.topic,
            queue_capacity = self.settings.queue_capacity,
            "Notification dispatcher started"
        );

        let mut relay = tokio::time::interval(relay_period(self.settings.outbox_poll_interval));
        relay.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(account_id) => self.deliver(&account_id, Attempts::Retry).await,
                    None => {
                        tracing::info!("Notification queue closed, dispatcher exiting");
                        break;
                    }
                },
                _ = relay.tick() => self.relay_outbox().await,
            }
        }

        // Anything that arrives after close goes to the outbox from the producer side.
        self.rx.close();
        let mut drained = 0usize;
        while let Some(account_id) = self.rx.recv().await {
            self.deliver(&account_id, Attempts::Once).await;
            drained += 1;
        }

        tracing::info!(drained = drained, "Notification dispatcher stopped");
    }

    async fn deliver(&self, account_id: &str, attempts: Attempts) {
        match self.publish(account_id, attempts).await {
            Ok(message_id) => {
                record_notification("published");
                tracing::info!(
                    account_id = %account_id,
                    topic = %self.settings.topic,
                    message_id = %message_id,
                    "Insufficient-funds notification published"
                );
                self.send_warning(account_id);
            }
            Err(e) => {
                tracing::warn!(
                    account_id = %account_id,
                    error = %e,
                    "Publish failed, writing notification to outbox"
                );
                match self
                    .outbox
                    .store(account_id, &self.settings.topic, &e.to_string())
                    .await
                {
                    Ok(outbox_id) => {
                        record_notification("outboxed");
                        tracing::info!(account_id = %account_id, outbox_id = outbox_id, "Notification outboxed");
                    }
                    Err(store_err) => {
                        record_notification("lost");
                        tracing::error!(
                            account_id = %account_id,
                            error = %store_err,
                            "Notification lost: publish and outbox both failed"
                        );
                    }
                }
            }
        }
    }

    async fn publish(&self, account_id: &str, attempts: Attempts) -> Result<String, ProviderError> {
        if attempts == Attempts::Once {
            return self.bus.publish(&self.settings.topic, account_id).await;
        }

        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.settings.publish_timeout),
            ..Default::default()
        };
        let publish = retry(backoff, || async {
            self.bus
                .publish(&self.settings.topic, account_id)
                .await
                .map_err(backoff::Error::transient)
        });

        tokio::select! {
            result = publish => result,
            _ = self.shutdown.cancelled() => Err(ProviderError::SendFailed(
                "shutdown while retrying publish".to_string(),
            )),
        }
    }

    async fn relay_outbox(&self) {
        let pending = match self.outbox.pending(RELAY_BATCH_SIZE).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read notification outbox");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        tracing::info!(count = pending.len(), "Relaying notification outbox");
        for entry in pending {
            match self.bus.publish(&entry.topic, &entry.account_id).await {
                Ok(message_id) => {
                    if let Err(e) = self.outbox.mark_delivered(entry.outbox_id).await {
                        // The entry stays pending and will be published again.
                        tracing::warn!(outbox_id = entry.outbox_id, error = %e, "Failed to mark outbox entry delivered");
                    }
                    record_notification("relayed");
                    tracing::info!(
                        account_id = %entry.account_id,
                        outbox_id = entry.outbox_id,
                        message_id = %message_id,
                        "Outbox notification published"
                    );
                    self.send_warning(&entry.account_id);
                }
                Err(e) => {
                    tracing::warn!(outbox_id = entry.outbox_id, error = %e, "Outbox relay publish failed");
                    if let Err(store_err) = self.outbox.record_failure(entry.outbox_id, &e.to_string()).await {
                        tracing::warn!(outbox_id = entry.outbox_id, error = %store_err, "Failed to record outbox failure");
                    }
                    // Bus is likely down; retry on the next pass.
                    break;
                }
            }
        }
    }

    /// Fire-and-forget; SMTP latency or failure never holds up the queue.
    fn send_warning(&self, account_id: &str) {
        if !self.mailer.is_enabled() {
            return;
        }
        let mailer = self.mailer.clone();
        let email = EmailMessage::insufficient_funds(account_id);
        tokio::spawn(async move {
            match mailer.send(&email).await {
                Ok(_) => record_notification("emailed"),
                Err(e) => {
                    record_notification("email_failed");
                    tracing::warn!(to = %email.to, error = %e, "Failed to send insufficient-funds email");
                }
            }
        });
    }
}
