use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde_json::json;
use tracing::{error, info};

use crate::config::{DeliveryConfig, SmtpConfig};
use crate::db::Database;
use crate::error::{DeliveryError, RepositoryError};
use crate::models::{Delivery, DeliveryStatus, DestinationKind, GroupDestination};

#[derive(Debug, Clone, PartialEq)]
pub struct DigestMessage {
    pub subject: String,
    pub markdown: String,
}

impl DigestMessage {
    pub fn new(group_name: &str, scheduled_at: DateTime<Utc>, markdown: impl Into<String>) -> Self {
        Self {
            subject: format!(
                "{} digest for {} UTC",
                group_name,
                scheduled_at.format("%Y-%m-%d %H:%M")
            ),
            markdown: markdown.into(),
        }
    }
}

/// Hands a digest to one kind of destination.
#[async_trait]
pub trait DestinationSender: Send + Sync {
    async fn send(
        &self,
        destination: &GroupDestination,
        message: &DigestMessage,
    ) -> Result<(), DeliveryError>;
}

pub struct SmtpSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpSender {
    pub fn new(config: &SmtpConfig, timeout: Duration) -> Result<Self, DeliveryError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|_| DeliveryError::InvalidAddress(config.from.clone()))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .timeout(Some(timeout));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl DestinationSender for SmtpSender {
    async fn send(
        &self,
        destination: &GroupDestination,
        message: &DigestMessage,
    ) -> Result<(), DeliveryError> {
        let to: Mailbox = destination
            .target
            .parse()
            .map_err(|_| DeliveryError::InvalidAddress(destination.target.clone()))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(message.markdown.clone())
            .map_err(|e| DeliveryError::Smtp(e.to_string()))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| DeliveryError::Smtp(e.to_string()))?;
        Ok(())
    }
}

/// Posts `{"text": <markdown>}` to a chat webhook.
pub struct WebhookSender {
    client: Client,
}

impl WebhookSender {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }
}

#[async_trait]
impl DestinationSender for WebhookSender {
    async fn send(
        &self,
        destination: &GroupDestination,
        message: &DigestMessage,
    ) -> Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(&destination.target)
            .json(&json!({ "text": message.markdown }));
        if let Some(token) = &destination.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout
            } else {
                DeliveryError::Webhook(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Webhook(format!("HTTP {}", status.as_u16())));
        }
        Ok(())
    }
}

/// Sends a digest to every enabled destination and records one `Delivery`
/// per destination.
pub struct Dispatcher {
    db: Arc<Database>,
    email: Arc<dyn DestinationSender>,
    webhook: Arc<dyn DestinationSender>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        db: Arc<Database>,
        email: Arc<dyn DestinationSender>,
        webhook: Arc<dyn DestinationSender>,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            email,
            webhook,
            timeout,
        }
    }

    pub fn from_config(db: Arc<Database>, config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let email = SmtpSender::new(&config.smtp, timeout)?;
        Ok(Self::new(
            db,
            Arc::new(email),
            Arc::new(WebhookSender::new(timeout)),
            timeout,
        ))
    }

    fn sender_for(&self, kind: DestinationKind) -> &dyn DestinationSender {
        match kind {
            DestinationKind::Email => self.email.as_ref(),
            DestinationKind::Webhook => self.webhook.as_ref(),
        }
    }

    async fn send_one(
        &self,
        destination: &GroupDestination,
        message: &DigestMessage,
    ) -> Result<(), DeliveryError> {
        let sender = self.sender_for(destination.kind);
        match tokio::time::timeout(self.timeout, sender.send(destination, message)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    /// Sends run concurrently; a failed or slow destination only affects its
    /// own `Delivery`. Results are returned in destination order.
    pub async fn deliver(
        &self,
        digest_id: i64,
        destinations: &[GroupDestination],
        message: &DigestMessage,
    ) -> Result<Vec<Delivery>, RepositoryError> {
        let enabled: Vec<&GroupDestination> = destinations.iter().filter(|d| d.enabled).collect();

        let mut pending = Vec::with_capacity(enabled.len());
        for destination in &enabled {
            pending.push(self.db.insert_delivery(digest_id, destination.id).await?);
        }

        let outcomes = join_all(
            enabled
                .iter()
                .map(|destination| self.send_one(destination, message)),
        )
        .await;

        let mut deliveries = Vec::with_capacity(pending.len());
        for ((destination, delivery), outcome) in enabled.iter().zip(pending).zip(outcomes) {
            let finished = match outcome {
                Ok(()) => {
                    info!(
                        "Delivered digest {} to {:?} destination {}",
                        digest_id, destination.kind, destination.target
                    );
                    self.db
                        .finish_delivery(delivery.id, DeliveryStatus::Sent, None)
                        .await?
                }
                Err(e) => {
                    error!(
                        "Delivery of digest {} to {} failed: {}",
                        digest_id, destination.target, e
                    );
                    let reason = e.to_string();
                    self.db
                        .finish_delivery(delivery.id, DeliveryStatus::Failed, Some(&reason))
                        .await?
                }
            };
            deliveries.push(finished);
        }

        Ok(deliveries)
    }
}
