//! Job types, payload contracts, and the broker seam. The outbox dispatcher
//! pushes into a [`JobBroker`]; workers consume from it and run the actual
//! side effects.

pub mod broker;
pub mod workers;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    EmailSend,
    ReservationNotifyNearExpiry,
    ReservationHoldSweep,
    SubscriptionAutoActivate,
    SubscriptionExpireSweep,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailSend => "EMAIL_SEND",
            Self::ReservationNotifyNearExpiry => "RESERVATION_NOTIFY_NEAR_EXPIRY",
            Self::ReservationHoldSweep => "RESERVATION_HOLD_SWEEP",
            Self::SubscriptionAutoActivate => "SUBSCRIPTION_AUTO_ACTIVATE",
            Self::SubscriptionExpireSweep => "SUBSCRIPTION_EXPIRE_SWEEP",
        }
    }

    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::EmailSend => "email.send",
            Self::ReservationNotifyNearExpiry => "reservation.notify-near-expiry",
            Self::ReservationHoldSweep => "reservation.hold-sweep",
            Self::SubscriptionAutoActivate => "subscription.auto-activate",
            Self::SubscriptionExpireSweep => "subscription.expire-sweep",
        }
    }

    pub fn dlq_name(&self) -> String {
        format!("{}.dlq", self.queue_name())
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailPayload {
    pub version: u32,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationJobPayload {
    pub version: u32,
    pub reservation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionJobPayload {
    pub version: u32,
    pub subscription_id: String,
}

/// How a worker failed. `Fatal` means the payload can never succeed (a
/// producer bug) and goes straight to the DLQ; `Retryable` consumes the
/// queue's retry budget first.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("retryable: {0}")]
    Retryable(String),
}

impl JobError {
    pub fn fatal(err: impl fmt::Display) -> Self {
        Self::Fatal(err.to_string())
    }

    pub fn retryable(err: impl fmt::Display) -> Self {
        Self::Retryable(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no worker registered for queue {queue}")]
    NoWorker { queue: String },
    #[error("queue {queue} is closed")]
    QueueClosed { queue: String },
}

/// At-least-once delivery seam between the outbox dispatcher and workers.
/// `dedupe_key` is the broker's own duplicate-suppression token, guarding
/// against a dispatcher retrying a send that actually went through.
#[async_trait]
pub trait JobBroker: Send + Sync {
    async fn send(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        dedupe_key: Option<&str>,
    ) -> Result<(), BrokerError>;
}

/// Outbound mail seam. Rendering happens upstream; the engine only carries
/// opaque subject/html strings.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), String>;
}

/// Default mailer: logs the send instead of performing it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, _html: &str) -> Result<(), String> {
        tracing::info!(to, subject, "Email send (log only)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_and_dlq_names_follow_the_convention() {
        assert_eq!(JobType::EmailSend.queue_name(), "email.send");
        assert_eq!(JobType::EmailSend.dlq_name(), "email.send.dlq");
        assert_eq!(
            JobType::SubscriptionAutoActivate.dlq_name(),
            "subscription.auto-activate.dlq"
        );
    }

    #[test]
    fn payloads_roundtrip_as_versioned_json() {
        let payload = EmailPayload {
            version: PAYLOAD_VERSION,
            to: "rider@example.com".into(),
            subject: "Reservation confirmed".into(),
            html: "<p>hi</p>".into(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["version"], 1);
        let back: EmailPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.to, "rider@example.com");
    }
}
