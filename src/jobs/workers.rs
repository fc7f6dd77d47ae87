//! Queue consumers. Payload-shape validation failures are fatal (a producer
//! bug cannot succeed on retry); everything transient is retryable against
//! the broker's budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::jobs::broker::{InProcessBroker, JobHandler};
use crate::jobs::{
    EmailPayload, JobBroker, JobType, Mailer, ReservationJobPayload, SubscriptionJobPayload,
    JobError, PAYLOAD_VERSION,
};
use crate::reservation::{self, ReservationStatus};
use crate::station;
use crate::subscription;
use crate::user;

/// Wires every worker onto its queue and puts the sweeps on a schedule.
pub fn register_workers(
    broker: &InProcessBroker,
    pool: SqlitePool,
    mailer: Arc<dyn Mailer>,
    sweep_interval: Duration,
) {
    broker.work(JobType::EmailSend, EmailWorker { mailer });
    broker.work(
        JobType::ReservationNotifyNearExpiry,
        NearExpiryWorker {
            pool: pool.clone(),
            broker: broker.clone(),
        },
    );
    broker.work(
        JobType::SubscriptionAutoActivate,
        AutoActivateWorker { pool: pool.clone() },
    );
    broker.work(JobType::ReservationHoldSweep, HoldSweepWorker { pool: pool.clone() });
    broker.work(JobType::SubscriptionExpireSweep, SubscriptionSweepWorker { pool });

    broker.schedule(JobType::ReservationHoldSweep, sweep_interval);
    broker.schedule(JobType::SubscriptionExpireSweep, sweep_interval);
}

pub struct EmailWorker {
    pub mailer: Arc<dyn Mailer>,
}

#[async_trait]
impl JobHandler for EmailWorker {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), JobError> {
        let email: EmailPayload = serde_json::from_value(payload).map_err(JobError::fatal)?;
        if email.version != PAYLOAD_VERSION {
            return Err(JobError::Fatal(format!(
                "unsupported payload version {}",
                email.version
            )));
        }
        if email.to.is_empty() {
            return Err(JobError::Fatal("empty recipient".into()));
        }

        self.mailer
            .send(&email.to, &email.subject, &email.html)
            .await
            .map_err(JobError::Retryable)
    }
}

/// Reminds a rider shortly before their hold lapses. The hold may have been
/// confirmed, cancelled, or expired since the reminder was scheduled, so the
/// current state is re-checked and stale reminders are dropped.
pub struct NearExpiryWorker {
    pub pool: SqlitePool,
    pub broker: InProcessBroker,
}

#[async_trait]
impl JobHandler for NearExpiryWorker {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), JobError> {
        let payload: ReservationJobPayload =
            serde_json::from_value(payload).map_err(JobError::fatal)?;
        if payload.version != PAYLOAD_VERSION {
            return Err(JobError::Fatal(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }
        let now = Utc::now();

        let mut conn = self.pool.acquire().await.map_err(JobError::retryable)?;
        let Some(res) = reservation::find_by_id(&mut conn, &payload.reservation_id)
            .await
            .map_err(JobError::retryable)?
        else {
            warn!(reservation_id = %payload.reservation_id, "Reminder for unknown reservation");
            return Ok(());
        };

        if res.status != ReservationStatus::Pending {
            debug!(reservation_id = %res.id, status = %res.status, "Hold settled, reminder dropped");
            return Ok(());
        }
        let Some(end_time) = res.end_time else {
            return Ok(());
        };
        if end_time <= now {
            debug!(reservation_id = %res.id, "Hold already lapsed, reminder dropped");
            return Ok(());
        }

        let Some(user) = user::get_by_id(&mut conn, &res.user_id)
            .await
            .map_err(JobError::retryable)?
        else {
            warn!(reservation_id = %res.id, "Reminder for reservation with missing user");
            return Ok(());
        };
        let station_name = station::get_by_id(&mut conn, &res.station_id)
            .await
            .map_err(JobError::retryable)?
            .map(|s| s.name)
            .unwrap_or_else(|| res.station_id.clone());
        drop(conn);

        let email = EmailPayload {
            version: PAYLOAD_VERSION,
            to: user.email,
            subject: "Your bike hold is about to expire".to_string(),
            html: format!(
                "<p>Your hold at {} expires at {}. Confirm it to keep the bike.</p>",
                station_name,
                end_time.to_rfc3339()
            ),
        };
        let dedupe = format!("reservation:near-expiry:{}", res.id);
        self.broker
            .send(
                JobType::EmailSend,
                serde_json::to_value(&email).map_err(JobError::fatal)?,
                Some(&dedupe),
            )
            .await
            .map_err(JobError::retryable)
    }
}

pub struct AutoActivateWorker {
    pub pool: SqlitePool,
}

#[async_trait]
impl JobHandler for AutoActivateWorker {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), JobError> {
        let payload: SubscriptionJobPayload =
            serde_json::from_value(payload).map_err(JobError::fatal)?;
        if payload.version != PAYLOAD_VERSION {
            return Err(JobError::Fatal(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }

        let mut conn = self.pool.acquire().await.map_err(JobError::retryable)?;
        let activated = subscription::activate_pending(&mut conn, &payload.subscription_id, Utc::now())
            .await
            .map_err(JobError::retryable)?;

        if activated {
            info!(subscription_id = %payload.subscription_id, "Subscription activated");
        } else {
            // Not PENDING anymore, or another ACTIVE one exists; nothing to do.
            debug!(subscription_id = %payload.subscription_id, "Auto-activate skipped");
        }
        Ok(())
    }
}

pub struct HoldSweepWorker {
    pub pool: SqlitePool,
}

#[async_trait]
impl JobHandler for HoldSweepWorker {
    async fn handle(&self, _payload: serde_json::Value) -> Result<(), JobError> {
        reservation::sweep_expired_holds(&self.pool, Utc::now())
            .await
            .map(|_| ())
            .map_err(JobError::retryable)
    }
}

pub struct SubscriptionSweepWorker {
    pub pool: SqlitePool,
}

#[async_trait]
impl JobHandler for SubscriptionSweepWorker {
    async fn handle(&self, _payload: serde_json::Value) -> Result<(), JobError> {
        subscription::mark_expired(&self.pool, Utc::now())
            .await
            .map(|_| ())
            .map_err(JobError::retryable)
    }
}
