//! Shared test fixtures: an in-memory database with migrations applied, row
//! seeders, and recording doubles for the broker, mailer, and payment
//! processor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::bike::BikeStatus;
use crate::jobs::{BrokerError, JobBroker, JobType, Mailer};
use crate::stripe::{
    CheckoutSession, CheckoutSessionRequest, PaymentProcessor, Payout, PayoutRequest,
    ProcessorError,
};
use crate::subscription::SubscriptionStatus;

/// One-connection in-memory pool; a second connection would see a different
/// empty database.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(":memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations apply");
    pool
}

pub async fn seed_user(pool: &SqlitePool, user_id: &str) {
    sqlx::query(
        "INSERT INTO users (id, email, full_name, stripe_payouts_enabled, created_at) \
         VALUES (?1, ?2, ?3, 0, ?4)",
    )
    .bind(user_id)
    .bind(format!("{user_id}@example.com"))
    .bind(format!("User {user_id}"))
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("seed user");
}

pub async fn seed_payout_user(pool: &SqlitePool, user_id: &str, account_id: &str) {
    sqlx::query(
        "INSERT INTO users \
         (id, email, full_name, stripe_account_id, stripe_payouts_enabled, created_at) \
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
    )
    .bind(user_id)
    .bind(format!("{user_id}@example.com"))
    .bind(format!("User {user_id}"))
    .bind(account_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("seed payout user");
}

pub async fn seed_wallet(pool: &SqlitePool, user_id: &str, balance: i64) {
    sqlx::query(
        "INSERT INTO wallets (id, user_id, balance, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 'ACTIVE', ?4, ?4)",
    )
    .bind(format!("wallet-{user_id}"))
    .bind(user_id)
    .bind(balance)
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("seed wallet");
}

pub async fn seed_station(pool: &SqlitePool, station_id: &str) {
    sqlx::query("INSERT INTO stations (id, name, created_at) VALUES (?1, ?2, ?3)")
        .bind(station_id)
        .bind(format!("Station {station_id}"))
        .bind(Utc::now())
        .execute(pool)
        .await
        .expect("seed station");
}

pub async fn seed_bike(pool: &SqlitePool, bike_id: &str, station_id: &str, status: BikeStatus) {
    sqlx::query("INSERT INTO bikes (id, station_id, status, updated_at) VALUES (?1, ?2, ?3, ?4)")
        .bind(bike_id)
        .bind(station_id)
        .bind(status)
        .bind(Utc::now())
        .execute(pool)
        .await
        .expect("seed bike");
}

pub struct SubscriptionSeed {
    pub id: &'static str,
    pub user_id: &'static str,
    pub status: SubscriptionStatus,
    pub max_usages: i64,
    pub usage_count: i64,
}

pub async fn seed_subscription(pool: &SqlitePool, seed: SubscriptionSeed) {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO subscriptions \
         (id, user_id, status, max_usages, usage_count, starts_at, expires_at, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6, ?6)",
    )
    .bind(seed.id)
    .bind(seed.user_id)
    .bind(seed.status)
    .bind(seed.max_usages)
    .bind(seed.usage_count)
    .bind(now)
    .bind(now + Duration::days(30))
    .execute(pool)
    .await
    .expect("seed subscription");
}

/// Raw PENDING reservation row, bypassing the reserve use case.
pub async fn seed_reservation_row(
    pool: &SqlitePool,
    reservation_id: &str,
    user_id: &str,
    bike_id: &str,
    station_id: &str,
) {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO reservations \
         (id, user_id, bike_id, station_id, reservation_option, status, start_time, end_time, \
          prepaid, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 'ONE_TIME', 'PENDING', ?5, ?6, 0, ?5, ?5)",
    )
    .bind(reservation_id)
    .bind(user_id)
    .bind(bike_id)
    .bind(station_id)
    .bind(now)
    .bind(now + Duration::minutes(15))
    .execute(pool)
    .await
    .expect("seed reservation");
}

/// Inserts a PENDING outbox row directly; returns its id.
pub async fn enqueue_job(
    pool: &SqlitePool,
    job_type: JobType,
    dedupe_key: Option<&str>,
    run_at: DateTime<Utc>,
) -> String {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO outbox_jobs \
         (id, job_type, payload, dedupe_key, status, attempts, run_at, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 'PENDING', 0, ?5, ?6, ?6)",
    )
    .bind(&id)
    .bind(job_type)
    .bind(r#"{"version":1,"to":"rider@example.com","subject":"s","html":"h"}"#)
    .bind(dedupe_key)
    .bind(run_at)
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("enqueue job");
    id
}

/// Broker double that records every send and always succeeds.
#[derive(Default, Clone)]
pub struct RecordingBroker {
    sent: Arc<Mutex<Vec<(JobType, Option<String>)>>>,
}

impl RecordingBroker {
    pub fn sent(&self) -> Vec<(JobType, Option<String>)> {
        self.sent.lock().expect("broker lock").clone()
    }
}

#[async_trait]
impl JobBroker for RecordingBroker {
    async fn send(
        &self,
        job_type: JobType,
        _payload: serde_json::Value,
        dedupe_key: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.sent
            .lock()
            .expect("broker lock")
            .push((job_type, dedupe_key.map(str::to_string)));
        Ok(())
    }
}

/// Mailer double recording recipients.
#[derive(Default, Clone)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<String>>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("mailer lock").clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, _subject: &str, _html: &str) -> Result<(), String> {
        self.sent.lock().expect("mailer lock").push(to.to_string());
        Ok(())
    }
}

/// Payment processor double whose calls fail until `recover` is called.
pub struct FlakyProcessor {
    failing: AtomicBool,
}

impl FlakyProcessor {
    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
        }
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), ProcessorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProcessorError::Api {
                status: 503,
                message: "provider unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProcessor for FlakyProcessor {
    async fn create_checkout_session(
        &self,
        _request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProcessorError> {
        self.check()?;
        let session_id = format!("cs_test_{}", Uuid::new_v4().simple());
        Ok(CheckoutSession {
            url: format!("https://checkout.invalid/{session_id}"),
            session_id,
        })
    }

    async fn create_payout(&self, _request: &PayoutRequest) -> Result<Payout, ProcessorError> {
        self.check()?;
        Ok(Payout {
            payout_id: format!("po_test_{}", Uuid::new_v4().simple()),
        })
    }
}
