use std::time::Duration;

use clap::{Parser, ValueEnum};
use sqlx::SqlitePool;
use tracing::Level;

use crate::outbox::dispatcher::DispatcherConfig;
use crate::outbox::RetryPolicy;
use crate::stripe::StripeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&LogLevel> for Level {
    fn from(level: &LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Environment-backed CLI flags. Converted into [`Config`] before use.
#[derive(Parser, Debug)]
pub struct Env {
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[clap(long, env = "LOG_LEVEL", value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// How long a PENDING hold stays valid, in minutes.
    #[clap(long, env = "RESERVATION_HOLD_MINUTES", default_value = "15")]
    pub reservation_hold_minutes: u64,

    /// Prepaid amount (minor units) debited when a ONE_TIME hold is taken.
    #[clap(long, env = "RESERVATION_PREPAID_AMOUNT", default_value = "20000")]
    pub reservation_prepaid_amount: i64,

    /// How long before hold expiry the reminder email fires, in minutes.
    #[clap(long, env = "EXPIRY_NOTIFY_MINUTES", default_value = "5")]
    pub expiry_notify_minutes: u64,

    /// Window after creation during which a cancelled hold is refunded, in hours.
    #[clap(long, env = "REFUND_PERIOD_HOURS", default_value = "24")]
    pub refund_period_hours: u64,

    #[clap(long, env = "MIN_WITHDRAWAL_AMOUNT", default_value = "50000")]
    pub min_withdrawal_amount: i64,

    #[clap(long, env = "MIN_TOPUP_AMOUNT", default_value = "10000")]
    pub min_topup_amount: i64,

    #[clap(long, env = "OUTBOX_POLL_INTERVAL_SECS", default_value = "5")]
    pub outbox_poll_interval: u64,

    #[clap(long, env = "OUTBOX_BATCH_SIZE", default_value = "20")]
    pub outbox_batch_size: u32,

    #[clap(long, env = "OUTBOX_MAX_ATTEMPTS", default_value = "5")]
    pub outbox_max_attempts: u32,

    #[clap(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval: u64,

    #[clap(long, env = "STRIPE_SECRET_KEY")]
    pub stripe_secret_key: Option<String>,

    #[clap(long, env = "STRIPE_WEBHOOK_SECRET")]
    pub stripe_webhook_secret: Option<String>,
}

/// Which payment processor backend the wallet ledger talks to.
#[derive(Debug, Clone)]
pub enum ProcessorConfig {
    Stripe(StripeConfig),
    /// Logs payout/checkout calls instead of performing them.
    DryRun,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub log_level: LogLevel,
    pub reservation: ReservationConfig,
    pub wallet: WalletConfig,
    pub dispatcher: DispatcherConfig,
    pub sweep_interval: Duration,
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone)]
pub struct ReservationConfig {
    pub hold_duration: chrono::Duration,
    pub prepaid_amount: i64,
    pub notify_before: chrono::Duration,
    pub refund_period: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub min_withdrawal_amount: i64,
    pub min_topup_amount: i64,
}

impl Env {
    pub fn into_config(self) -> Config {
        let processor = match (&self.stripe_secret_key, &self.stripe_webhook_secret) {
            (Some(secret_key), Some(webhook_secret)) => ProcessorConfig::Stripe(StripeConfig {
                secret_key: secret_key.clone(),
                webhook_secret: webhook_secret.clone(),
                base_url: StripeConfig::DEFAULT_BASE_URL.to_string(),
            }),
            _ => ProcessorConfig::DryRun,
        };

        Config {
            database_url: self.database_url,
            log_level: self.log_level,
            reservation: ReservationConfig {
                hold_duration: chrono::Duration::minutes(self.reservation_hold_minutes as i64),
                prepaid_amount: self.reservation_prepaid_amount,
                notify_before: chrono::Duration::minutes(self.expiry_notify_minutes as i64),
                refund_period: chrono::Duration::hours(self.refund_period_hours as i64),
            },
            wallet: WalletConfig {
                min_withdrawal_amount: self.min_withdrawal_amount,
                min_topup_amount: self.min_topup_amount,
            },
            dispatcher: DispatcherConfig {
                poll_interval: Duration::from_secs(self.outbox_poll_interval),
                batch_size: self.outbox_batch_size,
                retry: RetryPolicy {
                    max_attempts: self.outbox_max_attempts,
                    ..RetryPolicy::default()
                },
                ..DispatcherConfig::default()
            },
            sweep_interval: Duration::from_secs(self.sweep_interval),
            processor,
        }
    }
}

impl Config {
    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL allows concurrent readers with a single writer; the busy timeout
    // keeps contending writers queueing instead of failing outright.
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    Ok(pool)
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("velostation={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_env() -> Env {
        Env::parse_from(["velostation", "--database-url", ":memory:"])
    }

    #[test]
    fn defaults_produce_dry_run_processor() {
        let config = test_env().into_config();
        assert!(matches!(config.processor, ProcessorConfig::DryRun));
        assert_eq!(config.reservation.prepaid_amount, 20_000);
        assert_eq!(
            config.reservation.hold_duration,
            chrono::Duration::minutes(15)
        );
    }

    #[test]
    fn stripe_keys_select_stripe_processor() {
        let mut env = test_env();
        env.stripe_secret_key = Some("sk_test_123".into());
        env.stripe_webhook_secret = Some("whsec_123".into());
        let config = env.into_config();
        assert!(matches!(config.processor, ProcessorConfig::Stripe(_)));
    }

    #[tokio::test]
    async fn pool_applies_pragmas() {
        let config = test_env().into_config();
        let pool = config.get_sqlite_pool().await.unwrap();
        sqlx::query("SELECT 1").execute(&pool).await.unwrap();
    }
}
