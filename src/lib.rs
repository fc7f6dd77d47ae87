//! Reservation lifecycle engine for a bike-sharing platform: bike holds, a
//! wallet ledger with idempotent money movement, and a transactional outbox
//! dispatched to background job workers.

pub mod bike;
pub mod env;
pub mod jobs;
pub mod outbox;
pub mod rental;
pub mod reservation;
pub mod station;
pub mod stripe;
pub mod subscription;
pub mod user;
pub mod wallet;

#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::env::{Config, ProcessorConfig};
use crate::jobs::broker::{BrokerOptions, InProcessBroker};
use crate::jobs::workers::register_workers;
use crate::jobs::LogMailer;
use crate::outbox::dispatcher::OutboxDispatcher;
use crate::stripe::{DryRunProcessor, PaymentProcessor, StripeClient};
use crate::wallet::withdrawal;

/// Wires the pool, broker, workers, dispatcher, and sweeps together and runs
/// until SIGINT.
pub async fn launch(config: Config) -> anyhow::Result<()> {
    let pool = config.get_sqlite_pool().await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let processor: Arc<dyn PaymentProcessor> = match &config.processor {
        ProcessorConfig::Stripe(stripe) => Arc::new(StripeClient::new(stripe.clone())),
        ProcessorConfig::DryRun => {
            info!("No payment credentials configured, running payments in dry-run mode");
            Arc::new(DryRunProcessor)
        }
    };

    let broker = InProcessBroker::new(BrokerOptions::default());
    register_workers(&broker, pool.clone(), Arc::new(LogMailer), config.sweep_interval);

    let dispatcher = OutboxDispatcher::new(pool.clone(), broker.clone(), config.dispatcher.clone());
    let dispatcher_handle = dispatcher.spawn();

    let withdrawal_sweep = {
        let pool = pool.clone();
        let processor = Arc::clone(&processor);
        let every = config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stalled_after = chrono::Duration::from_std(every)
                    .unwrap_or_else(|_| chrono::Duration::minutes(1));
                if let Err(err) = withdrawal::sweep_stalled_withdrawals(
                    &pool,
                    processor.as_ref(),
                    stalled_after,
                    Utc::now(),
                )
                .await
                {
                    error!(%err, "Stalled withdrawal sweep failed");
                }
            }
        })
    };

    info!("Engine running");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    dispatcher_handle.stop().await;
    withdrawal_sweep.abort();
    broker.shutdown();
    pool.close().await;
    Ok(())
}
