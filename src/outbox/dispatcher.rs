//! Background poller that drains the outbox into the job broker. One
//! instance per process; claim exclusivity makes extra instances safe, just
//! redundant.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::jobs::JobBroker;
use crate::outbox::{self, OutboxJob, OutboxStatus, RetryPolicy};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub retry: RetryPolicy,
    /// A claim older than this is treated as abandoned.
    pub claim_ttl: chrono::Duration,
    /// Random start delay, decorrelating pollers that boot together.
    pub max_jitter: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
            retry: RetryPolicy::default(),
            claim_ttl: chrono::Duration::minutes(5),
            max_jitter: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub claimed: usize,
    pub sent: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

pub struct OutboxDispatcher<B> {
    pool: SqlitePool,
    broker: B,
    worker_id: String,
    config: DispatcherConfig,
}

/// Stops the dispatch loop and waits for the in-flight tick to finish.
pub struct DispatcherHandle {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl DispatcherHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            error!(%err, "Dispatcher task panicked");
        }
    }
}

impl<B: JobBroker + Send + Sync + 'static> OutboxDispatcher<B> {
    pub fn new(pool: SqlitePool, broker: B, config: DispatcherConfig) -> Self {
        Self {
            pool,
            broker,
            worker_id: format!("dispatcher-{}", Uuid::new_v4().simple()),
            config,
        }
    }

    /// One polling tick: claim a batch, forward each job, settle outcomes.
    /// Delivery failures are recorded per job and never abort the batch.
    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn dispatch_once(&self) -> Result<DispatchStats, sqlx::Error> {
        let now = Utc::now();
        let jobs = outbox::claim_due_jobs(
            &self.pool,
            &self.worker_id,
            self.config.batch_size,
            self.config.claim_ttl,
            now,
        )
        .await?;

        let mut stats = DispatchStats {
            claimed: jobs.len(),
            ..DispatchStats::default()
        };

        for job in jobs {
            match self.deliver(&job).await {
                Ok(()) => {
                    if outbox::mark_sent(&self.pool, &job.id, &self.worker_id, Utc::now()).await? {
                        stats.sent += 1;
                    }
                }
                Err(err) => {
                    let settled = outbox::reschedule_or_fail(
                        &self.pool,
                        &job,
                        &err,
                        &self.config.retry,
                        Utc::now(),
                    )
                    .await?;
                    match settled {
                        OutboxStatus::Failed => {
                            error!(job_id = %job.id, job_type = %job.job_type, %err,
                                "Outbox job failed terminally");
                            stats.failed += 1;
                        }
                        _ => {
                            warn!(job_id = %job.id, job_type = %job.job_type, %err,
                                attempts = job.attempts, "Outbox delivery failed, rescheduled");
                            stats.rescheduled += 1;
                        }
                    }
                }
            }
        }

        if stats.claimed > 0 {
            debug!(?stats, "Dispatched outbox batch");
        }
        Ok(stats)
    }

    async fn deliver(&self, job: &OutboxJob) -> Result<(), String> {
        let payload: serde_json::Value =
            serde_json::from_str(&job.payload).map_err(|err| format!("bad payload: {err}"))?;
        self.broker
            .send(job.job_type, payload, job.dedupe_key.as_deref())
            .await
            .map_err(|err| err.to_string())
    }

    /// Runs the polling loop until the handle is stopped. A tick that
    /// overruns the interval is skipped, never stacked.
    pub fn spawn(self) -> DispatcherHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..=self.config.max_jitter);
            tokio::time::sleep(jitter).await;

            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(worker_id = %self.worker_id, "Outbox dispatcher started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.dispatch_once().await {
                            error!(%err, "Outbox dispatch tick failed");
                        }
                    }
                    _ = stopped.changed() => {
                        info!(worker_id = %self.worker_id, "Outbox dispatcher stopping");
                        break;
                    }
                }
            }
        });
        DispatcherHandle { stop, task }
    }
}
