//! In-process job broker: one mpsc queue per job type, at-least-once
//! delivery with a per-queue retry budget, singleton-key dedupe, and a
//! log-only DLQ. Stands in for an external queue behind the [`JobBroker`]
//! seam.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::jobs::{BrokerError, JobBroker, JobError, JobType};

/// Handles one queue's deliveries.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), JobError>;
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Retries after the first attempt, for `Retryable` failures only.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

struct QueuedJob {
    payload: serde_json::Value,
    dedupe_key: Option<String>,
}

struct Inner {
    queues: Mutex<HashMap<JobType, mpsc::UnboundedSender<QueuedJob>>>,
    /// Singleton keys currently queued or in flight.
    inflight: Mutex<HashSet<String>>,
    options: BrokerOptions,
    processed: AtomicU64,
    dlq_depth: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct InProcessBroker {
    inner: Arc<Inner>,
}

impl InProcessBroker {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashSet::new()),
                options,
                processed: AtomicU64::new(0),
                dlq_depth: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers `handler` as the consumer for `job_type`'s queue.
    pub fn work(&self, job_type: JobType, handler: impl JobHandler) {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedJob>();
        self.inner
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job_type, tx);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            info!(queue = job_type.queue_name(), "Worker consuming");
            while let Some(job) = rx.recv().await {
                inner.consume(job_type, &handler, job).await;
            }
        });
        self.push_task(task);
    }

    /// Enqueues `job_type` with an empty payload every `every`. Used for the
    /// sweep queues.
    pub fn schedule(&self, job_type: JobType, every: Duration) {
        let broker = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would race startup; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = broker
                    .send(job_type, serde_json::Value::Null, None)
                    .await
                {
                    warn!(queue = job_type.queue_name(), %err, "Scheduled enqueue failed");
                }
            }
        });
        self.push_task(task);
    }

    fn push_task(&self, task: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    /// Stops consumers and schedules. Queued jobs are dropped.
    pub fn shutdown(&self) {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Jobs settled (handled or dead-lettered) since startup.
    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::SeqCst)
    }

    pub fn dlq_depth(&self) -> u64 {
        self.inner.dlq_depth.load(Ordering::SeqCst)
    }
}

impl Inner {
    async fn consume(&self, job_type: JobType, handler: &impl JobHandler, job: QueuedJob) {
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match handler.handle(job.payload.clone()).await {
                Ok(()) => break Ok(()),
                Err(JobError::Fatal(reason)) => break Err(reason),
                Err(JobError::Retryable(reason)) => {
                    if attempt > self.options.max_retries {
                        break Err(reason);
                    }
                    debug!(queue = job_type.queue_name(), attempt, %reason, "Retrying job");
                    tokio::time::sleep(self.options.retry_delay).await;
                }
            }
        };

        if let Err(reason) = outcome {
            // The DLQ's only consumer is this log line; recovery is manual.
            self.dlq_depth.fetch_add(1, Ordering::SeqCst);
            error!(
                dlq = %job_type.dlq_name(),
                dedupe_key = ?job.dedupe_key,
                %reason,
                "Job dead-lettered"
            );
        }

        if let Some(key) = &job.dedupe_key {
            // Must survive a poisoned lock; a leaked key would suppress this
            // key's sends for the life of the broker.
            self.inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(key);
        }
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobBroker for InProcessBroker {
    async fn send(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        dedupe_key: Option<&str>,
    ) -> Result<(), BrokerError> {
        if let Some(key) = dedupe_key {
            let mut inflight = self
                .inner
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !inflight.insert(key.to_string()) {
                debug!(queue = job_type.queue_name(), key, "Duplicate send suppressed");
                return Ok(());
            }
        }

        let sender = {
            let queues = self
                .inner
                .queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queues.get(&job_type).cloned()
        };
        let Some(sender) = sender else {
            self.release_key(dedupe_key);
            return Err(BrokerError::NoWorker {
                queue: job_type.queue_name().to_string(),
            });
        };

        if sender
            .send(QueuedJob {
                payload,
                dedupe_key: dedupe_key.map(str::to_string),
            })
            .is_err()
        {
            self.release_key(dedupe_key);
            return Err(BrokerError::QueueClosed {
                queue: job_type.queue_name().to_string(),
            });
        }
        Ok(())
    }
}

impl InProcessBroker {
    fn release_key(&self, dedupe_key: Option<&str>) {
        if let Some(key) = dedupe_key {
            self.inner
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(key);
        }
    }
}

#[cfg(test)]
impl InProcessBroker {
    /// Polls until `n` jobs have settled or the timeout lapses.
    pub async fn wait_for_processed(&self, n: u64, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.processed() < n {
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {n} processed jobs, saw {}", self.processed());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
