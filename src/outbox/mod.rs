//! Transactional outbox. Side effects of a business transaction are written
//! as job rows in that same transaction; the dispatcher later claims and
//! forwards them to the broker. A claim is a guarded UPDATE, so two
//! dispatchers can never deliver the same row, and a crashed claimant's rows
//! become claimable again after the claim TTL.

pub mod dispatcher;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::jobs::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
    /// Terminal. Attempts hit the ceiling; operator intervention only.
    Failed,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxJob {
    pub id: String,
    pub job_type: JobType,
    /// JSON payload, opaque to the outbox.
    pub payload: String,
    pub dedupe_key: Option<String>,
    pub status: OutboxStatus,
    pub attempts: i64,
    pub run_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Retry schedule: exponential backoff from `base_delay`, capped at
/// `max_delay`; FAILED once `max_attempts` deliveries have been tried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::seconds(30),
            max_delay: Duration::minutes(15),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next try, given how many attempts have already run.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let delay = self.base_delay * 2_i32.pow(exponent);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct NewOutboxJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    /// Unique across the table; a second enqueue with the same key is a
    /// silent no-op.
    pub dedupe_key: Option<String>,
    pub run_at: DateTime<Utc>,
}

impl NewOutboxJob {
    pub fn new(job_type: JobType, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            job_type,
            payload: serde_json::to_value(payload)?,
            dedupe_key: None,
            run_at: Utc::now(),
        })
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = at;
        self
    }
}

const JOB_COLUMNS: &str = "id, job_type, payload, dedupe_key, status, attempts, run_at, \
     claimed_by, claimed_at, last_error, sent_at, created_at";

/// Enqueues inside the caller's transaction. Returns the job id, or `None`
/// when the dedupe key already exists.
pub(crate) async fn enqueue(
    conn: &mut SqliteConnection,
    job: &NewOutboxJob,
    now: DateTime<Utc>,
) -> Result<Option<String>, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let result = sqlx::query(
        "INSERT INTO outbox_jobs \
         (id, job_type, payload, dedupe_key, status, attempts, run_at, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 'PENDING', 0, ?5, ?6, ?6) \
         ON CONFLICT (dedupe_key) DO NOTHING",
    )
    .bind(&id)
    .bind(job.job_type)
    .bind(job.payload.to_string())
    .bind(&job.dedupe_key)
    .bind(job.run_at)
    .bind(now)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        warn!(job_type = %job.job_type, dedupe_key = ?job.dedupe_key, "Duplicate outbox enqueue skipped");
        return Ok(None);
    }
    Ok(Some(id))
}

/// Atomically claims up to `limit` due PENDING jobs for `worker_id`. A row
/// already claimed within `claim_ttl` is skipped; older claims are treated as
/// abandoned and stolen.
pub(crate) async fn claim_due_jobs(
    pool: &SqlitePool,
    worker_id: &str,
    limit: u32,
    claim_ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<OutboxJob>, sqlx::Error> {
    let stale_before = now - claim_ttl;
    sqlx::query_as::<_, OutboxJob>(&format!(
        "UPDATE outbox_jobs \
         SET claimed_by = ?1, claimed_at = ?2, attempts = attempts + 1, updated_at = ?2 \
         WHERE id IN (\
             SELECT id FROM outbox_jobs \
             WHERE status = 'PENDING' AND run_at <= ?2 \
               AND (claimed_at IS NULL OR claimed_at < ?3) \
             ORDER BY run_at LIMIT ?4) \
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(worker_id)
    .bind(now)
    .bind(stale_before)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await
}

/// PENDING -> SENT for a job this worker still holds.
pub(crate) async fn mark_sent(
    pool: &SqlitePool,
    job_id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE outbox_jobs SET status = 'SENT', sent_at = ?1, last_error = NULL, updated_at = ?1 \
         WHERE id = ?2 AND status = 'PENDING' AND claimed_by = ?3",
    )
    .bind(now)
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Records a delivery failure: reschedules with backoff while attempts remain,
/// otherwise FAILED for good.
pub(crate) async fn reschedule_or_fail(
    pool: &SqlitePool,
    job: &OutboxJob,
    error: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<OutboxStatus, sqlx::Error> {
    if job.attempts >= i64::from(policy.max_attempts) {
        sqlx::query(
            "UPDATE outbox_jobs SET status = 'FAILED', last_error = ?1, \
             claimed_by = NULL, claimed_at = NULL, updated_at = ?2 \
             WHERE id = ?3 AND status = 'PENDING'",
        )
        .bind(error)
        .bind(now)
        .bind(&job.id)
        .execute(pool)
        .await?;
        return Ok(OutboxStatus::Failed);
    }

    let next_run = now + policy.delay_after(job.attempts as u32);
    sqlx::query(
        "UPDATE outbox_jobs SET run_at = ?1, last_error = ?2, \
         claimed_by = NULL, claimed_at = NULL, updated_at = ?3 \
         WHERE id = ?4 AND status = 'PENDING'",
    )
    .bind(next_run)
    .bind(error)
    .bind(now)
    .bind(&job.id)
    .execute(pool)
    .await?;
    Ok(OutboxStatus::Pending)
}

pub(crate) async fn find_by_id(
    pool: &SqlitePool,
    job_id: &str,
) -> Result<Option<OutboxJob>, sqlx::Error> {
    sqlx::query_as::<_, OutboxJob>(&format!(
        "SELECT {JOB_COLUMNS} FROM outbox_jobs WHERE id = ?1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{enqueue_job, setup_test_db};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::seconds(30));
        assert_eq!(policy.delay_after(2), Duration::minutes(1));
        assert_eq!(policy.delay_after(3), Duration::minutes(2));
        assert_eq!(policy.delay_after(10), Duration::minutes(15));
    }

    #[tokio::test]
    async fn dedupe_key_makes_enqueue_idempotent() {
        let pool = setup_test_db().await;
        let now = Utc::now();

        let mut conn = pool.acquire().await.unwrap();
        let job = NewOutboxJob::new(JobType::EmailSend, &serde_json::json!({"v": 1}))
            .unwrap()
            .with_dedupe_key("email:once")
            .run_at(now);
        assert!(enqueue(&mut conn, &job, now).await.unwrap().is_some());
        assert!(enqueue(&mut conn, &job, now).await.unwrap().is_none());
        drop(conn);

        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outbox_jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive_between_workers() {
        let pool = setup_test_db().await;
        let now = Utc::now();
        enqueue_job(&pool, JobType::EmailSend, None, now).await;

        let ttl = Duration::minutes(5);
        let first = claim_due_jobs(&pool, "worker-a", 10, ttl, now).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempts, 1);

        let second = claim_due_jobs(&pool, "worker-b", 10, ttl, now).await.unwrap();
        assert!(second.is_empty());

        // After the claim TTL lapses the row is claimable again.
        let later = now + Duration::minutes(6);
        let stolen = claim_due_jobs(&pool, "worker-b", 10, ttl, later).await.unwrap();
        assert_eq!(stolen.len(), 1);
        assert_eq!(stolen[0].attempts, 2);
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimed() {
        let pool = setup_test_db().await;
        let now = Utc::now();
        enqueue_job(&pool, JobType::EmailSend, None, now + Duration::minutes(10)).await;

        let claimed = claim_due_jobs(&pool, "worker-a", 10, Duration::minutes(5), now)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn failures_reschedule_then_fail_terminally() {
        let pool = setup_test_db().await;
        let mut now = Utc::now();
        let job_id = enqueue_job(&pool, JobType::EmailSend, None, now).await;

        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let ttl = Duration::minutes(5);

        let claimed = claim_due_jobs(&pool, "w", 10, ttl, now).await.unwrap();
        let status = reschedule_or_fail(&pool, &claimed[0], "boom", &policy, now)
            .await
            .unwrap();
        assert_eq!(status, OutboxStatus::Pending);

        let job = find_by_id(&pool, &job_id).await.unwrap().unwrap();
        assert!(job.run_at > now);
        assert_eq!(job.last_error.as_deref(), Some("boom"));

        now = job.run_at + Duration::seconds(1);
        let claimed = claim_due_jobs(&pool, "w", 10, ttl, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let status = reschedule_or_fail(&pool, &claimed[0], "boom again", &policy, now)
            .await
            .unwrap();
        assert_eq!(status, OutboxStatus::Failed);

        let job = find_by_id(&pool, &job_id).await.unwrap().unwrap();
        assert_eq!(job.status, OutboxStatus::Failed);
        assert_eq!(job.attempts, 2);

        // Terminal: never claimed again.
        let claimed = claim_due_jobs(&pool, "w", 10, ttl, now + Duration::hours(1))
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn mark_sent_requires_the_claim() {
        let pool = setup_test_db().await;
        let now = Utc::now();
        enqueue_job(&pool, JobType::EmailSend, None, now).await;

        let claimed = claim_due_jobs(&pool, "worker-a", 10, Duration::minutes(5), now)
            .await
            .unwrap();
        assert!(!mark_sent(&pool, &claimed[0].id, "worker-b", now).await.unwrap());
        assert!(mark_sent(&pool, &claimed[0].id, "worker-a", now).await.unwrap());

        let job = find_by_id(&pool, &claimed[0].id).await.unwrap().unwrap();
        assert_eq!(job.status, OutboxStatus::Sent);
        assert!(job.sent_at.is_some());
    }
}
