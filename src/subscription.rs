//! Subscription usage gate. The engine consumes a narrow contract: resolve a
//! subscription, decide whether it can fund a reservation, and burn one usage
//! inside the reservation transaction. Activation and expiry are driven by
//! background jobs.

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub status: SubscriptionStatus,
    pub max_usages: i64,
    pub usage_count: i64,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of asking whether a subscription may fund a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usability {
    Usable,
    /// Not owned by the requesting user, or not ACTIVE (carries the
    /// effective status the caller should report).
    NotUsable(SubscriptionStatus),
    UsageExceeded { usage_count: i64, max_usages: i64 },
}

impl Subscription {
    pub fn is_usable(&self, user_id: &str, now: DateTime<Utc>) -> Usability {
        if self.user_id != user_id {
            return Usability::NotUsable(self.status);
        }
        if self.status != SubscriptionStatus::Active {
            return Usability::NotUsable(self.status);
        }
        // The expiry sweep lags real time; treat a lapsed window as EXPIRED
        // even before the sweep rewrites the row.
        if matches!(self.expires_at, Some(expires_at) if expires_at <= now) {
            return Usability::NotUsable(SubscriptionStatus::Expired);
        }
        if self.usage_count >= self.max_usages {
            return Usability::UsageExceeded {
                usage_count: self.usage_count,
                max_usages: self.max_usages,
            };
        }
        Usability::Usable
    }
}

const SELECT_COLUMNS: &str =
    "id, user_id, status, max_usages, usage_count, starts_at, expires_at, updated_at";

pub(crate) async fn get_by_id(
    conn: &mut SqliteConnection,
    subscription_id: &str,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {SELECT_COLUMNS} FROM subscriptions WHERE id = ?1"
    ))
    .bind(subscription_id)
    .fetch_optional(conn)
    .await
}

/// Burns one usage. Guarded against the cap so two concurrent reservations
/// cannot both consume the final usage.
pub(crate) async fn increment_usage(
    conn: &mut SqliteConnection,
    subscription_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE subscriptions SET usage_count = usage_count + 1, updated_at = ?1 \
         WHERE id = ?2 AND status = 'ACTIVE' AND usage_count < max_usages",
    )
    .bind(now)
    .bind(subscription_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// PENDING -> ACTIVE, refused while the user already has an ACTIVE
/// subscription. Used by the auto-activate worker.
pub(crate) async fn activate_pending(
    conn: &mut SqliteConnection,
    subscription_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE subscriptions SET status = 'ACTIVE', starts_at = ?1, updated_at = ?1 \
         WHERE id = ?2 AND status = 'PENDING' AND NOT EXISTS (\
             SELECT 1 FROM subscriptions other \
             WHERE other.user_id = subscriptions.user_id \
               AND other.status = 'ACTIVE' AND other.id <> subscriptions.id)",
    )
    .bind(now)
    .bind(subscription_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Expiry sweep: flips every ACTIVE subscription whose window lapsed.
pub async fn mark_expired(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE subscriptions SET status = 'EXPIRED', updated_at = ?1 \
         WHERE status = 'ACTIVE' AND expires_at IS NOT NULL AND expires_at <= ?1",
    )
    .bind(now)
    .execute(pool)
    .await?;

    let expired = result.rows_affected();
    if expired > 0 {
        info!(expired, "Expired lapsed subscriptions");
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{seed_subscription, seed_user, setup_test_db, SubscriptionSeed};

    #[tokio::test]
    async fn usability_covers_ownership_status_and_cap() {
        let now = Utc::now();
        let sub = Subscription {
            id: "sub-1".into(),
            user_id: "user-1".into(),
            status: SubscriptionStatus::Active,
            max_usages: 2,
            usage_count: 0,
            starts_at: Some(now),
            expires_at: Some(now + chrono::Duration::days(30)),
            updated_at: now,
        };

        assert_eq!(sub.is_usable("user-1", now), Usability::Usable);
        assert_eq!(
            sub.is_usable("someone-else", now),
            Usability::NotUsable(SubscriptionStatus::Active)
        );

        let cancelled = Subscription {
            status: SubscriptionStatus::Cancelled,
            ..sub.clone()
        };
        assert_eq!(
            cancelled.is_usable("user-1", now),
            Usability::NotUsable(SubscriptionStatus::Cancelled)
        );

        let lapsed = Subscription {
            expires_at: Some(now - chrono::Duration::minutes(1)),
            ..sub.clone()
        };
        assert_eq!(
            lapsed.is_usable("user-1", now),
            Usability::NotUsable(SubscriptionStatus::Expired)
        );

        let spent = Subscription {
            usage_count: 2,
            ..sub
        };
        assert_eq!(
            spent.is_usable("user-1", now),
            Usability::UsageExceeded {
                usage_count: 2,
                max_usages: 2
            }
        );
    }

    #[tokio::test]
    async fn increment_usage_stops_at_cap() {
        let pool = setup_test_db().await;
        seed_user(&pool, "user-1").await;
        seed_subscription(
            &pool,
            SubscriptionSeed {
                id: "sub-1",
                user_id: "user-1",
                status: SubscriptionStatus::Active,
                max_usages: 1,
                usage_count: 0,
            },
        )
        .await;

        let now = Utc::now();
        let mut conn = pool.acquire().await.unwrap();
        assert!(increment_usage(&mut conn, "sub-1", now).await.unwrap());
        assert!(!increment_usage(&mut conn, "sub-1", now).await.unwrap());

        let sub = get_by_id(&mut conn, "sub-1").await.unwrap().unwrap();
        assert_eq!(sub.usage_count, 1);
    }

    #[tokio::test]
    async fn activate_pending_refuses_second_active() {
        let pool = setup_test_db().await;
        seed_user(&pool, "user-1").await;
        seed_subscription(
            &pool,
            SubscriptionSeed {
                id: "sub-active",
                user_id: "user-1",
                status: SubscriptionStatus::Active,
                max_usages: 10,
                usage_count: 0,
            },
        )
        .await;
        seed_subscription(
            &pool,
            SubscriptionSeed {
                id: "sub-pending",
                user_id: "user-1",
                status: SubscriptionStatus::Pending,
                max_usages: 10,
                usage_count: 0,
            },
        )
        .await;

        let mut conn = pool.acquire().await.unwrap();
        assert!(!activate_pending(&mut conn, "sub-pending", Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn mark_expired_only_touches_lapsed_active_rows() {
        let pool = setup_test_db().await;
        seed_user(&pool, "user-1").await;
        let now = Utc::now();

        seed_subscription(
            &pool,
            SubscriptionSeed {
                id: "sub-lapsed",
                user_id: "user-1",
                status: SubscriptionStatus::Active,
                max_usages: 10,
                usage_count: 0,
            },
        )
        .await;
        sqlx::query("UPDATE subscriptions SET expires_at = ?1 WHERE id = 'sub-lapsed'")
            .bind(now - chrono::Duration::hours(1))
            .execute(&pool)
            .await
            .unwrap();

        let expired = mark_expired(&pool, now).await.unwrap();
        assert_eq!(expired, 1);

        let mut conn = pool.acquire().await.unwrap();
        let sub = get_by_id(&mut conn, "sub-lapsed").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Expired);
    }
}
