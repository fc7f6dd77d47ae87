//! Reservation state machine. A hold is born PENDING with a bounded window,
//! then confirmed into ACTIVE or cancelled (explicitly or by the expiry
//! sweep). Terminal rows are never touched again; every transition is a
//! guarded update inside one transaction.

pub mod cancel;
pub mod confirm;
pub mod reserve;

pub use cancel::{cancel_reservation, sweep_expired_holds, CancelReservationError};
pub use confirm::{confirm_reservation, ConfirmReservationError};
pub use reserve::{reserve_bike, ReserveBikeError, ReserveBikeInput};

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Active,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationOption {
    OneTime,
    Subscription,
    /// Accepted on the wire, not yet supported by the engine.
    FixedSlot,
}

impl fmt::Display for ReservationOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OneTime => "ONE_TIME",
            Self::Subscription => "SUBSCRIPTION",
            Self::FixedSlot => "FIXED_SLOT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub bike_id: Option<String>,
    pub station_id: String,
    pub reservation_option: ReservationOption,
    pub subscription_id: Option<String>,
    pub status: ReservationStatus,
    pub start_time: DateTime<Utc>,
    /// Hold expiry. Cleared once the reservation goes ACTIVE.
    pub end_time: Option<DateTime<Utc>>,
    /// Minor units debited when the hold was taken; zero when
    /// subscription-funded.
    pub prepaid: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const RESERVATION_COLUMNS: &str = "id, user_id, bike_id, station_id, reservation_option, \
     subscription_id, status, start_time, end_time, prepaid, created_at, updated_at";

pub(crate) async fn find_by_id(
    conn: &mut SqliteConnection,
    reservation_id: &str,
) -> Result<Option<Reservation>, sqlx::Error> {
    sqlx::query_as::<_, Reservation>(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = ?1"
    ))
    .bind(reservation_id)
    .fetch_optional(conn)
    .await
}

/// "Non-terminal" covers PENDING and ACTIVE; one per user at any time.
pub(crate) async fn find_non_terminal_for_user(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Option<Reservation>, sqlx::Error> {
    sqlx::query_as::<_, Reservation>(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM reservations \
         WHERE user_id = ?1 AND status IN ('PENDING', 'ACTIVE') LIMIT 1"
    ))
    .bind(user_id)
    .fetch_optional(conn)
    .await
}

/// True when another PENDING hold on this bike overlaps `[start, end)`.
pub(crate) async fn has_overlapping_hold(
    conn: &mut SqliteConnection,
    bike_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let found = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM reservations \
         WHERE bike_id = ?1 AND status = 'PENDING' \
           AND start_time < ?2 AND (end_time IS NULL OR end_time > ?3) \
         LIMIT 1",
    )
    .bind(bike_id)
    .bind(end)
    .bind(start)
    .fetch_optional(conn)
    .await?;
    Ok(found.is_some())
}

/// PENDING -> ACTIVE, clearing the hold window.
pub(crate) async fn activate(
    conn: &mut SqliteConnection,
    reservation_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE reservations SET status = 'ACTIVE', end_time = NULL, updated_at = ?1 \
         WHERE id = ?2 AND status = 'PENDING'",
    )
    .bind(now)
    .bind(reservation_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// PENDING -> CANCELLED.
pub(crate) async fn cancel_pending(
    conn: &mut SqliteConnection,
    reservation_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE reservations SET status = 'CANCELLED', updated_at = ?1 \
         WHERE id = ?2 AND status = 'PENDING'",
    )
    .bind(now)
    .bind(reservation_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}
