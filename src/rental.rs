//! Rental shadow rows. Every reservation carries exactly one rental; it is
//! born RESERVED, flips to ONGOING on confirmation, and is CANCELLED with the
//! hold. Trip completion and billing live in the ride service.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RentalStatus {
    Reserved,
    Ongoing,
    Cancelled,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Rental {
    pub id: String,
    pub reservation_id: String,
    pub user_id: String,
    pub bike_id: String,
    pub start_station_id: String,
    pub status: RentalStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) async fn find_by_reservation(
    conn: &mut SqliteConnection,
    reservation_id: &str,
) -> Result<Option<Rental>, sqlx::Error> {
    sqlx::query_as::<_, Rental>(
        "SELECT id, reservation_id, user_id, bike_id, start_station_id, status, \
                start_time, updated_at \
         FROM rentals WHERE reservation_id = ?1",
    )
    .bind(reservation_id)
    .fetch_optional(conn)
    .await
}

/// Inserts the RESERVED rental inside the reservation transaction.
pub(crate) async fn create_reserved(
    conn: &mut SqliteConnection,
    reservation_id: &str,
    user_id: &str,
    bike_id: &str,
    station_id: &str,
    now: DateTime<Utc>,
) -> Result<String, sqlx::Error> {
    let rental_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO rentals \
         (id, reservation_id, user_id, bike_id, start_station_id, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'RESERVED', ?6, ?6)",
    )
    .bind(&rental_id)
    .bind(reservation_id)
    .bind(user_id)
    .bind(bike_id)
    .bind(station_id)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(rental_id)
}

/// RESERVED -> ONGOING, stamping the trip start. Returns false when no
/// RESERVED rental exists for the reservation.
pub(crate) async fn start_reserved(
    conn: &mut SqliteConnection,
    reservation_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE rentals SET status = 'ONGOING', start_time = ?1, updated_at = ?1 \
         WHERE reservation_id = ?2 AND status = 'RESERVED'",
    )
    .bind(now)
    .bind(reservation_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// RESERVED -> CANCELLED, used by explicit cancellation and the hold sweep.
pub(crate) async fn cancel_reserved(
    conn: &mut SqliteConnection,
    reservation_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE rentals SET status = 'CANCELLED', updated_at = ?1 \
         WHERE reservation_id = ?2 AND status = 'RESERVED'",
    )
    .bind(now)
    .bind(reservation_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}
