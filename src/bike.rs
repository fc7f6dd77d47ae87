//! Bike state reader/writer. The reservation engine owns bike status flips as
//! a side effect of hold transitions; every flip is a guarded single-statement
//! update so a stale read can never clobber a concurrent transition.

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BikeStatus {
    Available,
    Reserved,
    Booked,
    Maintenance,
}

impl BikeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Reserved => "RESERVED",
            Self::Booked => "BOOKED",
            Self::Maintenance => "MAINTENANCE",
        }
    }
}

impl fmt::Display for BikeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Bike {
    pub id: String,
    pub station_id: Option<String>,
    pub status: BikeStatus,
    pub updated_at: DateTime<Utc>,
}

pub(crate) async fn get_by_id(
    conn: &mut SqliteConnection,
    bike_id: &str,
) -> Result<Option<Bike>, sqlx::Error> {
    sqlx::query_as::<_, Bike>("SELECT id, station_id, status, updated_at FROM bikes WHERE id = ?1")
        .bind(bike_id)
        .fetch_optional(conn)
        .await
}

pub async fn list_by_station(
    pool: &SqlitePool,
    station_id: &str,
) -> Result<Vec<Bike>, sqlx::Error> {
    sqlx::query_as::<_, Bike>(
        "SELECT id, station_id, status, updated_at FROM bikes WHERE station_id = ?1 ORDER BY id",
    )
    .bind(station_id)
    .fetch_all(pool)
    .await
}

async fn transition(
    conn: &mut SqliteConnection,
    bike_id: &str,
    from: BikeStatus,
    to: BikeStatus,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE bikes SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4")
        .bind(to)
        .bind(now)
        .bind(bike_id)
        .bind(from)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// AVAILABLE -> RESERVED. Returns false if the bike moved out from under us.
pub(crate) async fn reserve_if_available(
    conn: &mut SqliteConnection,
    bike_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    transition(conn, bike_id, BikeStatus::Available, BikeStatus::Reserved, now).await
}

/// RESERVED -> BOOKED, taken when a hold is confirmed into a rental.
pub(crate) async fn book_if_reserved(
    conn: &mut SqliteConnection,
    bike_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    transition(conn, bike_id, BikeStatus::Reserved, BikeStatus::Booked, now).await
}

/// RESERVED -> AVAILABLE, taken when a hold is cancelled or expires.
pub(crate) async fn release_if_reserved(
    conn: &mut SqliteConnection,
    bike_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    transition(conn, bike_id, BikeStatus::Reserved, BikeStatus::Available, now).await
}
