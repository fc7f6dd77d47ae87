//! Confirming a hold into an active rental. The bike's state may have
//! drifted since the hold was taken, so everything is re-validated inside
//! the confirming transaction.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::bike::{self, BikeStatus};
use crate::rental;
use crate::reservation::{self, Reservation, ReservationStatus};

#[derive(Debug, thiserror::Error)]
pub enum ConfirmReservationError {
    #[error("reservation {reservation_id} not found")]
    ReservationNotFound { reservation_id: String },
    #[error("reservation {reservation_id} is not owned by the caller")]
    ReservationNotOwned { reservation_id: String },
    #[error("reservation {reservation_id} has no bike bound")]
    ReservationMissingBike { reservation_id: String },
    #[error("bike {bike_id} not found")]
    BikeNotFound { bike_id: String },
    #[error("bike {bike_id} is {status}, cannot confirm")]
    BikeNotAvailable { bike_id: String, status: BikeStatus },
    #[error("hold expired at {expired_at}")]
    HoldExpired { expired_at: DateTime<Utc> },
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// Every reservation is created with a RESERVED rental; its absence here
    /// is an invariant violation, not a user error.
    #[error("no reserved rental found for reservation {reservation_id}")]
    ReservedRentalNotFound { reservation_id: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[tracing::instrument(skip(pool))]
pub async fn confirm_reservation(
    pool: &SqlitePool,
    reservation_id: &str,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Reservation, ConfirmReservationError> {
    let mut tx = pool.begin().await?;

    let res = reservation::find_by_id(&mut tx, reservation_id)
        .await?
        .ok_or_else(|| ConfirmReservationError::ReservationNotFound {
            reservation_id: reservation_id.to_string(),
        })?;
    if res.user_id != user_id {
        return Err(ConfirmReservationError::ReservationNotOwned {
            reservation_id: reservation_id.to_string(),
        });
    }
    let bike_id = res.bike_id.clone().ok_or_else(|| {
        ConfirmReservationError::ReservationMissingBike {
            reservation_id: reservation_id.to_string(),
        }
    })?;

    let bike = bike::get_by_id(&mut tx, &bike_id)
        .await?
        .ok_or_else(|| ConfirmReservationError::BikeNotFound {
            bike_id: bike_id.clone(),
        })?;
    if bike.status != BikeStatus::Reserved {
        return Err(ConfirmReservationError::BikeNotAvailable {
            bike_id,
            status: bike.status,
        });
    }

    if res.status != ReservationStatus::Pending {
        return Err(ConfirmReservationError::InvalidTransition {
            from: res.status,
            to: ReservationStatus::Active,
        });
    }
    // The sweep may not have run yet; a lapsed hold cannot be confirmed.
    if let Some(end_time) = res.end_time {
        if end_time <= now {
            return Err(ConfirmReservationError::HoldExpired {
                expired_at: end_time,
            });
        }
    }

    if !rental::start_reserved(&mut tx, reservation_id, now).await? {
        return Err(ConfirmReservationError::ReservedRentalNotFound {
            reservation_id: reservation_id.to_string(),
        });
    }

    if !bike::book_if_reserved(&mut tx, &bike_id, now).await? {
        let status = bike::get_by_id(&mut tx, &bike_id)
            .await?
            .map(|b| b.status)
            .ok_or_else(|| ConfirmReservationError::BikeNotFound {
                bike_id: bike_id.clone(),
            })?;
        return Err(ConfirmReservationError::BikeNotAvailable { bike_id, status });
    }

    if !reservation::activate(&mut tx, reservation_id, now).await? {
        // Lost a race with a concurrent transition of the same row.
        let current = reservation::find_by_id(&mut tx, reservation_id)
            .await?
            .map(|r| r.status)
            .unwrap_or(ReservationStatus::Cancelled);
        return Err(ConfirmReservationError::InvalidTransition {
            from: current,
            to: ReservationStatus::Active,
        });
    }

    let confirmed = reservation::find_by_id(&mut tx, reservation_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    tx.commit().await?;

    info!(reservation_id, "Hold confirmed into active rental");
    Ok(confirmed)
}
