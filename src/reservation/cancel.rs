//! Cancelling a hold, explicitly or by the expiry sweep. Explicit
//! cancellation refunds the prepaid amount inside the refund window; an
//! expired hold forfeits it.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::bike;
use crate::env::ReservationConfig;
use crate::rental;
use crate::reservation::{self, Reservation, ReservationOption, ReservationStatus};
use crate::wallet::{self, LedgerEntry, TransactionType, WalletError};

#[derive(Debug, thiserror::Error)]
pub enum CancelReservationError {
    #[error("reservation {reservation_id} not found")]
    ReservationNotFound { reservation_id: String },
    #[error("reservation {reservation_id} is not owned by the caller")]
    ReservationNotOwned { reservation_id: String },
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("refund failed: {0}")]
    Refund(WalletError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[tracing::instrument(skip(pool, config))]
pub async fn cancel_reservation(
    pool: &SqlitePool,
    config: &ReservationConfig,
    reservation_id: &str,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Reservation, CancelReservationError> {
    let mut tx = pool.begin().await?;

    let res = reservation::find_by_id(&mut tx, reservation_id)
        .await?
        .ok_or_else(|| CancelReservationError::ReservationNotFound {
            reservation_id: reservation_id.to_string(),
        })?;
    if res.user_id != user_id {
        return Err(CancelReservationError::ReservationNotOwned {
            reservation_id: reservation_id.to_string(),
        });
    }
    if res.status != ReservationStatus::Pending {
        return Err(CancelReservationError::InvalidTransition {
            from: res.status,
            to: ReservationStatus::Cancelled,
        });
    }

    if !reservation::cancel_pending(&mut tx, reservation_id, now).await? {
        let current = reservation::find_by_id(&mut tx, reservation_id)
            .await?
            .map(|r| r.status)
            .unwrap_or(ReservationStatus::Cancelled);
        return Err(CancelReservationError::InvalidTransition {
            from: current,
            to: ReservationStatus::Cancelled,
        });
    }

    rental::cancel_reserved(&mut tx, reservation_id, now).await?;
    if let Some(bike_id) = &res.bike_id {
        bike::release_if_reserved(&mut tx, bike_id, now).await?;
    }

    if refund_applies(&res, config, now) {
        let entry = LedgerEntry::credit(&res.user_id, res.prepaid)
            .with_type(TransactionType::Refund)
            .with_description(format!("Refund cancelled reservation {reservation_id}"))
            .with_hash(format!("refund:reservation:{reservation_id}"));
        wallet::credit(&mut tx, &entry, now)
            .await
            .map_err(CancelReservationError::Refund)?;
    }

    let cancelled = reservation::find_by_id(&mut tx, reservation_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    tx.commit().await?;

    info!(reservation_id, refunded = refund_applies(&res, config, now), "Hold cancelled");
    Ok(cancelled)
}

fn refund_applies(res: &Reservation, config: &ReservationConfig, now: DateTime<Utc>) -> bool {
    res.reservation_option == ReservationOption::OneTime
        && res.prepaid > 0
        && res.created_at + config.refund_period > now
}

/// Cancels every PENDING hold whose window lapsed: bike released, rental
/// cancelled, prepaid forfeited. Runs on the sweep schedule; between expiry
/// and the next tick a hold is logically expired but still PENDING.
pub async fn sweep_expired_holds(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let expired = sqlx::query_as::<_, Reservation>(
        "SELECT id, user_id, bike_id, station_id, reservation_option, subscription_id, \
                status, start_time, end_time, prepaid, created_at, updated_at \
         FROM reservations WHERE status = 'PENDING' AND end_time IS NOT NULL AND end_time <= ?1",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    let mut swept = 0;
    for res in expired {
        let mut tx = pool.begin().await?;
        if !reservation::cancel_pending(&mut tx, &res.id, now).await? {
            // Confirmed or cancelled since the select; leave it alone.
            continue;
        }
        rental::cancel_reserved(&mut tx, &res.id, now).await?;
        if let Some(bike_id) = &res.bike_id {
            bike::release_if_reserved(&mut tx, bike_id, now).await?;
        }
        tx.commit().await?;

        warn!(reservation_id = %res.id, prepaid = res.prepaid, "Expired hold swept");
        swept += 1;
    }

    Ok(swept)
}
