//! Taking a hold. All validation and every write happen inside one
//! transaction, so a failure after validation rolls back the debit, the
//! reservation, the rental, the bike flip, and the outbox rows together.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::bike::{self, BikeStatus};
use crate::env::ReservationConfig;
use crate::jobs::{EmailPayload, JobType, ReservationJobPayload, PAYLOAD_VERSION};
use crate::outbox::{self, NewOutboxJob};
use crate::rental;
use crate::reservation::{self, Reservation, ReservationOption};
use crate::subscription::{self, SubscriptionStatus, Usability};
use crate::user;
use crate::wallet::{self, LedgerEntry, WalletError};

#[derive(Debug, thiserror::Error)]
pub enum ReserveBikeError {
    #[error("user already holds reservation {reservation_id}")]
    ActiveReservationExists { reservation_id: String },
    #[error("bike {bike_id} not found")]
    BikeNotFound { bike_id: String },
    #[error("bike {bike_id} does not belong to station {station_id}")]
    BikeNotFoundInStation { bike_id: String, station_id: String },
    #[error("bike {bike_id} already has an overlapping hold")]
    BikeAlreadyReserved { bike_id: String },
    #[error("bike {bike_id} is {status}, not available")]
    BikeNotAvailable { bike_id: String, status: BikeStatus },
    #[error("reservation option {option} is not supported")]
    OptionNotSupported { option: ReservationOption },
    #[error("a subscription id is required for subscription-funded holds")]
    SubscriptionRequired,
    #[error("subscription {subscription_id} not found")]
    SubscriptionNotFound { subscription_id: String },
    #[error("subscription is not usable (status {status})")]
    SubscriptionNotUsable { status: SubscriptionStatus },
    #[error("subscription usage exceeded ({usage_count}/{max_usages})")]
    SubscriptionUsageExceeded { usage_count: i64, max_usages: i64 },
    #[error("wallet not found for user {user_id}")]
    WalletNotFound { user_id: String },
    #[error("wallet is frozen")]
    WalletFrozen,
    #[error("insufficient wallet balance: have {balance}, attempted debit {attempted_debit}")]
    InsufficientWalletBalance { balance: i64, attempted_debit: i64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<serde_json::Error> for ReserveBikeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Database(sqlx::Error::Encode(Box::new(err)))
    }
}

#[derive(Debug, Clone)]
pub struct ReserveBikeInput {
    pub user_id: String,
    pub bike_id: String,
    pub station_id: String,
    pub reservation_option: ReservationOption,
    pub subscription_id: Option<String>,
    pub start_time: DateTime<Utc>,
}

#[tracing::instrument(skip(pool, config, input), fields(user_id = %input.user_id, bike_id = %input.bike_id))]
pub async fn reserve_bike(
    pool: &SqlitePool,
    config: &ReservationConfig,
    input: ReserveBikeInput,
    now: DateTime<Utc>,
) -> Result<Reservation, ReserveBikeError> {
    let mut tx = pool.begin().await?;
    let end_time = now + config.hold_duration;

    if let Some(existing) = reservation::find_non_terminal_for_user(&mut tx, &input.user_id).await?
    {
        return Err(ReserveBikeError::ActiveReservationExists {
            reservation_id: existing.id,
        });
    }

    let bike = bike::get_by_id(&mut tx, &input.bike_id)
        .await?
        .ok_or_else(|| ReserveBikeError::BikeNotFound {
            bike_id: input.bike_id.clone(),
        })?;
    if bike.station_id.as_deref() != Some(input.station_id.as_str()) {
        return Err(ReserveBikeError::BikeNotFoundInStation {
            bike_id: input.bike_id,
            station_id: input.station_id,
        });
    }

    if reservation::has_overlapping_hold(&mut tx, &input.bike_id, input.start_time, end_time)
        .await?
    {
        return Err(ReserveBikeError::BikeAlreadyReserved {
            bike_id: input.bike_id,
        });
    }

    if bike.status != BikeStatus::Available {
        return Err(ReserveBikeError::BikeNotAvailable {
            bike_id: input.bike_id,
            status: bike.status,
        });
    }

    if input.reservation_option == ReservationOption::FixedSlot {
        return Err(ReserveBikeError::OptionNotSupported {
            option: input.reservation_option,
        });
    }

    let user = user::get_by_id(&mut tx, &input.user_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;

    let reservation_id = Uuid::new_v4().to_string();
    let mut prepaid = 0_i64;
    let mut subscription_id = None;

    match input.reservation_option {
        ReservationOption::Subscription => {
            let sub_id = input
                .subscription_id
                .ok_or(ReserveBikeError::SubscriptionRequired)?;
            let sub = subscription::get_by_id(&mut tx, &sub_id).await?.ok_or_else(|| {
                ReserveBikeError::SubscriptionNotFound {
                    subscription_id: sub_id.clone(),
                }
            })?;
            match sub.is_usable(&input.user_id, now) {
                Usability::Usable => {}
                Usability::NotUsable(status) => {
                    return Err(ReserveBikeError::SubscriptionNotUsable { status });
                }
                Usability::UsageExceeded {
                    usage_count,
                    max_usages,
                } => {
                    return Err(ReserveBikeError::SubscriptionUsageExceeded {
                        usage_count,
                        max_usages,
                    });
                }
            }
            // Guarded; a concurrent hold burning the last usage loses here.
            if !subscription::increment_usage(&mut tx, &sub_id, now).await? {
                return Err(ReserveBikeError::SubscriptionUsageExceeded {
                    usage_count: sub.usage_count,
                    max_usages: sub.max_usages,
                });
            }
            subscription_id = Some(sub_id);
        }
        ReservationOption::OneTime => {
            let entry = LedgerEntry::debit(&input.user_id, config.prepaid_amount)
                .with_description(format!("Reservation hold {reservation_id}"))
                .with_hash(format!("reservation:{reservation_id}"));
            match wallet::debit(&mut tx, &entry, now).await {
                Ok(_) => prepaid = config.prepaid_amount,
                Err(WalletError::NotFound { user_id }) => {
                    return Err(ReserveBikeError::WalletNotFound { user_id });
                }
                Err(WalletError::InsufficientBalance {
                    balance,
                    attempted_debit,
                }) => {
                    return Err(ReserveBikeError::InsufficientWalletBalance {
                        balance,
                        attempted_debit,
                    });
                }
                Err(WalletError::Frozen { .. }) => {
                    return Err(ReserveBikeError::WalletFrozen);
                }
                Err(WalletError::Database(err)) => return Err(err.into()),
            }
        }
        ReservationOption::FixedSlot => unreachable!("rejected above"),
    }

    sqlx::query(
        "INSERT INTO reservations \
         (id, user_id, bike_id, station_id, reservation_option, subscription_id, status, \
          start_time, end_time, prepaid, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', ?7, ?8, ?9, ?10, ?10)",
    )
    .bind(&reservation_id)
    .bind(&input.user_id)
    .bind(&input.bike_id)
    .bind(&input.station_id)
    .bind(input.reservation_option)
    .bind(&subscription_id)
    .bind(input.start_time)
    .bind(end_time)
    .bind(prepaid)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    rental::create_reserved(
        &mut tx,
        &reservation_id,
        &input.user_id,
        &input.bike_id,
        &input.station_id,
        now,
    )
    .await?;

    if !bike::reserve_if_available(&mut tx, &input.bike_id, now).await? {
        // Re-read for the real status; the whole transaction rolls back.
        let status = bike::get_by_id(&mut tx, &input.bike_id)
            .await?
            .map(|b| b.status)
            .ok_or_else(|| ReserveBikeError::BikeNotFound {
                bike_id: input.bike_id.clone(),
            })?;
        return Err(ReserveBikeError::BikeNotAvailable {
            bike_id: input.bike_id,
            status,
        });
    }

    let confirm_email = EmailPayload {
        version: PAYLOAD_VERSION,
        to: user.email,
        subject: "Your bike is reserved".to_string(),
        html: format!(
            "<p>Bike {} is held for you at station {} until {}.</p>",
            input.bike_id,
            input.station_id,
            end_time.to_rfc3339()
        ),
    };
    outbox::enqueue(
        &mut tx,
        &NewOutboxJob::new(JobType::EmailSend, &confirm_email)?
            .with_dedupe_key(format!("reservation:confirm:{reservation_id}"))
            .run_at(now),
        now,
    )
    .await?;

    let reminder = ReservationJobPayload {
        version: PAYLOAD_VERSION,
        reservation_id: reservation_id.clone(),
    };
    let remind_at = (end_time - config.notify_before).max(now);
    outbox::enqueue(
        &mut tx,
        &NewOutboxJob::new(JobType::ReservationNotifyNearExpiry, &reminder)?
            .with_dedupe_key(format!("reservation:notify:{reservation_id}"))
            .run_at(remind_at),
        now,
    )
    .await?;

    let created = reservation::find_by_id(&mut tx, &reservation_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    tx.commit().await?;

    info!(reservation_id, end_time = %end_time, "Hold taken");
    Ok(created)
}
