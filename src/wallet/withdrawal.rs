//! Withdrawal flow: debit the wallet and record the request in one
//! transaction, then call the payout provider after commit so a slow or
//! failing external call can never hold a database lock open. Reconciliation
//! happens through payout webhooks and the stalled-request sweep.

use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::stripe::{PaymentProcessor, PayoutRequest};
use crate::user;
use crate::wallet::{self, LedgerEntry, TransactionType, WalletError};

const SUPPORTED_CURRENCIES: &[&str] = &["vnd", "usd"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    /// Debited, payout not yet accepted by the provider. Retryable.
    Pending,
    /// Payout accepted by the provider, awaiting webhook confirmation.
    Processing,
    Paid,
    Failed,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WithdrawalRequest {
    pub id: String,
    pub user_id: String,
    pub wallet_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: WithdrawalStatus,
    pub idempotency_key: String,
    pub payout_ref: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum WithdrawalError {
    #[error("invalid withdrawal request: {reason}")]
    InvalidRequest { reason: String },
    #[error("user {user_id} not found")]
    UserNotFound { user_id: String },
    #[error("user {user_id} has no linked payout account")]
    StripeConnectNotLinked { user_id: String },
    #[error("payouts are not enabled for user {user_id}")]
    StripePayoutsNotEnabled { user_id: String },
    #[error("wallet not found for user {user_id}")]
    WalletNotFound { user_id: String },
    #[error("wallet is frozen")]
    WalletFrozen,
    #[error("insufficient wallet balance: have {balance}, attempted debit {attempted_debit}")]
    InsufficientBalance { balance: i64, attempted_debit: i64 },
    /// The debit committed but the payout call failed; the request stays
    /// PENDING for the sweep and webhook reconciliation.
    #[error("withdrawal {withdrawal_id} accepted but payout dispatch failed")]
    Internal { withdrawal_id: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<WalletError> for WithdrawalError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::NotFound { user_id } => Self::WalletNotFound { user_id },
            WalletError::Frozen { .. } => Self::WalletFrozen,
            WalletError::InsufficientBalance {
                balance,
                attempted_debit,
            } => Self::InsufficientBalance {
                balance,
                attempted_debit,
            },
            WalletError::Database(err) => Self::Database(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestWithdrawalInput {
    pub user_id: String,
    pub amount: i64,
    pub currency: Option<String>,
    pub idempotency_key: Option<String>,
}

const WITHDRAWAL_COLUMNS: &str = "id, user_id, wallet_id, amount, currency, status, \
     idempotency_key, payout_ref, last_error, created_at, updated_at";

pub(crate) async fn find_by_id(
    conn: &mut SqliteConnection,
    withdrawal_id: &str,
) -> Result<Option<WithdrawalRequest>, sqlx::Error> {
    sqlx::query_as::<_, WithdrawalRequest>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests WHERE id = ?1"
    ))
    .bind(withdrawal_id)
    .fetch_optional(conn)
    .await
}

async fn find_by_idempotency_key(
    conn: &mut SqliteConnection,
    user_id: &str,
    idempotency_key: &str,
) -> Result<Option<WithdrawalRequest>, sqlx::Error> {
    sqlx::query_as::<_, WithdrawalRequest>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests \
         WHERE user_id = ?1 AND idempotency_key = ?2"
    ))
    .bind(user_id)
    .bind(idempotency_key)
    .fetch_optional(conn)
    .await
}

/// Creates (or returns the previously-created) withdrawal for this
/// idempotency key, debiting the wallet in the same transaction, then hands
/// the payout to the provider.
#[tracing::instrument(skip(pool, processor, input), fields(user_id = %input.user_id, amount = input.amount))]
pub async fn request_withdrawal(
    pool: &SqlitePool,
    processor: &dyn PaymentProcessor,
    min_amount: i64,
    input: RequestWithdrawalInput,
    now: DateTime<Utc>,
) -> Result<WithdrawalRequest, WithdrawalError> {
    if input.amount <= 0 || input.amount < min_amount {
        return Err(WithdrawalError::InvalidRequest {
            reason: format!("amount must be at least {min_amount}"),
        });
    }
    let currency = input.currency.unwrap_or_else(|| "vnd".to_string()).to_lowercase();
    if !SUPPORTED_CURRENCIES.contains(&currency.as_str()) {
        return Err(WithdrawalError::InvalidRequest {
            reason: format!("unsupported currency {currency}"),
        });
    }

    let mut conn = pool.acquire().await?;
    let user = user::get_by_id(&mut conn, &input.user_id)
        .await?
        .ok_or_else(|| WithdrawalError::UserNotFound {
            user_id: input.user_id.clone(),
        })?;

    let account_id = user
        .stripe_account_id
        .clone()
        .ok_or_else(|| WithdrawalError::StripeConnectNotLinked {
            user_id: user.id.clone(),
        })?;
    if !user.stripe_payouts_enabled {
        return Err(WithdrawalError::StripePayoutsNotEnabled { user_id: user.id });
    }

    let idempotency_key = input
        .idempotency_key
        .unwrap_or_else(|| format!("withdraw:{}", Uuid::new_v4()));

    // A repeated key returns the prior request: no second debit, no second
    // payout.
    if let Some(existing) =
        find_by_idempotency_key(&mut conn, &user.id, &idempotency_key).await?
    {
        info!(withdrawal_id = %existing.id, "Duplicate withdrawal request, returning prior result");
        return Ok(existing);
    }
    drop(conn);

    let withdrawal_id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;

    let entry = LedgerEntry::debit(&user.id, input.amount)
        .with_type(TransactionType::Withdrawal)
        .with_description(format!("Withdrawal {withdrawal_id}"))
        .with_hash(format!("withdrawal:{withdrawal_id}"));
    let wallet = wallet::debit(&mut tx, &entry, now).await?;

    let inserted = sqlx::query(
        "INSERT INTO withdrawal_requests \
         (id, user_id, wallet_id, amount, currency, status, idempotency_key, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6, ?7, ?7) \
         ON CONFLICT (user_id, idempotency_key) DO NOTHING",
    )
    .bind(&withdrawal_id)
    .bind(&user.id)
    .bind(&wallet.id)
    .bind(input.amount)
    .bind(&currency)
    .bind(&idempotency_key)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    if inserted.rows_affected() == 0 {
        // Lost the race to a concurrent request with the same key; the debit
        // rolls back with the transaction.
        tx.rollback().await?;
        let mut conn = pool.acquire().await?;
        let existing = find_by_idempotency_key(&mut conn, &user.id, &idempotency_key)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        return Ok(existing);
    }

    tx.commit().await?;

    execute_payout(pool, processor, &withdrawal_id, &account_id, input.amount, &currency, now)
        .await?;

    let mut conn = pool.acquire().await?;
    find_by_id(&mut conn, &withdrawal_id)
        .await?
        .ok_or_else(|| WithdrawalError::Database(sqlx::Error::RowNotFound))
}

/// Hands a committed PENDING request to the payout provider. The withdrawal
/// id doubles as the provider idempotency key, so re-driving a request that
/// actually went through cannot pay out twice.
async fn execute_payout(
    pool: &SqlitePool,
    processor: &dyn PaymentProcessor,
    withdrawal_id: &str,
    account_id: &str,
    amount: i64,
    currency: &str,
    now: DateTime<Utc>,
) -> Result<(), WithdrawalError> {
    let payout = processor
        .create_payout(&PayoutRequest {
            account_id: account_id.to_string(),
            amount,
            currency: currency.to_string(),
            idempotency_key: withdrawal_id.to_string(),
        })
        .await;

    match payout {
        Ok(payout) => {
            sqlx::query(
                "UPDATE withdrawal_requests \
                 SET status = 'PROCESSING', payout_ref = ?1, last_error = NULL, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'PENDING'",
            )
            .bind(&payout.payout_id)
            .bind(now)
            .bind(withdrawal_id)
            .execute(pool)
            .await?;
            Ok(())
        }
        Err(err) => {
            error!(%withdrawal_id, %err, "Payout dispatch failed, leaving request PENDING");
            sqlx::query(
                "UPDATE withdrawal_requests SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
            )
            .bind(err.to_string())
            .bind(now)
            .bind(withdrawal_id)
            .execute(pool)
            .await?;
            Err(WithdrawalError::Internal {
                withdrawal_id: withdrawal_id.to_string(),
            })
        }
    }
}

/// Re-drives PENDING requests whose payout call never got through. Runs on
/// the sweep schedule.
pub async fn sweep_stalled_withdrawals(
    pool: &SqlitePool,
    processor: &dyn PaymentProcessor,
    older_than: Duration,
    now: DateTime<Utc>,
) -> Result<u64, WithdrawalError> {
    let cutoff = now - older_than;
    let stalled = sqlx::query_as::<_, WithdrawalRequest>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests \
         WHERE status = 'PENDING' AND updated_at <= ?1 ORDER BY created_at"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut redriven = 0;
    for request in stalled {
        let mut conn = pool.acquire().await?;
        let Some(user) = user::get_by_id(&mut conn, &request.user_id).await? else {
            warn!(withdrawal_id = %request.id, "Stalled withdrawal references missing user");
            continue;
        };
        drop(conn);
        let Some(account_id) = user.stripe_account_id else {
            warn!(withdrawal_id = %request.id, "Stalled withdrawal user lost payout account");
            continue;
        };

        match execute_payout(
            pool,
            processor,
            &request.id,
            &account_id,
            request.amount,
            &request.currency,
            now,
        )
        .await
        {
            Ok(()) => redriven += 1,
            Err(WithdrawalError::Internal { .. }) => {}
            Err(err) => return Err(err),
        }
    }

    if redriven > 0 {
        info!(redriven, "Re-drove stalled withdrawals");
    }
    Ok(redriven)
}

/// Applies a payout lifecycle webhook. A failed payout refunds the debit
/// idempotently; redelivered events are no-ops.
pub(crate) async fn apply_payout_update(
    pool: &SqlitePool,
    payout_ref: &str,
    succeeded: bool,
    now: DateTime<Utc>,
) -> Result<Option<WithdrawalRequest>, WithdrawalError> {
    let mut tx = pool.begin().await?;

    let found = sqlx::query_as::<_, WithdrawalRequest>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests WHERE payout_ref = ?1"
    ))
    .bind(payout_ref)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(request) = found else {
        warn!(%payout_ref, "Payout webhook for unknown withdrawal");
        return Ok(None);
    };

    let target = if succeeded { "PAID" } else { "FAILED" };
    let updated = sqlx::query(
        "UPDATE withdrawal_requests SET status = ?1, updated_at = ?2 \
         WHERE id = ?3 AND status IN ('PENDING', 'PROCESSING')",
    )
    .bind(target)
    .bind(now)
    .bind(&request.id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() > 0 && !succeeded {
        let refund = LedgerEntry::credit(&request.user_id, request.amount)
            .with_type(TransactionType::Refund)
            .with_description(format!("Refund failed withdrawal {}", request.id))
            .with_hash(format!("payout-failed:{}", request.id));
        wallet::credit(&mut tx, &refund, now).await?;
    }

    tx.commit().await?;

    let mut conn = pool.acquire().await?;
    Ok(find_by_id(&mut conn, &request.id).await?)
}
