//! Wallet top-ups through hosted checkout. A session row is written before
//! the provider call; the credit only lands when the signed
//! `checkout.session.completed` webhook arrives, keyed by the checkout
//! session so redeliveries cannot double-credit.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::stripe::{
    self, CheckoutSessionRequest, PaymentProcessor, ProcessorError, SignatureError,
};
use crate::wallet::{self, withdrawal, LedgerEntry, TransactionType, WalletError};

const SUPPORTED_CURRENCIES: &[&str] = &["vnd", "usd"];

/// Guards against minor-unit values that would not survive a round-trip
/// through the provider's JSON numbers.
const MAX_TOPUP_AMOUNT: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopupStatus {
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TopupSession {
    pub id: String,
    pub user_id: String,
    pub wallet_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: TopupStatus,
    /// Provider checkout-session id, echoed back on the webhook.
    pub provider_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TopupError {
    #[error("invalid top-up request: {reason}")]
    InvalidRequest { reason: String },
    #[error("wallet not found for user {user_id}")]
    WalletNotFound { user_id: String },
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("unparseable webhook payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Withdrawal(#[from] withdrawal::WithdrawalError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct CreateTopupInput {
    pub user_id: String,
    pub amount: i64,
    pub currency: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone)]
pub struct TopupCheckout {
    pub session: TopupSession,
    pub checkout_url: String,
}

const TOPUP_COLUMNS: &str =
    "id, user_id, wallet_id, amount, currency, status, provider_ref, created_at, updated_at";

async fn find_by_provider_ref(
    conn: &mut SqliteConnection,
    provider_ref: &str,
) -> Result<Option<TopupSession>, sqlx::Error> {
    sqlx::query_as::<_, TopupSession>(&format!(
        "SELECT {TOPUP_COLUMNS} FROM topup_sessions WHERE provider_ref = ?1"
    ))
    .bind(provider_ref)
    .fetch_optional(conn)
    .await
}

/// Opens a hosted checkout for a wallet top-up. The session row is committed
/// before the provider call so a webhook can never reference an unknown
/// session.
#[tracing::instrument(skip(pool, processor, input), fields(user_id = %input.user_id, amount = input.amount))]
pub async fn create_topup_session(
    pool: &SqlitePool,
    processor: &dyn PaymentProcessor,
    min_amount: i64,
    input: CreateTopupInput,
    now: DateTime<Utc>,
) -> Result<TopupCheckout, TopupError> {
    if input.amount < min_amount || input.amount > MAX_TOPUP_AMOUNT {
        return Err(TopupError::InvalidRequest {
            reason: format!("amount must be between {min_amount} and {MAX_TOPUP_AMOUNT}"),
        });
    }
    let currency = input.currency.unwrap_or_else(|| "vnd".to_string()).to_lowercase();
    if !SUPPORTED_CURRENCIES.contains(&currency.as_str()) {
        return Err(TopupError::InvalidRequest {
            reason: format!("unsupported currency {currency}"),
        });
    }

    let mut conn = pool.acquire().await?;
    let wallet = wallet::get_by_user(&mut conn, &input.user_id)
        .await?
        .ok_or_else(|| TopupError::WalletNotFound {
            user_id: input.user_id.clone(),
        })?;

    let session_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO topup_sessions \
         (id, user_id, wallet_id, amount, currency, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6, ?6)",
    )
    .bind(&session_id)
    .bind(&input.user_id)
    .bind(&wallet.id)
    .bind(input.amount)
    .bind(&currency)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let checkout = processor
        .create_checkout_session(&CheckoutSessionRequest {
            amount: input.amount,
            currency: currency.clone(),
            success_url: input.success_url,
            cancel_url: input.cancel_url,
            client_reference_id: session_id.clone(),
        })
        .await?;

    sqlx::query("UPDATE topup_sessions SET provider_ref = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(&checkout.session_id)
        .bind(now)
        .bind(&session_id)
        .execute(&mut *conn)
        .await?;

    let session = sqlx::query_as::<_, TopupSession>(&format!(
        "SELECT {TOPUP_COLUMNS} FROM topup_sessions WHERE id = ?1"
    ))
    .bind(&session_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(TopupCheckout {
        session,
        checkout_url: checkout.url,
    })
}

/// What a verified webhook delivery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Top-up credited. Redeliveries for an already settled session come
    /// back as [`WebhookOutcome::Ignored`].
    TopupCompleted { session_id: String },
    /// Checkout completed with an amount differing from the session row.
    /// The session is marked FAILED and nothing is credited.
    AmountMismatch { session_id: String },
    /// Payout lifecycle event applied to a withdrawal.
    PayoutUpdated { withdrawal_id: String },
    /// Event type we do not consume, or a reference we do not know.
    Ignored,
}

#[derive(Deserialize)]
struct WebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookEventData,
}

#[derive(Deserialize)]
struct WebhookEventData {
    object: serde_json::Value,
}

#[derive(Deserialize)]
struct CompletedCheckout {
    id: String,
    amount_total: i64,
}

#[derive(Deserialize)]
struct PayoutObject {
    id: String,
}

/// Entry point for provider webhooks. The signature is verified before the
/// payload is even parsed; everything after that point is idempotent.
#[tracing::instrument(skip_all)]
pub async fn handle_webhook(
    pool: &SqlitePool,
    webhook_secret: &str,
    payload: &[u8],
    signature_header: &str,
    now: DateTime<Utc>,
) -> Result<WebhookOutcome, WebhookError> {
    stripe::verify_webhook_signature(webhook_secret, payload, signature_header, now)?;

    let event: WebhookEvent = serde_json::from_slice(payload)?;
    match event.event_type.as_str() {
        "checkout.session.completed" => {
            let checkout: CompletedCheckout = serde_json::from_value(event.data.object)?;
            apply_completed_checkout(pool, &event.id, &checkout, now).await
        }
        "payout.paid" | "payout.failed" => {
            let payout: PayoutObject = serde_json::from_value(event.data.object)?;
            let succeeded = event.event_type == "payout.paid";
            match withdrawal::apply_payout_update(pool, &payout.id, succeeded, now).await? {
                Some(request) => Ok(WebhookOutcome::PayoutUpdated {
                    withdrawal_id: request.id,
                }),
                None => Ok(WebhookOutcome::Ignored),
            }
        }
        other => {
            info!(event_type = other, "Ignoring webhook event type");
            Ok(WebhookOutcome::Ignored)
        }
    }
}

async fn apply_completed_checkout(
    pool: &SqlitePool,
    event_id: &str,
    checkout: &CompletedCheckout,
    now: DateTime<Utc>,
) -> Result<WebhookOutcome, WebhookError> {
    let mut tx = pool.begin().await?;

    let Some(session) = find_by_provider_ref(&mut tx, &checkout.id).await? else {
        warn!(provider_ref = %checkout.id, "Checkout completed for unknown session");
        return Ok(WebhookOutcome::Ignored);
    };

    if checkout.amount_total != session.amount {
        warn!(
            session_id = %session.id,
            expected = session.amount,
            received = checkout.amount_total,
            "Checkout amount mismatch, marking session failed"
        );
        sqlx::query(
            "UPDATE topup_sessions SET status = 'FAILED', updated_at = ?1 \
             WHERE id = ?2 AND status = 'PENDING'",
        )
        .bind(now)
        .bind(&session.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        return Ok(WebhookOutcome::AmountMismatch {
            session_id: session.id,
        });
    }

    // Guarded flip: a redelivery finds the session already settled, even
    // when the provider assigns it a fresh event id.
    let flipped = sqlx::query(
        "UPDATE topup_sessions SET status = 'PAID', updated_at = ?1 \
         WHERE id = ?2 AND status = 'PENDING'",
    )
    .bind(now)
    .bind(&session.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if flipped == 0 {
        info!(session_id = %session.id, event_id, "Checkout already settled, ignoring");
        return Ok(WebhookOutcome::Ignored);
    }

    // The hash is keyed on the checkout session, not the event, for the same
    // reason.
    let entry = LedgerEntry::credit(&session.user_id, session.amount)
        .with_type(TransactionType::Deposit)
        .with_description(format!("Wallet top-up {}", session.id))
        .with_hash(format!("stripe:checkout:{}", checkout.id));
    wallet::credit(&mut tx, &entry, now).await?;

    tx.commit().await?;
    info!(session_id = %session.id, event_id, amount = session.amount, "Top-up credited");
    Ok(WebhookOutcome::TopupCompleted {
        session_id: session.id,
    })
}
