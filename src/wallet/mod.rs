//! Wallet ledger: per-user balance plus an append-only transaction history.
//! Every balance change is paired with a `wallet_transactions` row in the same
//! atomic step, and a client-supplied `hash` makes retries no-ops.

pub mod topup;
pub mod withdrawal;

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletStatus {
    Active,
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Refund,
    Debit,
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::Refund => "REFUND",
            Self::Debit => "DEBIT",
            Self::Withdrawal => "WITHDRAWAL",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Wallet {
    pub id: String,
    pub user_id: String,
    /// Minor currency units. Never negative (enforced by the guarded debit
    /// update and a CHECK constraint).
    pub balance: i64,
    pub status: WalletStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WalletTransaction {
    pub id: String,
    pub wallet_id: String,
    pub tx_type: TransactionType,
    pub amount: i64,
    pub fee: i64,
    pub description: Option<String>,
    pub hash: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("wallet not found for user {user_id}")]
    NotFound { user_id: String },
    #[error("wallet {wallet_id} is frozen")]
    Frozen { wallet_id: String },
    #[error("insufficient wallet balance: have {balance}, attempted debit {attempted_debit}")]
    InsufficientBalance { balance: i64, attempted_debit: i64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One ledger movement. `hash` is the caller's idempotency token, unique per
/// wallet; replaying a hash returns the wallet untouched.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub user_id: String,
    pub amount: i64,
    pub fee: i64,
    pub tx_type: TransactionType,
    pub description: Option<String>,
    pub hash: Option<String>,
}

impl LedgerEntry {
    pub fn credit(user_id: impl Into<String>, amount: i64) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            fee: 0,
            tx_type: TransactionType::Deposit,
            description: None,
            hash: None,
        }
    }

    pub fn debit(user_id: impl Into<String>, amount: i64) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            fee: 0,
            tx_type: TransactionType::Debit,
            description: None,
            hash: None,
        }
    }

    pub fn with_type(mut self, tx_type: TransactionType) -> Self {
        self.tx_type = tx_type;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

const WALLET_COLUMNS: &str = "id, user_id, balance, status, updated_at";

pub(crate) async fn get_by_user(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Option<Wallet>, sqlx::Error> {
    sqlx::query_as::<_, Wallet>(&format!(
        "SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = ?1"
    ))
    .bind(user_id)
    .fetch_optional(conn)
    .await
}

async fn require_by_user(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Wallet, WalletError> {
    get_by_user(conn, user_id)
        .await?
        .ok_or_else(|| WalletError::NotFound {
            user_id: user_id.to_string(),
        })
}

pub async fn get_by_user_id(pool: &SqlitePool, user_id: &str) -> Result<Wallet, WalletError> {
    let mut conn = pool.acquire().await?;
    require_by_user(&mut conn, user_id).await
}

async fn find_applied_hash(
    conn: &mut SqliteConnection,
    wallet_id: &str,
    hash: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT id FROM wallet_transactions WHERE wallet_id = ?1 AND hash = ?2",
    )
    .bind(wallet_id)
    .bind(hash)
    .fetch_optional(conn)
    .await
}

async fn append_transaction(
    conn: &mut SqliteConnection,
    wallet_id: &str,
    entry: &LedgerEntry,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO wallet_transactions \
         (id, wallet_id, tx_type, amount, fee, description, hash, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'SUCCESS', ?8)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(wallet_id)
    .bind(entry.tx_type)
    .bind(entry.amount)
    .bind(entry.fee)
    .bind(&entry.description)
    .bind(&entry.hash)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Applies a credit inside the caller's transaction. Net amount is
/// `amount - fee`. Replayed hashes return the current wallet unchanged.
pub(crate) async fn credit(
    conn: &mut SqliteConnection,
    entry: &LedgerEntry,
    now: DateTime<Utc>,
) -> Result<Wallet, WalletError> {
    let wallet = require_by_user(conn, &entry.user_id).await?;

    if let Some(hash) = &entry.hash {
        if find_applied_hash(conn, &wallet.id, hash).await?.is_some() {
            debug!(wallet_id = %wallet.id, hash, "Credit already applied, skipping");
            return Ok(wallet);
        }
    }

    let net = entry.amount - entry.fee;
    sqlx::query("UPDATE wallets SET balance = balance + ?1, updated_at = ?2 WHERE id = ?3")
        .bind(net)
        .bind(now)
        .bind(&wallet.id)
        .execute(&mut *conn)
        .await?;

    append_transaction(conn, &wallet.id, entry, now).await?;
    require_by_user(conn, &entry.user_id).await
}

/// Applies a debit inside the caller's transaction. The balance check and the
/// decrement are one guarded statement, so two debits can never both observe
/// a stale balance.
pub(crate) async fn debit(
    conn: &mut SqliteConnection,
    entry: &LedgerEntry,
    now: DateTime<Utc>,
) -> Result<Wallet, WalletError> {
    let wallet = require_by_user(conn, &entry.user_id).await?;

    if let Some(hash) = &entry.hash {
        if find_applied_hash(conn, &wallet.id, hash).await?.is_some() {
            debug!(wallet_id = %wallet.id, hash, "Debit already applied, skipping");
            return Ok(wallet);
        }
    }

    let result = sqlx::query(
        "UPDATE wallets SET balance = balance - ?1, updated_at = ?2 \
         WHERE id = ?3 AND status = 'ACTIVE' AND balance >= ?1",
    )
    .bind(entry.amount)
    .bind(now)
    .bind(&wallet.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        if wallet.status == WalletStatus::Frozen {
            return Err(WalletError::Frozen {
                wallet_id: wallet.id,
            });
        }
        return Err(WalletError::InsufficientBalance {
            balance: wallet.balance,
            attempted_debit: entry.amount,
        });
    }

    append_transaction(conn, &wallet.id, entry, now).await?;
    require_by_user(conn, &entry.user_id).await
}

/// Pool-level credit: opens its own transaction.
#[tracing::instrument(skip(pool, entry), fields(user_id = %entry.user_id, amount = entry.amount))]
pub async fn credit_wallet(pool: &SqlitePool, entry: &LedgerEntry) -> Result<Wallet, WalletError> {
    let mut tx = pool.begin().await?;
    let wallet = credit(&mut tx, entry, Utc::now()).await?;
    tx.commit().await?;
    Ok(wallet)
}

/// Pool-level debit: opens its own transaction.
#[tracing::instrument(skip(pool, entry), fields(user_id = %entry.user_id, amount = entry.amount))]
pub async fn debit_wallet(pool: &SqlitePool, entry: &LedgerEntry) -> Result<Wallet, WalletError> {
    let mut tx = pool.begin().await?;
    let wallet = debit(&mut tx, entry, Utc::now()).await?;
    tx.commit().await?;
    Ok(wallet)
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// Newest-first transaction history for a user's wallet. `page` is 1-based.
pub async fn list_transactions_for_user(
    pool: &SqlitePool,
    user_id: &str,
    page: u32,
    page_size: u32,
) -> Result<Page<WalletTransaction>, WalletError> {
    let page = page.max(1);
    let page_size = page_size.clamp(1, 100);

    let mut conn = pool.acquire().await?;
    let wallet = require_by_user(&mut conn, user_id).await?;

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM wallet_transactions WHERE wallet_id = ?1",
    )
    .bind(&wallet.id)
    .fetch_one(&mut *conn)
    .await?;

    let items = sqlx::query_as::<_, WalletTransaction>(
        "SELECT id, wallet_id, tx_type, amount, fee, description, hash, status, created_at \
         FROM wallet_transactions WHERE wallet_id = ?1 \
         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
    )
    .bind(&wallet.id)
    .bind(i64::from(page_size))
    .bind(i64::from(page - 1) * i64::from(page_size))
    .fetch_all(&mut *conn)
    .await?;

    Ok(Page {
        items,
        total,
        page,
        page_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{seed_user, seed_wallet, setup_test_db};

    #[tokio::test]
    async fn credit_and_debit_update_balance_and_ledger() {
        let pool = setup_test_db().await;
        seed_user(&pool, "user-1").await;
        seed_wallet(&pool, "user-1", 10_000).await;

        let wallet = credit_wallet(&pool, &LedgerEntry::credit("user-1", 5_000))
            .await
            .unwrap();
        assert_eq!(wallet.balance, 15_000);

        let wallet = debit_wallet(&pool, &LedgerEntry::debit("user-1", 4_000))
            .await
            .unwrap();
        assert_eq!(wallet.balance, 11_000);

        let page = list_transactions_for_user(&pool, "user-1", 1, 10)
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        // Ledger deltas must reconcile with the balance.
        let delta: i64 = page
            .items
            .iter()
            .map(|tx| match tx.tx_type {
                TransactionType::Deposit | TransactionType::Refund => tx.amount - tx.fee,
                TransactionType::Debit | TransactionType::Withdrawal => -tx.amount,
            })
            .sum();
        assert_eq!(10_000 + delta, wallet.balance);
    }

    #[tokio::test]
    async fn debit_never_overdraws() {
        let pool = setup_test_db().await;
        seed_user(&pool, "user-1").await;
        seed_wallet(&pool, "user-1", 1_000).await;

        let err = debit_wallet(&pool, &LedgerEntry::debit("user-1", 2_000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WalletError::InsufficientBalance {
                balance: 1_000,
                attempted_debit: 2_000
            }
        ));

        let wallet = get_by_user_id(&pool, "user-1").await.unwrap();
        assert_eq!(wallet.balance, 1_000);
    }

    #[tokio::test]
    async fn replayed_hash_is_a_no_op() {
        let pool = setup_test_db().await;
        seed_user(&pool, "user-1").await;
        seed_wallet(&pool, "user-1", 10_000).await;

        let entry = LedgerEntry::debit("user-1", 3_000).with_hash("debit:once");
        let first = debit_wallet(&pool, &entry).await.unwrap();
        assert_eq!(first.balance, 7_000);

        let replay = debit_wallet(&pool, &entry).await.unwrap();
        assert_eq!(replay.balance, 7_000);

        let page = list_transactions_for_user(&pool, "user-1", 1, 10)
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        let credit_entry = LedgerEntry::credit("user-1", 2_000).with_hash("credit:once");
        credit_wallet(&pool, &credit_entry).await.unwrap();
        let replay = credit_wallet(&pool, &credit_entry).await.unwrap();
        assert_eq!(replay.balance, 9_000);
    }

    #[tokio::test]
    async fn history_past_the_last_page_is_empty() {
        let pool = setup_test_db().await;
        seed_user(&pool, "user-1").await;
        seed_wallet(&pool, "user-1", 10_000).await;
        credit_wallet(&pool, &LedgerEntry::credit("user-1", 1_000))
            .await
            .unwrap();

        let page = list_transactions_for_user(&pool, "user-1", u32::MAX, 100)
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn frozen_wallet_refuses_debits() {
        let pool = setup_test_db().await;
        seed_user(&pool, "user-1").await;
        seed_wallet(&pool, "user-1", 10_000).await;
        sqlx::query("UPDATE wallets SET status = 'FROZEN' WHERE user_id = 'user-1'")
            .execute(&pool)
            .await
            .unwrap();

        let err = debit_wallet(&pool, &LedgerEntry::debit("user-1", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::Frozen { .. }));
    }

    #[tokio::test]
    async fn missing_wallet_is_a_named_outcome() {
        let pool = setup_test_db().await;
        let err = get_by_user_id(&pool, "ghost").await.unwrap_err();
        assert!(matches!(err, WalletError::NotFound { .. }));
    }
}
