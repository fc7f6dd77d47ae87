//! Minimal user reader. Accounts are managed by the auth service; the engine
//! only needs notification recipients and payout-account linkage.

use sqlx::SqliteConnection;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub stripe_account_id: Option<String>,
    pub stripe_payouts_enabled: bool,
}

pub(crate) async fn get_by_id(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, email, full_name, stripe_account_id, stripe_payouts_enabled \
         FROM users WHERE id = ?1",
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await
}
