//! Read-only station collaborator. Stations are administered elsewhere; the
//! engine only resolves them for membership checks and notification copy.

use sqlx::SqliteConnection;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Station {
    pub id: String,
    pub name: String,
}

pub(crate) async fn get_by_id(
    conn: &mut SqliteConnection,
    station_id: &str,
) -> Result<Option<Station>, sqlx::Error> {
    sqlx::query_as::<_, Station>("SELECT id, name FROM stations WHERE id = ?1")
        .bind(station_id)
        .fetch_optional(conn)
        .await
}
