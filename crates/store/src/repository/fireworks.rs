//! Firework document persistence. Launches travel inside the document.

use sqlx::PgConnection;

use crate::{models::FireworkRow, StoreError};

/// Insert a firework, or overwrite the stored document if it already exists.
pub async fn upsert_firework(conn: &mut PgConnection, row: &FireworkRow) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO fireworks (fw_id, wf_id, name, state, document, updated_on)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (fw_id) DO UPDATE
        SET wf_id = EXCLUDED.wf_id,
            name = EXCLUDED.name,
            state = EXCLUDED.state,
            document = EXCLUDED.document,
            updated_on = EXCLUDED.updated_on
        "#,
    )
    .bind(row.fw_id)
    .bind(row.wf_id)
    .bind(&row.name)
    .bind(&row.state)
    .bind(&row.document)
    .bind(row.updated_on)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Return all fireworks ordered by id (which is insertion order).
pub async fn list_fireworks(conn: &mut PgConnection) -> Result<Vec<FireworkRow>, StoreError> {
    let rows = sqlx::query_as::<_, FireworkRow>(
        r#"
        SELECT fw_id, wf_id, name, state, document, updated_on
        FROM fireworks
        ORDER BY fw_id ASC
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

