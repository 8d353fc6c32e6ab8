//! Workflow document persistence.

use sqlx::PgConnection;

use crate::{models::WorkflowRow, StoreError};

/// Insert a workflow, or overwrite the stored document if it already exists.
///
/// `created_on` is never rewritten after the first insert.
pub async fn upsert_workflow(conn: &mut PgConnection, row: &WorkflowRow) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflows (wf_id, name, state, document, created_on, updated_on)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (wf_id) DO UPDATE
        SET name = EXCLUDED.name,
            state = EXCLUDED.state,
            document = EXCLUDED.document,
            updated_on = EXCLUDED.updated_on
        "#,
    )
    .bind(row.wf_id)
    .bind(&row.name)
    .bind(&row.state)
    .bind(&row.document)
    .bind(row.created_on)
    .bind(row.updated_on)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Return all workflows ordered by id.
pub async fn list_workflows(conn: &mut PgConnection) -> Result<Vec<WorkflowRow>, StoreError> {
    let rows = sqlx::query_as::<_, WorkflowRow>(
        r#"
        SELECT wf_id, name, state, document, created_on, updated_on
        FROM workflows
        ORDER BY wf_id ASC
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}
