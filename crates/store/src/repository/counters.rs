//! Id counter persistence.

use sqlx::PgConnection;

use crate::{models::Counters, StoreError};

const NEXT_FW_ID: &str = "next_fw_id";
const NEXT_LAUNCH_ID: &str = "next_launch_id";
const NEXT_WF_ID: &str = "next_wf_id";

/// Read the counters; missing rows fall back to the defaults.
pub async fn load_counters(conn: &mut PgConnection) -> Result<Counters, StoreError> {
    let rows: Vec<(String, i64)> = sqlx::query_as("SELECT name, value FROM counters")
        .fetch_all(&mut *conn)
        .await?;

    let mut counters = Counters::default();
    for (name, value) in rows {
        match name.as_str() {
            NEXT_FW_ID => counters.next_fw_id = value,
            NEXT_LAUNCH_ID => counters.next_launch_id = value,
            NEXT_WF_ID => counters.next_wf_id = value,
            _ => {}
        }
    }
    Ok(counters)
}

pub async fn save_counters(conn: &mut PgConnection, counters: &Counters) -> Result<(), StoreError> {
    for (name, value) in [
        (NEXT_FW_ID, counters.next_fw_id),
        (NEXT_LAUNCH_ID, counters.next_launch_id),
        (NEXT_WF_ID, counters.next_wf_id),
    ] {
        sqlx::query(
            r#"
            INSERT INTO counters (name, value)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}
