//! Execution queue queries.

use sqlx::PgConnection;

use crate::engine::ExecutionMessage;
use crate::error::AppResult;

/// Append a batch of messages to the execution queue.
pub async fn enqueue(conn: &mut PgConnection, messages: &[ExecutionMessage]) -> AppResult<()> {
    if messages.is_empty() {
        return Ok(());
    }

    let msg_ids: Vec<&str> = messages.iter().map(|m| m.msg_id.as_str()).collect();
    let payloads: Vec<Vec<u8>> = messages.iter().map(|m| m.payload.clone()).collect();

    sqlx::query(
        r#"
        INSERT INTO orch.execution_queue (msg_id, payload)
        SELECT * FROM UNNEST($1::TEXT[], $2::BYTEA[])
        "#,
    )
    .bind(&msg_ids)
    .bind(&payloads)
    .execute(conn)
    .await?;

    Ok(())
}
