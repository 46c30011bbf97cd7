//! Request log persistence

use sqlx::SqlitePool;

use crate::error::Result;
use crate::request_logs::buffer::RequestLogCreate;

#[derive(Clone)]
pub struct RequestLogsRepository {
    pool: SqlitePool,
}

impl RequestLogsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Bulk-insert one drained batch inside a transaction.
    pub async fn insert_batch(&self, batch: &[RequestLogCreate]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry in batch {
            sqlx::query(
                r#"
                INSERT INTO request_logs (
                    account_id, request_id, requested_at, model,
                    input_tokens, output_tokens, cached_input_tokens, reasoning_tokens,
                    reasoning_effort, latency_ms, status, error_code, error_message,
                    prompt_cache_key_hash
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.account_id)
            .bind(&entry.request_id)
            .bind(entry.requested_at)
            .bind(&entry.model)
            .bind(entry.input_tokens)
            .bind(entry.output_tokens)
            .bind(entry.cached_input_tokens)
            .bind(entry.reasoning_tokens)
            .bind(&entry.reasoning_effort)
            .bind(entry.latency_ms)
            .bind(&entry.status)
            .bind(&entry.error_code)
            .bind(&entry.error_message)
            .bind(&entry.prompt_cache_key_hash)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_database;
    use crate::request_logs::buffer::test_entry;

    #[tokio::test]
    async fn test_insert_batch() {
        let db = memory_database().await.unwrap();
        let repo = RequestLogsRepository::new(db.main().clone());

        repo.insert_batch(&[test_entry("acc_a", "r1"), test_entry("acc_b", "r2")])
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_logs")
            .fetch_one(db.main())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
