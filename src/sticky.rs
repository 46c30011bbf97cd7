//! Sticky session store
//!
//! Maps a session fingerprint (SHA-256 of the caller's `prompt_cache_key`)
//! to an account id so a thread keeps hitting the same account. Two
//! backends behind one trait, chosen per process by config: a per-process
//! LRU (fast, lost on restart) and a persistent UPSERT-backed table
//! (durable, multi-process). The selector treats them identically.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use moka::sync::Cache;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::error::Result;

/// Keyed fingerprint for a caller-supplied cache key; raw keys never leave
/// the process (or reach logs) in clear.
pub fn sticky_key_fingerprint(prompt_cache_key: &str) -> String {
    let digest = Sha256::digest(prompt_cache_key.as_bytes());
    format!("{digest:x}")
}

#[async_trait]
pub trait StickyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn upsert(&self, key: &str, account_id: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Active mapping counts per account, for the selection snapshot.
    async fn count_by_account(&self) -> Result<HashMap<String, i64>>;
    /// Drop every mapping targeting an account (account delete cascade).
    async fn delete_for_account(&self, account_id: &str) -> Result<u64>;
}

/// Size- and time-bounded LRU; per-process, resets on restart.
pub struct MemoryStickyStore {
    cache: Cache<String, String>,
}

impl MemoryStickyStore {
    pub fn new(maxsize: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(maxsize)
                .time_to_live(ttl)
                .build(),
        }
    }
}

#[async_trait]
impl StickyStore for MemoryStickyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self.cache.get(key))
    }

    async fn upsert(&self, key: &str, account_id: &str) -> Result<()> {
        self.cache.insert(key.to_string(), account_id.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.cache.get(key).is_some();
        self.cache.invalidate(key);
        Ok(existed)
    }

    async fn count_by_account(&self) -> Result<HashMap<String, i64>> {
        let mut counts = HashMap::new();
        for (_, account_id) in self.cache.iter() {
            *counts.entry(account_id.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete_for_account(&self, account_id: &str) -> Result<u64> {
        let keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, target)| target == account_id)
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        let removed = keys.len() as u64;
        for key in keys {
            self.cache.invalidate(&key);
        }
        Ok(removed)
    }
}

/// Durable backend in the main store; works across processes.
pub struct DbStickyStore {
    pool: SqlitePool,
}

impl DbStickyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StickyStore for DbStickyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if key.is_empty() {
            return Ok(None);
        }
        let account_id: Option<String> =
            sqlx::query_scalar("SELECT account_id FROM sticky_sessions WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(account_id)
    }

    async fn upsert(&self, key: &str, account_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sticky_sessions (key, account_id, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                account_id = excluded.account_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(account_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query("DELETE FROM sticky_sessions WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_by_account(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT account_id, COUNT(*) FROM sticky_sessions GROUP BY account_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn delete_for_account(&self, account_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sticky_sessions WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_database;

    #[test]
    fn test_fingerprint_is_stable_and_opaque() {
        let a = sticky_key_fingerprint("thread_123");
        let b = sticky_key_fingerprint("thread_123");
        let c = sticky_key_fingerprint("thread_124");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(!a.contains("thread"));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStickyStore::new(16, Duration::from_secs(60));
        assert_eq!(store.get("k1").await.unwrap(), None);

        store.upsert("k1", "acc_a").await.unwrap();
        store.upsert("k2", "acc_a").await.unwrap();
        store.upsert("k3", "acc_b").await.unwrap();
        assert_eq!(store.get("k1").await.unwrap().as_deref(), Some("acc_a"));

        let counts = store.count_by_account().await.unwrap();
        assert_eq!(counts.get("acc_a"), Some(&2));
        assert_eq!(counts.get("acc_b"), Some(&1));

        assert_eq!(store.delete_for_account("acc_a").await.unwrap(), 2);
        assert_eq!(store.get("k1").await.unwrap(), None);
        assert_eq!(store.get("k3").await.unwrap().as_deref(), Some("acc_b"));
    }

    #[tokio::test]
    async fn test_db_store_upsert_overwrites() {
        let db = memory_database().await.unwrap();
        let store = DbStickyStore::new(db.main().clone());

        store.upsert("k1", "acc_a").await.unwrap();
        store.upsert("k1", "acc_b").await.unwrap();
        assert_eq!(store.get("k1").await.unwrap().as_deref(), Some("acc_b"));

        let counts = store.count_by_account().await.unwrap();
        assert_eq!(counts.get("acc_b"), Some(&1));
        assert!(!counts.contains_key("acc_a"));

        assert!(store.delete("k1").await.unwrap());
        assert!(!store.delete("k1").await.unwrap());
    }
}
