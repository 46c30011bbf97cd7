//! Selection snapshot: a short-lived immutable view the selector scores from
//!
//! One value cell, refreshed after the TTL or explicitly invalidated by
//! marking events and settings writes. The rebuild is mutex-guarded so a
//! thundering herd collapses into one set of repository reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::models::{Account, DashboardSettings, UsageSnapshot};
use crate::error::Result;

/// Immutable point-in-time view of everything selection needs.
#[derive(Debug, Clone)]
pub struct SelectionSnapshot {
    pub updated_at: DateTime<Utc>,
    pub accounts: Vec<Account>,
    pub latest_primary: HashMap<String, UsageSnapshot>,
    pub latest_secondary: HashMap<String, UsageSnapshot>,
    pub sticky_counts: HashMap<String, i64>,
    pub settings: DashboardSettings,
}

impl SelectionSnapshot {
    pub fn account(&self, account_id: &str) -> Option<&Account> {
        self.accounts.iter().find(|account| account.id == account_id)
    }
}

struct CachedSnapshot {
    built_at: Instant,
    value: Arc<SelectionSnapshot>,
}

pub struct SnapshotCell {
    ttl: Duration,
    dirty: AtomicBool,
    slot: Mutex<Option<CachedSnapshot>>,
}

impl SnapshotCell {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            dirty: AtomicBool::new(false),
            slot: Mutex::new(None),
        }
    }

    /// Mark the cached snapshot stale; the next read rebuilds.
    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Return the cached snapshot, rebuilding via `build` when missing,
    /// expired, or invalidated.
    pub async fn get_or_build<F, Fut>(&self, build: F) -> Result<Arc<SelectionSnapshot>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<SelectionSnapshot>>,
    {
        let mut slot = self.slot.lock().await;
        let dirty = self.dirty.swap(false, Ordering::AcqRel);
        if !dirty {
            if let Some(cached) = slot.as_ref() {
                if cached.built_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&cached.value));
                }
            }
        }
        let value = Arc::new(build().await?);
        *slot = Some(CachedSnapshot {
            built_at: Instant::now(),
            value: Arc::clone(&value),
        });
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(marker: i64) -> SelectionSnapshot {
        SelectionSnapshot {
            updated_at: DateTime::from_timestamp(marker, 0).unwrap(),
            accounts: Vec::new(),
            latest_primary: HashMap::new(),
            latest_secondary: HashMap::new(),
            sticky_counts: HashMap::new(),
            settings: DashboardSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_cell_caches_within_ttl() {
        let cell = SnapshotCell::new(Duration::from_secs(60));
        let first = cell.get_or_build(|| async { Ok(snapshot(1)) }).await.unwrap();
        let second = cell.get_or_build(|| async { Ok(snapshot(2)) }).await.unwrap();
        assert_eq!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn test_cell_rebuilds_after_invalidate() {
        let cell = SnapshotCell::new(Duration::from_secs(60));
        let first = cell.get_or_build(|| async { Ok(snapshot(1)) }).await.unwrap();
        cell.invalidate();
        let second = cell.get_or_build(|| async { Ok(snapshot(2)) }).await.unwrap();
        assert_ne!(first.updated_at, second.updated_at);
    }

    #[tokio::test]
    async fn test_cell_rebuilds_after_ttl() {
        let cell = SnapshotCell::new(Duration::from_millis(5));
        let first = cell.get_or_build(|| async { Ok(snapshot(1)) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = cell.get_or_build(|| async { Ok(snapshot(2)) }).await.unwrap();
        assert_ne!(first.updated_at, second.updated_at);
    }
}
