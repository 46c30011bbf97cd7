//! Single-row dashboard settings store
//!
//! The row is created lazily with defaults. Pinned account ids persist as a
//! JSON array, trimmed and deduplicated preserving order.

use sqlx::SqlitePool;

use crate::db::models::DashboardSettings;
use crate::error::{Error, Result};

const SETTINGS_ID: i64 = 1;

#[derive(Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub sticky_threads_enabled: Option<bool>,
    pub prefer_earlier_reset_accounts: Option<bool>,
    pub pinned_account_ids: Option<Vec<String>>,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_or_create(&self) -> Result<DashboardSettings> {
        let row: Option<(bool, bool, String)> = sqlx::query_as(
            "SELECT sticky_threads_enabled, prefer_earlier_reset_accounts, pinned_account_ids_json \
             FROM dashboard_settings WHERE id = ?",
        )
        .bind(SETTINGS_ID)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((sticky, prefer, pinned_json)) => Ok(DashboardSettings {
                sticky_threads_enabled: sticky,
                prefer_earlier_reset_accounts: prefer,
                pinned_account_ids: decode_pinned(&pinned_json)?,
            }),
            None => {
                sqlx::query(
                    "INSERT INTO dashboard_settings (id, sticky_threads_enabled, prefer_earlier_reset_accounts, pinned_account_ids_json) \
                     VALUES (?, 1, 0, '[]') ON CONFLICT (id) DO NOTHING",
                )
                .bind(SETTINGS_ID)
                .execute(&self.pool)
                .await?;
                Ok(DashboardSettings::default())
            }
        }
    }

    pub async fn update(&self, update: SettingsUpdate) -> Result<DashboardSettings> {
        let mut settings = self.get_or_create().await?;
        if let Some(sticky) = update.sticky_threads_enabled {
            settings.sticky_threads_enabled = sticky;
        }
        if let Some(prefer) = update.prefer_earlier_reset_accounts {
            settings.prefer_earlier_reset_accounts = prefer;
        }
        if let Some(pinned) = update.pinned_account_ids {
            settings.pinned_account_ids = normalize_account_ids(pinned);
        }

        sqlx::query(
            "UPDATE dashboard_settings SET sticky_threads_enabled = ?, prefer_earlier_reset_accounts = ?, pinned_account_ids_json = ? \
             WHERE id = ?",
        )
        .bind(settings.sticky_threads_enabled)
        .bind(settings.prefer_earlier_reset_accounts)
        .bind(serde_json::to_string(&settings.pinned_account_ids)?)
        .bind(SETTINGS_ID)
        .execute(&self.pool)
        .await?;
        Ok(settings)
    }

    /// Drop account ids from the pinned set (called on account delete).
    pub async fn remove_pinned_account_ids(&self, account_ids: &[String]) -> Result<DashboardSettings> {
        let settings = self.get_or_create().await?;
        let updated: Vec<String> = settings
            .pinned_account_ids
            .iter()
            .filter(|id| !account_ids.contains(id))
            .cloned()
            .collect();
        if updated == settings.pinned_account_ids {
            return Ok(settings);
        }
        self.update(SettingsUpdate {
            pinned_account_ids: Some(updated),
            ..Default::default()
        })
        .await
    }
}

fn normalize_account_ids(ids: Vec<String>) -> Vec<String> {
    let mut normalized = Vec::new();
    for raw in ids {
        let id = raw.trim().to_string();
        if !id.is_empty() && !normalized.contains(&id) {
            normalized.push(id);
        }
    }
    normalized
}

fn decode_pinned(raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Vec<String> = serde_json::from_str(raw).map_err(|_| {
        Error::Database("dashboard_settings.pinned_account_ids_json must be a JSON array of strings".into())
    })?;
    Ok(normalize_account_ids(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_database;

    #[tokio::test]
    async fn test_defaults_and_update() {
        let db = memory_database().await.unwrap();
        let repo = SettingsRepository::new(db.main().clone());

        let settings = repo.get_or_create().await.unwrap();
        assert!(settings.sticky_threads_enabled);
        assert!(!settings.prefer_earlier_reset_accounts);
        assert!(settings.pinned_account_ids.is_empty());

        let updated = repo
            .update(SettingsUpdate {
                prefer_earlier_reset_accounts: Some(true),
                pinned_account_ids: Some(vec![
                    " acc_a ".into(),
                    "acc_b".into(),
                    "acc_a".into(),
                    String::new(),
                ]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(updated.prefer_earlier_reset_accounts);
        assert_eq!(updated.pinned_account_ids, vec!["acc_a", "acc_b"]);

        // Round-trips through the store
        let reloaded = repo.get_or_create().await.unwrap();
        assert_eq!(reloaded, updated);
    }

    #[tokio::test]
    async fn test_remove_pinned() {
        let db = memory_database().await.unwrap();
        let repo = SettingsRepository::new(db.main().clone());
        repo.update(SettingsUpdate {
            pinned_account_ids: Some(vec!["acc_a".into(), "acc_b".into()]),
            ..Default::default()
        })
        .await
        .unwrap();

        let settings = repo.remove_pinned_account_ids(&["acc_a".to_string()]).await.unwrap();
        assert_eq!(settings.pinned_account_ids, vec!["acc_b"]);
    }
}
