//! Accounts repository
//!
//! Accounts live in their own store (optionally a separate database file);
//! deleting an account also cascades its usage rows, request logs, and sticky
//! sessions out of the main store.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::{Account, AccountStatus};
use crate::db::Database;
use crate::error::Result;

/// Token/identity fields written after a refresh or import.
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: String,
    pub id_token_encrypted: String,
    pub last_refresh: DateTime<Utc>,
    pub plan_type: Option<String>,
    pub email: Option<String>,
    pub chatgpt_account_id: Option<String>,
}

#[derive(Clone)]
pub struct AccountsRepository {
    accounts: SqlitePool,
    main: SqlitePool,
}

impl AccountsRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            accounts: db.accounts().clone(),
            main: db.main().clone(),
        }
    }

    /// All accounts, ordered by email for deterministic listings.
    pub async fn list(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, Account>("SELECT * FROM accounts ORDER BY email")
            .fetch_all(&self.accounts)
            .await?;
        Ok(rows)
    }

    pub async fn get(&self, account_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&self.accounts)
            .await?;
        Ok(row)
    }

    /// Insert or update by id; an id miss with a matching email merges into
    /// the existing row instead of violating the unique email constraint.
    pub async fn upsert(&self, account: &Account) -> Result<Account> {
        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM accounts WHERE id = ? OR email = ? LIMIT 1")
                .bind(&account.id)
                .bind(&account.email)
                .fetch_optional(&self.accounts)
                .await?;

        match existing_id {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE accounts SET
                        chatgpt_account_id = ?,
                        email = ?,
                        plan_type = ?,
                        access_token_encrypted = ?,
                        refresh_token_encrypted = ?,
                        id_token_encrypted = ?,
                        last_refresh = ?,
                        status = ?,
                        status_reset_at = ?,
                        deactivation_reason = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&account.chatgpt_account_id)
                .bind(&account.email)
                .bind(&account.plan_type)
                .bind(&account.access_token_encrypted)
                .bind(&account.refresh_token_encrypted)
                .bind(&account.id_token_encrypted)
                .bind(account.last_refresh)
                .bind(account.status)
                .bind(account.status_reset_at)
                .bind(&account.deactivation_reason)
                .bind(&id)
                .execute(&self.accounts)
                .await?;
                self.get(&id)
                    .await?
                    .ok_or_else(|| crate::error::Error::Database("upsert lost the row".into()))
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO accounts (
                        id, chatgpt_account_id, email, plan_type,
                        access_token_encrypted, refresh_token_encrypted, id_token_encrypted,
                        last_refresh, created_at, status, status_reset_at, deactivation_reason
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&account.id)
                .bind(&account.chatgpt_account_id)
                .bind(&account.email)
                .bind(&account.plan_type)
                .bind(&account.access_token_encrypted)
                .bind(&account.refresh_token_encrypted)
                .bind(&account.id_token_encrypted)
                .bind(account.last_refresh)
                .bind(account.created_at)
                .bind(account.status)
                .bind(account.status_reset_at)
                .bind(&account.deactivation_reason)
                .execute(&self.accounts)
                .await?;
                Ok(account.clone())
            }
        }
    }

    /// Atomic status transition. Reactivating clears the deactivation reason.
    pub async fn update_status(
        &self,
        account_id: &str,
        status: AccountStatus,
        status_reset_at: Option<i64>,
        deactivation_reason: Option<&str>,
    ) -> Result<bool> {
        let reason = match status {
            AccountStatus::Deactivated => deactivation_reason,
            _ => None,
        };
        let result = sqlx::query(
            "UPDATE accounts SET status = ?, status_reset_at = ?, deactivation_reason = ? WHERE id = ?",
        )
        .bind(status)
        .bind(status_reset_at)
        .bind(reason)
        .bind(account_id)
        .execute(&self.accounts)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_tokens(&self, account_id: &str, update: TokenUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                access_token_encrypted = ?,
                refresh_token_encrypted = ?,
                id_token_encrypted = ?,
                last_refresh = ?,
                plan_type = COALESCE(?, plan_type),
                email = COALESCE(?, email),
                chatgpt_account_id = COALESCE(?, chatgpt_account_id)
            WHERE id = ?
            "#,
        )
        .bind(&update.access_token_encrypted)
        .bind(&update.refresh_token_encrypted)
        .bind(&update.id_token_encrypted)
        .bind(update.last_refresh)
        .bind(&update.plan_type)
        .bind(&update.email)
        .bind(&update.chatgpt_account_id)
        .bind(account_id)
        .execute(&self.accounts)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete an account and cascade its rows in the main store.
    pub async fn delete(&self, account_id: &str) -> Result<bool> {
        sqlx::query("DELETE FROM usage_history WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.main)
            .await?;
        sqlx::query("DELETE FROM request_logs WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.main)
            .await?;
        sqlx::query("DELETE FROM sticky_sessions WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.main)
            .await?;
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(account_id)
            .execute(&self.accounts)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
pub(crate) fn test_account(id: &str, email: &str, plan: &str) -> Account {
    let now = Utc::now();
    Account {
        id: id.to_string(),
        chatgpt_account_id: Some(id.to_string()),
        email: email.to_string(),
        plan_type: plan.to_string(),
        access_token_encrypted: "access".into(),
        refresh_token_encrypted: "refresh".into(),
        id_token_encrypted: "id".into(),
        last_refresh: now,
        created_at: now,
        status: AccountStatus::Active,
        status_reset_at: None,
        deactivation_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_database;

    #[tokio::test]
    async fn test_upsert_merges_on_email_collision() {
        let db = memory_database().await.unwrap();
        let repo = AccountsRepository::new(&db);

        repo.upsert(&test_account("acc_a", "a@example.com", "plus")).await.unwrap();

        // Same email under a fresh id merges into the existing row.
        let mut replacement = test_account("acc_new", "a@example.com", "pro");
        replacement.access_token_encrypted = "fresh".into();
        let merged = repo.upsert(&replacement).await.unwrap();
        assert_eq!(merged.id, "acc_a");
        assert_eq!(merged.plan_type, "pro");
        assert_eq!(merged.access_token_encrypted, "fresh");
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_clears_reason_on_reactivate() {
        let db = memory_database().await.unwrap();
        let repo = AccountsRepository::new(&db);
        repo.upsert(&test_account("acc_a", "a@example.com", "plus")).await.unwrap();

        repo.update_status("acc_a", AccountStatus::Deactivated, None, Some("refresh_revoked"))
            .await
            .unwrap();
        let account = repo.get("acc_a").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Deactivated);
        assert_eq!(account.deactivation_reason.as_deref(), Some("refresh_revoked"));

        repo.update_status("acc_a", AccountStatus::Active, None, None).await.unwrap();
        let account = repo.get("acc_a").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Active);
        assert_eq!(account.deactivation_reason, None);
    }

    #[tokio::test]
    async fn test_delete_cascades_main_store_rows() {
        let db = memory_database().await.unwrap();
        let repo = AccountsRepository::new(&db);
        repo.upsert(&test_account("acc_a", "a@example.com", "plus")).await.unwrap();

        sqlx::query("INSERT INTO sticky_sessions (key, account_id, updated_at) VALUES ('k', 'acc_a', ?)")
            .bind(Utc::now())
            .execute(db.main())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO usage_history (account_id, recorded_at, used_percent) VALUES ('acc_a', ?, 1.0)",
        )
        .bind(Utc::now())
        .execute(db.main())
        .await
        .unwrap();

        assert!(repo.delete("acc_a").await.unwrap());
        let sticky: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sticky_sessions")
            .fetch_one(db.main())
            .await
            .unwrap();
        let usage: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_history")
            .fetch_one(db.main())
            .await
            .unwrap();
        assert_eq!((sticky, usage), (0, 0));
        assert!(repo.get("acc_a").await.unwrap().is_none());
    }
}
