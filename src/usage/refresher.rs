//! Periodic upstream usage polling
//!
//! Every tick the account list is snapshotted and polled with bounded
//! fan-out; each returned window becomes an appended usage snapshot.
//! Accounts sharing a workspace `chatgpt_account_id` are polled without the
//! account-id header so the upstream reports the caller's own view instead
//! of rejecting the ambiguous id. Failures are classified and counted,
//! never blocking the tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::accounts::AccountsRepository;
use crate::crypto::TokenEncryptor;
use crate::db::models::{Account, AccountStatus};
use crate::metrics;
use crate::upstream::client::{UsagePayload, UsageWindowPayload};
use crate::upstream::UpstreamClient;
use crate::usage::repository::{NewUsageSnapshot, UsageRepository};

pub struct UsageRefresher {
    interval: Duration,
    concurrency: usize,
    accounts: AccountsRepository,
    usage: UsageRepository,
    client: UpstreamClient,
    encryptor: Arc<TokenEncryptor>,
    cancel: CancellationToken,
}

impl UsageRefresher {
    pub fn new(
        interval: Duration,
        concurrency: usize,
        accounts: AccountsRepository,
        usage: UsageRepository,
        client: UpstreamClient,
        encryptor: Arc<TokenEncryptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            interval,
            concurrency: concurrency.max(1),
            accounts,
            usage,
            client,
            encryptor,
            cancel: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let refresher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if refresher.cancel.is_cancelled() {
                    break;
                }
                refresher.refresh_once().await;
                tokio::select! {
                    _ = refresher.cancel.cancelled() => break,
                    _ = tokio::time::sleep(refresher.interval) => {}
                }
            }
        })
    }

    /// Stop ticking; the in-flight iteration finishes before the task ends.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn refresh_once(&self) {
        let accounts = match self.accounts.list().await {
            Ok(accounts) => accounts,
            Err(error) => {
                tracing::error!(%error, "Usage refresh could not list accounts");
                metrics::record_usage_refresh_failure(None, "list_accounts");
                return;
            }
        };
        let pollable: Vec<Account> = accounts
            .into_iter()
            .filter(|account| account.status != AccountStatus::Deactivated)
            .collect();
        if pollable.is_empty() {
            return;
        }

        let shared_ids = shared_chatgpt_account_ids(&pollable);
        futures::stream::iter(pollable)
            .for_each_concurrent(self.concurrency, |account| {
                let shared_ids = &shared_ids;
                async move {
                    self.refresh_account(&account, shared_ids).await;
                }
            })
            .await;
    }

    async fn refresh_account(&self, account: &Account, shared_ids: &[String]) {
        let access_token = match self.encryptor.decrypt(&account.access_token_encrypted) {
            Ok(token) if !token.is_empty() => token,
            _ => {
                metrics::record_usage_refresh_failure(None, "decrypt");
                return;
            }
        };
        let header_account_id = account
            .chatgpt_account_id
            .as_deref()
            .filter(|id| !shared_ids.iter().any(|shared| shared == id));

        let payload = match self.client.fetch_usage(&access_token, header_account_id).await {
            Ok(payload) => payload,
            Err(error) => {
                tracing::debug!(
                    account_id = %account.id,
                    status = ?error.status_code,
                    phase = error.phase,
                    "Usage fetch failed"
                );
                metrics::record_usage_refresh_failure(error.status_code, error.phase);
                return;
            }
        };

        if let Err(error) = self.store_payload(&account.id, &payload).await {
            tracing::warn!(account_id = %account.id, %error, "Failed to persist usage snapshot");
            metrics::record_usage_refresh_failure(None, "store");
        }
    }

    async fn store_payload(
        &self,
        account_id: &str,
        payload: &UsagePayload,
    ) -> crate::error::Result<()> {
        let windows = [
            ("primary", payload.rate_limit.as_ref().and_then(|r| r.primary_window.as_ref())),
            ("secondary", payload.rate_limit.as_ref().and_then(|r| r.secondary_window.as_ref())),
        ];
        for (label, window) in windows {
            let Some(window) = window else { continue };
            self.usage
                .add_entry(snapshot_from_window(account_id, label, window, payload))
                .await?;
        }
        Ok(())
    }
}

fn snapshot_from_window(
    account_id: &str,
    label: &str,
    window: &UsageWindowPayload,
    payload: &UsagePayload,
) -> NewUsageSnapshot {
    let credits = payload.credits.as_ref();
    NewUsageSnapshot {
        account_id: account_id.to_string(),
        used_percent: window.used_percent.unwrap_or(0.0),
        window: Some(label.to_string()),
        reset_at: window.reset_at,
        window_minutes: window.limit_window_seconds.map(|seconds| seconds / 60),
        credits_has: credits.and_then(|c| c.has),
        credits_unlimited: credits.and_then(|c| c.unlimited),
        credits_balance: credits.and_then(|c| c.balance),
        ..Default::default()
    }
}

/// Workspace ids appearing on more than one account.
fn shared_chatgpt_account_ids(accounts: &[Account]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for account in accounts {
        if let Some(id) = account.chatgpt_account_id.as_deref() {
            *counts.entry(id).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(id, _)| id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::repository::test_account;

    #[test]
    fn test_shared_chatgpt_account_ids() {
        let mut a = test_account("acc_a", "a@example.com", "plus");
        let mut b = test_account("acc_b", "b@example.com", "plus");
        let mut c = test_account("acc_c", "c@example.com", "plus");
        a.chatgpt_account_id = Some("workspace_shared".into());
        b.chatgpt_account_id = Some("workspace_shared".into());
        c.chatgpt_account_id = Some("workspace_unique".into());

        let shared = shared_chatgpt_account_ids(&[a, b, c]);
        assert_eq!(shared, vec!["workspace_shared".to_string()]);
    }

    #[test]
    fn test_snapshot_from_window() {
        let payload = UsagePayload {
            rate_limit: None,
            credits: Some(crate::upstream::client::CreditsInfo {
                has: Some(true),
                unlimited: Some(false),
                balance: Some(12.5),
            }),
        };
        let window = UsageWindowPayload {
            used_percent: Some(40.0),
            reset_at: Some(1_900_000_000),
            limit_window_seconds: Some(18_000),
        };
        let snapshot = snapshot_from_window("acc_a", "primary", &window, &payload);
        assert_eq!(snapshot.window_minutes, Some(300));
        assert_eq!(snapshot.used_percent, 40.0);
        assert_eq!(snapshot.credits_balance, Some(12.5));
    }
}
