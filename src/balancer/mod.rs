//! Account selection and lifecycle marking
//!
//! Selection order: reconcile stale blocks, drop ineligible accounts, honor
//! the pinned pool, evaluate stickiness, then score the pool in tiers.
//! Marking writes status transitions back through the accounts repository
//! and invalidates the selection snapshot so the next request observes them.

pub mod scoring;
pub mod snapshot;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use crate::accounts::AccountsRepository;
use crate::config::{Config, SelectionStrategy};
use crate::db::models::{Account, AccountStatus, UsageSnapshot};
use crate::error::Result;
use crate::metrics;
use crate::openai::models::OpenAiError;
use crate::settings::SettingsRepository;
use crate::sticky::StickyStore;
use crate::usage::plan::{default_window_minutes, UsageWindow};
use crate::usage::repository::UsageRepository;

pub use scoring::{TierKey, TierScore};
pub use snapshot::{SelectionSnapshot, SnapshotCell};

/// Error codes that deactivate an account outright.
pub const PERMANENT_FAILURE_CODES: &[&str] = &[
    "refresh_token_invalid",
    "refresh_token_missing",
    "refresh_token_unreadable",
    "account_deactivated",
    "account_deleted",
    "token_revoked",
];

/// Minimum cooldown applied by a rate-limit mark without (or ahead of) an
/// upstream reset hint.
const RATE_LIMIT_COOLDOWN_FLOOR_SECONDS: i64 = 60;

/// Outcome of one selection.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub account: Option<Account>,
    pub reason: Option<&'static str>,
    pub error_message: Option<String>,
    pub selected_tier: Option<TierKey>,
    pub tier_scores: Vec<TierScore>,
}

impl Selection {
    fn empty(reason: &'static str, message: &str) -> Self {
        metrics::record_empty_pool(reason);
        Self {
            reason: Some(reason),
            error_message: Some(message.to_string()),
            ..Default::default()
        }
    }
}

pub struct LoadBalancer {
    accounts: AccountsRepository,
    usage: UsageRepository,
    sticky: Arc<dyn StickyStore>,
    settings: SettingsRepository,
    snapshot: SnapshotCell,
    strategy: SelectionStrategy,
    /// Transient error counts per account; process-local, never persisted.
    error_counts: DashMap<String, u64>,
}

impl LoadBalancer {
    pub fn new(
        accounts: AccountsRepository,
        usage: UsageRepository,
        sticky: Arc<dyn StickyStore>,
        settings: SettingsRepository,
        config: &Config,
    ) -> Self {
        Self {
            accounts,
            usage,
            sticky,
            settings,
            snapshot: SnapshotCell::new(config.proxy_snapshot_ttl),
            strategy: config.proxy_selection_strategy,
            error_counts: DashMap::new(),
        }
    }

    /// Invalidate the cached selection snapshot (marks and settings writes).
    pub fn invalidate_snapshot(&self) {
        self.snapshot.invalidate();
    }

    pub async fn current_snapshot(&self) -> Result<Arc<SelectionSnapshot>> {
        self.snapshot
            .get_or_build(|| self.build_snapshot())
            .await
    }

    async fn build_snapshot(&self) -> Result<SelectionSnapshot> {
        let accounts = self.accounts.list().await?;
        let (latest_primary, latest_secondary) =
            self.usage.latest_primary_secondary_by_account().await?;
        let sticky_counts = self.sticky.count_by_account().await?;
        let settings = self.settings.get_or_create().await?;
        Ok(SelectionSnapshot {
            updated_at: Utc::now(),
            accounts,
            latest_primary,
            latest_secondary,
            sticky_counts,
            settings,
        })
    }

    /// Select the best-scoring eligible account.
    ///
    /// `seed` salts the weighted draw; derive it from the request id so a
    /// retried request reproduces its own draws.
    pub async fn select_account(
        &self,
        sticky_key: Option<&str>,
        reallocate_sticky: bool,
        seed: u64,
    ) -> Result<Selection> {
        let mut snapshot = self.current_snapshot().await?;
        let now_epoch = Utc::now().timestamp();

        if self.reconcile(&snapshot, now_epoch).await? {
            self.snapshot.invalidate();
            snapshot = self.current_snapshot().await?;
        }

        if snapshot.accounts.is_empty() {
            return Ok(Selection::empty("no_accounts", "No active accounts available"));
        }

        // Eligibility: never deactivated/paused, not currently blocked.
        let mut eligible: Vec<&Account> = Vec::new();
        let mut all_deactivated = true;
        for account in &snapshot.accounts {
            match account.status {
                AccountStatus::Deactivated => continue,
                AccountStatus::Paused => {
                    all_deactivated = false;
                    continue;
                }
                AccountStatus::RateLimited | AccountStatus::QuotaExceeded => {
                    // Stale blocks were reconciled above; what's left is live.
                    all_deactivated = false;
                    continue;
                }
                AccountStatus::Active => {
                    all_deactivated = false;
                    eligible.push(account);
                }
            }
        }

        if eligible.is_empty() {
            if all_deactivated {
                return Ok(Selection::empty("all_deactivated", "All accounts are deactivated"));
            }
            let resets_at = next_reset_hint(&snapshot);
            let message = match resets_at {
                Some(at) => format!("All accounts are blocked until {at}"),
                None => "All accounts are blocked".to_string(),
            };
            return Ok(Selection::empty("all_blocked", &message));
        }

        // Pinned pool: configured pins that survived eligibility, pin order.
        let pinned: Vec<&Account> = snapshot
            .settings
            .pinned_account_ids
            .iter()
            .filter_map(|id| eligible.iter().find(|account| &account.id == id).copied())
            .collect();
        let pool: &[&Account] = if pinned.is_empty() { &eligible } else { &pinned };

        // Sticky evaluation.
        let sticky_enabled = snapshot.settings.sticky_threads_enabled;
        if sticky_enabled && !reallocate_sticky {
            if let Some(key) = sticky_key.filter(|key| !key.is_empty()) {
                if let Some(target_id) = self.sticky.get(key).await? {
                    let in_pinned = pinned.iter().any(|account| account.id == target_id);
                    let in_full = eligible.iter().any(|account| account.id == target_id);
                    let honored = if pinned.is_empty() { in_full } else { in_pinned };
                    if honored {
                        if let Some(account) = snapshot.account(&target_id) {
                            return Ok(Selection {
                                account: Some(account.clone()),
                                ..Default::default()
                            });
                        }
                    }
                }
            }
        }

        let (chosen, selected_tier, tier_scores) = scoring::pick_account(
            pool,
            &snapshot.latest_primary,
            &snapshot.latest_secondary,
            self.strategy,
            snapshot.settings.prefer_earlier_reset_accounts,
            now_epoch,
            seed,
        );

        let Some(account) = chosen else {
            return Ok(Selection::empty("no_accounts", "No active accounts available"));
        };

        // The mapping follows every final scored selection.
        if sticky_enabled {
            if let Some(key) = sticky_key.filter(|key| !key.is_empty()) {
                self.sticky.upsert(key, &account.id).await?;
            }
        }

        Ok(Selection {
            account: Some(account.clone()),
            selected_tier,
            tier_scores,
            ..Default::default()
        })
    }

    /// Clear stale blocks and convert exhausted usage into blocks. Idempotent;
    /// returns whether anything was persisted.
    async fn reconcile(&self, snapshot: &SelectionSnapshot, now_epoch: i64) -> Result<bool> {
        let mut changed = false;
        for account in &snapshot.accounts {
            match account.status {
                AccountStatus::RateLimited | AccountStatus::QuotaExceeded => {
                    let usage_entry = match account.status {
                        AccountStatus::RateLimited => snapshot.latest_primary.get(&account.id),
                        _ => snapshot.latest_secondary.get(&account.id),
                    };
                    let usage_reset = usage_entry.and_then(|entry| entry.reset_at);
                    let blocked_until = match (account.status_reset_at, usage_reset) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        (a, b) => a.or(b),
                    };
                    let expired = blocked_until.is_some_and(|until| until <= now_epoch);
                    // A snapshot from a newer cycle showing headroom means
                    // the window rolled over even though the old reset marker
                    // is still in the future.
                    let rolled_over = usage_entry.is_some_and(|entry| {
                        entry.used_percent < 100.0
                            && entry.reset_at.unwrap_or(0) > account.status_reset_at.unwrap_or(0)
                    });
                    if expired || rolled_over {
                        tracing::info!(
                            account_id = %account.id,
                            status = account.status.as_str(),
                            "Block no longer applies; reactivating"
                        );
                        self.accounts
                            .update_status(&account.id, AccountStatus::Active, None, None)
                            .await?;
                        changed = true;
                    }
                }
                AccountStatus::Active => {
                    // Usage at 100% blocks the account before it burns a
                    // request finding out.
                    if let Some(entry) = snapshot.latest_secondary.get(&account.id) {
                        if entry.used_percent >= 100.0 {
                            self.block_on_usage(
                                account,
                                AccountStatus::QuotaExceeded,
                                entry,
                                now_epoch,
                                UsageWindow::Secondary,
                            )
                            .await?;
                            changed = true;
                            continue;
                        }
                    }
                    if let Some(entry) = snapshot.latest_primary.get(&account.id) {
                        if entry.used_percent >= 100.0 {
                            self.block_on_usage(
                                account,
                                AccountStatus::RateLimited,
                                entry,
                                now_epoch,
                                UsageWindow::Primary,
                            )
                            .await?;
                            changed = true;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(changed)
    }

    async fn block_on_usage(
        &self,
        account: &Account,
        status: AccountStatus,
        entry: &UsageSnapshot,
        now_epoch: i64,
        window: UsageWindow,
    ) -> Result<()> {
        let reset_at = entry
            .reset_at
            .unwrap_or_else(|| now_epoch + default_window_minutes(window) * 60);
        tracing::info!(
            account_id = %account.id,
            status = status.as_str(),
            reset_at,
            "Usage window exhausted; blocking account"
        );
        let event = match status {
            AccountStatus::QuotaExceeded => "quota_exceeded",
            _ => "rate_limit",
        };
        metrics::record_mark(event);
        self.accounts
            .update_status(&account.id, status, Some(reset_at), None)
            .await?;
        Ok(())
    }

    /// RATE_LIMITED with `status_reset_at = max(now + cooldown floor, hint)`.
    pub async fn mark_rate_limit(
        &self,
        account: &Account,
        hint: Option<&OpenAiError>,
    ) -> Result<()> {
        let now_epoch = Utc::now().timestamp();
        let floor = now_epoch + RATE_LIMIT_COOLDOWN_FLOOR_SECONDS;
        let reset_at = hint_reset_at(hint, now_epoch).map_or(floor, |hinted| hinted.max(floor));
        tracing::warn!(account_id = %account.id, reset_at, "Marking account rate limited");
        metrics::record_mark("rate_limit");
        self.accounts
            .update_status(&account.id, AccountStatus::RateLimited, Some(reset_at), None)
            .await?;
        self.snapshot.invalidate();
        Ok(())
    }

    /// QUOTA_EXCEEDED with the reset from the hint or the secondary window.
    pub async fn mark_quota_exceeded(
        &self,
        account: &Account,
        hint: Option<&OpenAiError>,
    ) -> Result<()> {
        let now_epoch = Utc::now().timestamp();
        let reset_at = match hint_reset_at(hint, now_epoch) {
            Some(hinted) => hinted,
            None => {
                let latest = self.usage.latest_by_account(UsageWindow::Secondary).await?;
                latest
                    .get(&account.id)
                    .and_then(|entry| entry.reset_at)
                    .unwrap_or(now_epoch + default_window_minutes(UsageWindow::Secondary) * 60)
            }
        };
        tracing::warn!(account_id = %account.id, reset_at, "Marking account quota exceeded");
        metrics::record_mark("quota_exceeded");
        self.accounts
            .update_status(&account.id, AccountStatus::QuotaExceeded, Some(reset_at), None)
            .await?;
        self.snapshot.invalidate();
        Ok(())
    }

    /// DEACTIVATED with the failure code as the reason. Only an operator
    /// brings the account back.
    pub async fn mark_permanent_failure(&self, account: &Account, code: &str) -> Result<()> {
        tracing::error!(account_id = %account.id, code, "Marking account permanently failed");
        metrics::record_mark_permanent_failure(code);
        self.accounts
            .update_status(&account.id, AccountStatus::Deactivated, None, Some(code))
            .await?;
        self.snapshot.invalidate();
        Ok(())
    }

    /// Count a transient error; no persisted status change, no snapshot
    /// churn (the TTL refresh picks it up).
    pub fn record_error(&self, account_id: &str) {
        *self.error_counts.entry(account_id.to_string()).or_insert(0) += 1;
    }

    pub fn error_count(&self, account_id: &str) -> u64 {
        self.error_counts.get(account_id).map(|entry| *entry).unwrap_or(0)
    }
}

/// Reset epoch from an upstream error hint.
fn hint_reset_at(hint: Option<&OpenAiError>, now_epoch: i64) -> Option<i64> {
    let hint = hint?;
    if let Some(resets_at) = hint.resets_at {
        return Some(resets_at as i64);
    }
    hint.resets_in_seconds
        .map(|seconds| now_epoch + seconds as i64)
}

/// Soonest moment any currently-blocked account frees up.
fn next_reset_hint(snapshot: &SelectionSnapshot) -> Option<i64> {
    snapshot
        .accounts
        .iter()
        .filter(|account| {
            matches!(
                account.status,
                AccountStatus::RateLimited | AccountStatus::QuotaExceeded
            )
        })
        .filter_map(|account| {
            let usage_reset = match account.status {
                AccountStatus::RateLimited => snapshot.latest_primary.get(&account.id),
                _ => snapshot.latest_secondary.get(&account.id),
            }
            .and_then(|entry| entry.reset_at);
            match (account.status_reset_at, usage_reset) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            }
        })
        .min()
}
