//! Pool-level usage status: response headers and the usage endpoint payload
//!
//! Headers summarize both windows across the pool and ride on every proxy
//! response; they are rebuilt at most every `HEADER_CACHE_TTL`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::accounts::AccountsRepository;
use crate::db::models::{Account, AccountStatus, UsageSnapshot};
use crate::error::Result;
use crate::usage::plan::{
    default_window_minutes, pooled_plan_type, summarize_window, UsageWindow, WindowRow,
    WindowSummary,
};
use crate::usage::repository::{UsageAggregateRow, UsageRepository};

const HEADER_CACHE_TTL: Duration = Duration::from_secs(10);

pub struct StatusService {
    usage: UsageRepository,
    accounts: AccountsRepository,
    header_cache: Mutex<Option<(Instant, HashMap<String, String>)>>,
}

impl StatusService {
    pub fn new(usage: UsageRepository, accounts: AccountsRepository) -> Self {
        Self {
            usage,
            accounts,
            header_cache: Mutex::new(None),
        }
    }

    /// `x-codex-*` usage and credit headers, cached briefly.
    pub async fn rate_limit_headers(&self) -> Result<HashMap<String, String>> {
        let mut cache = self.header_cache.lock().await;
        if let Some((built_at, headers)) = cache.as_ref() {
            if built_at.elapsed() < HEADER_CACHE_TTL {
                return Ok(headers.clone());
            }
        }
        let headers = self.build_rate_limit_headers().await?;
        *cache = Some((Instant::now(), headers.clone()));
        Ok(headers)
    }

    async fn build_rate_limit_headers(&self) -> Result<HashMap<String, String>> {
        let accounts = self.accounts.list().await?;
        let plans = plan_map(&accounts);
        let mut headers = HashMap::new();

        for window in [UsageWindow::Primary, UsageWindow::Secondary] {
            let minutes = self
                .usage
                .latest_window_minutes(window)
                .await?
                .unwrap_or_else(|| default_window_minutes(window));
            if minutes <= 0 {
                continue;
            }
            let since = Utc::now() - ChronoDuration::minutes(minutes);
            let rows = self.usage.aggregate_since(since, Some(window)).await?;
            if rows.is_empty() {
                continue;
            }
            let summary = summarize_window(&window_rows(&rows), &plans, window);
            apply_window_headers(&mut headers, window, &summary);
        }

        let latest = self.usage.latest_by_account(UsageWindow::Primary).await?;
        if let Some((has, unlimited, balance)) = aggregate_credits(latest.values()) {
            headers.insert(
                "x-codex-credits-has-credits".to_string(),
                if has { "true" } else { "false" }.to_string(),
            );
            headers.insert(
                "x-codex-credits-unlimited".to_string(),
                if unlimited { "true" } else { "false" }.to_string(),
            );
            headers.insert("x-codex-credits-balance".to_string(), format!("{balance:.2}"));
        }
        Ok(headers)
    }

    /// Payload for `GET /api/codex/usage`.
    pub async fn usage_status_payload(&self) -> Result<Value> {
        let accounts = self.accounts.list().await?;
        let visible: Vec<&Account> = accounts
            .iter()
            .filter(|account| {
                !matches!(
                    account.status,
                    AccountStatus::Deactivated | AccountStatus::Paused
                )
            })
            .collect();
        if visible.is_empty() {
            return Ok(json!({ "plan_type": "guest" }));
        }
        let plans = plan_map(&accounts);
        let visible_ids: Vec<&str> = visible.iter().map(|account| account.id.as_str()).collect();
        let now_epoch = Utc::now().timestamp();

        let (latest_primary, latest_secondary) =
            self.usage.latest_primary_secondary_by_account().await?;
        let primary = window_snapshot_json(
            &latest_rows(&latest_primary, &visible_ids),
            &plans,
            UsageWindow::Primary,
            now_epoch,
        );
        let secondary = window_snapshot_json(
            &latest_rows(&latest_secondary, &visible_ids),
            &plans,
            UsageWindow::Secondary,
            now_epoch,
        );

        let mut payload = json!({
            "plan_type": pooled_plan_type(visible.iter().map(|account| Some(account.plan_type.as_str()))),
        });
        if primary.is_some() || secondary.is_some() {
            let used_percents: Vec<i64> = [&primary, &secondary]
                .into_iter()
                .flatten()
                .filter_map(|window| window.get("used_percent").and_then(Value::as_i64))
                .collect();
            let limit_reached = used_percents.iter().any(|used| *used >= 100);
            payload["rate_limit"] = json!({
                "allowed": !limit_reached,
                "limit_reached": limit_reached,
                "primary_window": primary,
                "secondary_window": secondary,
            });
        }
        let latest_entries: Vec<&UsageSnapshot> = latest_primary
            .values()
            .filter(|entry| visible_ids.contains(&entry.account_id.as_str()))
            .collect();
        if let Some((has, unlimited, balance)) = aggregate_credits(latest_entries.into_iter()) {
            payload["credits"] = json!({
                "has_credits": has,
                "unlimited": unlimited,
                "balance": format!("{:.2}", balance),
            });
        }
        Ok(payload)
    }
}

fn plan_map(accounts: &[Account]) -> HashMap<String, String> {
    accounts
        .iter()
        .map(|account| (account.id.clone(), account.plan_type.clone()))
        .collect()
}

fn window_rows(rows: &[UsageAggregateRow]) -> Vec<WindowRow> {
    rows.iter()
        .map(|row| WindowRow {
            account_id: row.account_id.clone(),
            used_percent: row.used_percent_avg,
            reset_at: row.reset_at_max,
            window_minutes: row.window_minutes_max,
        })
        .collect()
}

fn latest_rows(
    latest: &HashMap<String, UsageSnapshot>,
    visible_ids: &[&str],
) -> Vec<WindowRow> {
    latest
        .values()
        .filter(|entry| visible_ids.contains(&entry.account_id.as_str()))
        .map(|entry| WindowRow {
            account_id: entry.account_id.clone(),
            used_percent: Some(entry.used_percent),
            reset_at: entry.reset_at,
            window_minutes: entry.window_minutes,
        })
        .collect()
}

fn apply_window_headers(
    headers: &mut HashMap<String, String>,
    window: UsageWindow,
    summary: &WindowSummary,
) {
    let Some(used_percent) = summary.used_percent else {
        return;
    };
    let label = window.as_str();
    headers.insert(format!("x-codex-{label}-used-percent"), format!("{used_percent}"));
    headers.insert(
        format!("x-codex-{label}-window-minutes"),
        summary.window_minutes.to_string(),
    );
    if let Some(reset_at) = summary.reset_at {
        headers.insert(format!("x-codex-{label}-reset-at"), reset_at.to_string());
    }
}

fn window_snapshot_json(
    rows: &[WindowRow],
    plans: &HashMap<String, String>,
    window: UsageWindow,
    now_epoch: i64,
) -> Option<Value> {
    if rows.is_empty() {
        return None;
    }
    let summary = summarize_window(rows, plans, window);
    let used_percent = summary.used_percent.or_else(|| {
        let values: Vec<f64> = rows.iter().filter_map(|row| row.used_percent).collect();
        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
    })?;
    let reset_at = summary.reset_at?;
    let window_minutes = summary.window_minutes;
    Some(json!({
        "used_percent": used_percent.clamp(0.0, 100.0) as i64,
        "limit_window_seconds": window_minutes * 60,
        "reset_after_seconds": (reset_at - now_epoch).max(0),
        "reset_at": reset_at,
    }))
}

/// Pooled credit state: any account with credits sets `has`, any unlimited
/// account sets `unlimited`, balances sum over limited accounts.
fn aggregate_credits<'a>(
    entries: impl Iterator<Item = &'a UsageSnapshot>,
) -> Option<(bool, bool, f64)> {
    let mut has_data = false;
    let mut has_credits = false;
    let mut unlimited = false;
    let mut balance_total = 0.0;

    for entry in entries {
        if entry.credits_has.is_none()
            && entry.credits_unlimited.is_none()
            && entry.credits_balance.is_none()
        {
            continue;
        }
        has_data = true;
        if entry.credits_has == Some(true) {
            has_credits = true;
        }
        if entry.credits_unlimited == Some(true) {
            unlimited = true;
        }
        if let Some(balance) = entry.credits_balance {
            if entry.credits_unlimited != Some(true) {
                balance_total += balance;
            }
        }
    }

    if !has_data {
        return None;
    }
    if unlimited {
        has_credits = true;
    }
    Some((has_credits, unlimited, balance_total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::repository::test_account;
    use crate::db::memory_database;
    use crate::usage::repository::NewUsageSnapshot;

    #[tokio::test]
    async fn test_rate_limit_headers_summarize_pool() {
        let db = memory_database().await.unwrap();
        let accounts = AccountsRepository::new(&db);
        let usage = UsageRepository::new(db.main().clone());
        accounts.upsert(&test_account("acc_a", "a@example.com", "plus")).await.unwrap();

        let reset = Utc::now().timestamp() + 3600;
        usage
            .add_entry(NewUsageSnapshot {
                account_id: "acc_a".into(),
                used_percent: 40.0,
                window: Some("primary".into()),
                reset_at: Some(reset),
                window_minutes: Some(300),
                credits_has: Some(true),
                credits_unlimited: Some(false),
                credits_balance: Some(3.5),
                ..Default::default()
            })
            .await
            .unwrap();

        let status = StatusService::new(usage, accounts);
        let headers = status.rate_limit_headers().await.unwrap();
        assert_eq!(headers.get("x-codex-primary-used-percent").unwrap(), "40");
        assert_eq!(headers.get("x-codex-primary-window-minutes").unwrap(), "300");
        assert_eq!(headers.get("x-codex-primary-reset-at").unwrap(), &reset.to_string());
        assert_eq!(headers.get("x-codex-credits-has-credits").unwrap(), "true");
        assert_eq!(headers.get("x-codex-credits-balance").unwrap(), "3.50");
    }

    #[tokio::test]
    async fn test_usage_status_payload_empty_pool() {
        let db = memory_database().await.unwrap();
        let status = StatusService::new(
            UsageRepository::new(db.main().clone()),
            AccountsRepository::new(&db),
        );
        let payload = status.usage_status_payload().await.unwrap();
        assert_eq!(payload, json!({ "plan_type": "guest" }));
    }

    #[tokio::test]
    async fn test_usage_status_payload_limit_reached() {
        let db = memory_database().await.unwrap();
        let accounts = AccountsRepository::new(&db);
        let usage = UsageRepository::new(db.main().clone());
        accounts.upsert(&test_account("acc_a", "a@example.com", "plus")).await.unwrap();

        let reset = Utc::now().timestamp() + 600;
        usage
            .add_entry(NewUsageSnapshot {
                account_id: "acc_a".into(),
                used_percent: 100.0,
                window: Some("primary".into()),
                reset_at: Some(reset),
                window_minutes: Some(300),
                ..Default::default()
            })
            .await
            .unwrap();

        let status = StatusService::new(usage, accounts);
        let payload = status.usage_status_payload().await.unwrap();
        assert_eq!(payload["plan_type"], "plus");
        assert_eq!(payload["rate_limit"]["limit_reached"], json!(true));
        assert_eq!(payload["rate_limit"]["allowed"], json!(false));
        assert_eq!(payload["rate_limit"]["primary_window"]["used_percent"], json!(100));
    }
}
