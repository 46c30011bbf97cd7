//! Usage snapshot repository (append-only time series)

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::UsageSnapshot;
use crate::error::Result;
use crate::usage::plan::{UsageWindow, SECONDARY_WINDOW_THRESHOLD_MINUTES};

/// SQL fragment classifying a row's effective window: NULL reads as primary,
/// and primary rows spanning a day or more read as secondary.
const EFFECTIVE_WINDOW_SQL: &str = r#"
    CASE
        WHEN COALESCE("window", 'primary') = 'primary'
             AND window_minutes IS NOT NULL
             AND window_minutes >= 1440
        THEN 'secondary'
        ELSE COALESCE("window", 'primary')
    END
"#;

/// Effective window of a snapshot row, mirroring `EFFECTIVE_WINDOW_SQL`.
pub fn effective_window(snapshot: &UsageSnapshot) -> UsageWindow {
    let window = UsageWindow::parse(snapshot.window.as_deref());
    if window == UsageWindow::Primary
        && snapshot
            .window_minutes
            .is_some_and(|m| m >= SECONDARY_WINDOW_THRESHOLD_MINUTES)
    {
        return UsageWindow::Secondary;
    }
    window
}

/// Fields for a new snapshot row.
#[derive(Debug, Clone, Default)]
pub struct NewUsageSnapshot {
    pub account_id: String,
    pub used_percent: f64,
    pub window: Option<String>,
    pub reset_at: Option<i64>,
    pub window_minutes: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub credits_has: Option<bool>,
    pub credits_unlimited: Option<bool>,
    pub credits_balance: Option<f64>,
    /// Defaults to now
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Per-account aggregate over a time range.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageAggregateRow {
    pub account_id: String,
    pub used_percent_avg: Option<f64>,
    pub input_tokens_sum: Option<i64>,
    pub output_tokens_sum: Option<i64>,
    pub samples: i64,
    pub last_recorded_at: Option<DateTime<Utc>>,
    pub reset_at_max: Option<i64>,
    pub window_minutes_max: Option<i64>,
}

#[derive(Clone)]
pub struct UsageRepository {
    pool: SqlitePool,
}

impl UsageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one snapshot. Rows are immutable once written.
    pub async fn add_entry(&self, entry: NewUsageSnapshot) -> Result<i64> {
        let recorded_at = entry.recorded_at.unwrap_or_else(Utc::now);
        let result = sqlx::query(
            r#"
            INSERT INTO usage_history (
                account_id, recorded_at, "window", used_percent,
                input_tokens, output_tokens, reset_at, window_minutes,
                credits_has, credits_unlimited, credits_balance
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.account_id)
        .bind(recorded_at)
        .bind(&entry.window)
        .bind(entry.used_percent)
        .bind(entry.input_tokens)
        .bind(entry.output_tokens)
        .bind(entry.reset_at)
        .bind(entry.window_minutes)
        .bind(entry.credits_has)
        .bind(entry.credits_unlimited)
        .bind(entry.credits_balance)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent snapshot per account for one effective window.
    pub async fn latest_by_account(
        &self,
        window: UsageWindow,
    ) -> Result<HashMap<String, UsageSnapshot>> {
        let sql = format!(
            r#"
            WITH ranked AS (
                SELECT id,
                       ROW_NUMBER() OVER (
                           PARTITION BY account_id
                           ORDER BY recorded_at DESC, id DESC
                       ) AS rn
                FROM usage_history
                WHERE {EFFECTIVE_WINDOW_SQL} = ?
            )
            SELECT u.* FROM usage_history u
            JOIN ranked ON u.id = ranked.id
            WHERE ranked.rn = 1
            ORDER BY u.account_id
            "#
        );
        let rows: Vec<UsageSnapshot> = sqlx::query_as(&sql)
            .bind(window.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|entry| (entry.account_id.clone(), entry))
            .collect())
    }

    /// Latest primary and secondary snapshots per account in one round trip.
    pub async fn latest_primary_secondary_by_account(
        &self,
    ) -> Result<(HashMap<String, UsageSnapshot>, HashMap<String, UsageSnapshot>)> {
        let sql = format!(
            r#"
            WITH ranked AS (
                SELECT id,
                       ROW_NUMBER() OVER (
                           PARTITION BY account_id, {EFFECTIVE_WINDOW_SQL}
                           ORDER BY recorded_at DESC, id DESC
                       ) AS rn
                FROM usage_history
                WHERE "window" IN ('primary', 'secondary') OR "window" IS NULL
            )
            SELECT u.* FROM usage_history u
            JOIN ranked ON u.id = ranked.id
            WHERE ranked.rn = 1
            ORDER BY u.account_id
            "#
        );
        let rows: Vec<UsageSnapshot> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        let mut primary = HashMap::new();
        let mut secondary = HashMap::new();
        for entry in rows {
            match effective_window(&entry) {
                UsageWindow::Primary => primary.insert(entry.account_id.clone(), entry),
                UsageWindow::Secondary => secondary.insert(entry.account_id.clone(), entry),
            };
        }
        Ok((primary, secondary))
    }

    /// Longest window length seen for one effective window.
    pub async fn latest_window_minutes(&self, window: UsageWindow) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT MAX(window_minutes) FROM usage_history WHERE {EFFECTIVE_WINDOW_SQL} = ?"
        );
        let value: Option<i64> = sqlx::query_scalar(&sql)
            .bind(window.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }

    /// Per-account aggregates over rows recorded since `since`.
    pub async fn aggregate_since(
        &self,
        since: DateTime<Utc>,
        window: Option<UsageWindow>,
    ) -> Result<Vec<UsageAggregateRow>> {
        let window_filter = match window {
            Some(_) => format!("AND {EFFECTIVE_WINDOW_SQL} = ?"),
            None => String::new(),
        };
        let sql = format!(
            r#"
            SELECT account_id,
                   AVG(used_percent) AS used_percent_avg,
                   SUM(input_tokens) AS input_tokens_sum,
                   SUM(output_tokens) AS output_tokens_sum,
                   COUNT(id) AS samples,
                   MAX(recorded_at) AS last_recorded_at,
                   MAX(reset_at) AS reset_at_max,
                   MAX(window_minutes) AS window_minutes_max
            FROM usage_history
            WHERE recorded_at >= ? {window_filter}
            GROUP BY account_id
            "#
        );
        let mut query = sqlx::query_as(&sql).bind(since);
        if let Some(window) = window {
            query = query.bind(window.as_str());
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Remove all snapshots for an account (delete cascade).
    pub async fn delete_for_account(&self, account_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM usage_history WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
