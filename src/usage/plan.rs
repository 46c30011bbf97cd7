//! Plan capacity tables and usage window math
//!
//! Capacities are credits per cycle. Plans outside the table have unknown
//! capacity and contribute nothing to pooled summaries; the selector places
//! them in a trailing tier.

use std::collections::HashMap;

/// Short (5h) or long (7d) usage window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageWindow {
    Primary,
    Secondary,
}

impl UsageWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageWindow::Primary => "primary",
            UsageWindow::Secondary => "secondary",
        }
    }

    /// Accepts the window labels seen on the wire; `None` and unknown labels
    /// normalize to primary for historical compatibility.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.to_lowercase()) {
            Some(v) if v == "secondary" || v == "7d" => UsageWindow::Secondary,
            _ => UsageWindow::Primary,
        }
    }
}

/// Snapshots labeled primary but spanning a day or more are secondary rows
/// recorded before the window label existed.
pub const SECONDARY_WINDOW_THRESHOLD_MINUTES: i64 = 24 * 60;

pub const DEFAULT_WINDOW_MINUTES_PRIMARY: i64 = 300;
pub const DEFAULT_WINDOW_MINUTES_SECONDARY: i64 = 10_080;

const KNOWN_PLAN_TYPES: &[&str] = &[
    "guest",
    "free",
    "go",
    "plus",
    "pro",
    "free_workspace",
    "team",
    "business",
    "education",
    "quorum",
    "k12",
    "enterprise",
    "edu",
];

/// Highest-value plan wins when a pool mixes plans.
const PLAN_TYPE_PRIORITY: &[&str] = &[
    "enterprise",
    "business",
    "team",
    "pro",
    "plus",
    "education",
    "edu",
    "free_workspace",
    "free",
    "go",
    "guest",
    "quorum",
    "k12",
];

/// Credits per cycle by plan and window; unknown plans have no capacity.
pub fn capacity_for_plan(plan_type: Option<&str>, window: UsageWindow) -> Option<f64> {
    let normalized = normalize_plan_type(plan_type)?;
    match (normalized.as_str(), window) {
        ("plus" | "business" | "team", UsageWindow::Primary) => Some(225.0),
        ("plus" | "business" | "team", UsageWindow::Secondary) => Some(7560.0),
        ("pro", UsageWindow::Primary) => Some(1500.0),
        ("pro", UsageWindow::Secondary) => Some(50_400.0),
        _ => None,
    }
}

pub fn default_window_minutes(window: UsageWindow) -> i64 {
    match window {
        UsageWindow::Primary => DEFAULT_WINDOW_MINUTES_PRIMARY,
        UsageWindow::Secondary => DEFAULT_WINDOW_MINUTES_SECONDARY,
    }
}

pub fn normalize_plan_type(value: Option<&str>) -> Option<String> {
    let normalized = value?.trim().to_lowercase();
    KNOWN_PLAN_TYPES
        .contains(&normalized.as_str())
        .then_some(normalized)
}

/// Plan type reported for a pool of accounts: the single shared plan, or the
/// highest-priority one when plans differ; "guest" when nothing is known.
pub fn pooled_plan_type<'a>(plans: impl Iterator<Item = Option<&'a str>>) -> String {
    let mut seen: Vec<String> = Vec::new();
    for plan in plans.flat_map(|p| normalize_plan_type(p)) {
        if !seen.contains(&plan) {
            seen.push(plan);
        }
    }
    match seen.len() {
        0 => "guest".to_string(),
        1 => seen.remove(0),
        _ => PLAN_TYPE_PRIORITY
            .iter()
            .find(|candidate| seen.iter().any(|plan| plan == **candidate))
            .map(|plan| plan.to_string())
            .unwrap_or_else(|| "guest".to_string()),
    }
}

pub fn used_credits_from_percent(used_percent: f64, capacity_credits: f64) -> f64 {
    (capacity_credits * used_percent) / 100.0
}

pub fn remaining_percent_from_used(used_percent: f64) -> f64 {
    (100.0 - used_percent).max(0.0)
}

pub fn remaining_credits_from_percent(used_percent: f64, capacity_credits: f64) -> f64 {
    (capacity_credits - used_credits_from_percent(used_percent, capacity_credits)).max(0.0)
}

/// One account's contribution to a window summary.
#[derive(Debug, Clone)]
pub struct WindowRow {
    pub account_id: String,
    pub used_percent: Option<f64>,
    pub reset_at: Option<i64>,
    pub window_minutes: Option<i64>,
}

/// Pool-wide aggregate of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSummary {
    pub used_percent: Option<f64>,
    pub capacity_credits: f64,
    pub used_credits: f64,
    /// Earliest reset over the pool
    pub reset_at: Option<i64>,
    /// Longest window seen; default when no row carries one
    pub window_minutes: i64,
}

/// Aggregate usage rows into a capacity-weighted pool summary.
pub fn summarize_window(
    rows: &[WindowRow],
    plans: &HashMap<String, String>,
    window: UsageWindow,
) -> WindowSummary {
    let mut total_capacity = 0.0;
    let mut total_used = 0.0;
    let mut reset_at: Option<i64> = None;
    let mut window_minutes: Option<i64> = None;

    for row in rows {
        if let Some(value) = row.reset_at {
            reset_at = Some(reset_at.map_or(value, |current| current.min(value)));
        }
        if let Some(minutes) = row.window_minutes.filter(|m| *m > 0) {
            window_minutes = Some(window_minutes.map_or(minutes, |current| current.max(minutes)));
        }
        let capacity = capacity_for_plan(plans.get(&row.account_id).map(String::as_str), window);
        let (Some(used_percent), Some(capacity)) = (row.used_percent, capacity) else {
            continue;
        };
        total_capacity += capacity;
        total_used += used_credits_from_percent(used_percent, capacity);
    }

    let used_percent = (total_capacity > 0.0).then(|| (total_used / total_capacity) * 100.0);
    WindowSummary {
        used_percent,
        capacity_credits: total_capacity,
        used_credits: total_used,
        reset_at,
        window_minutes: window_minutes.unwrap_or_else(|| default_window_minutes(window)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plans(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(id, plan)| (id.to_string(), plan.to_string()))
            .collect()
    }

    #[test]
    fn test_capacity_table() {
        assert_eq!(capacity_for_plan(Some("plus"), UsageWindow::Primary), Some(225.0));
        assert_eq!(capacity_for_plan(Some("pro"), UsageWindow::Secondary), Some(50_400.0));
        assert_eq!(capacity_for_plan(Some("Team "), UsageWindow::Secondary), Some(7560.0));
        assert_eq!(capacity_for_plan(Some("free"), UsageWindow::Primary), None);
        assert_eq!(capacity_for_plan(Some("galactic"), UsageWindow::Primary), None);
        assert_eq!(capacity_for_plan(None, UsageWindow::Primary), None);
    }

    #[test]
    fn test_credit_math() {
        assert_eq!(used_credits_from_percent(40.0, 225.0), 90.0);
        assert_eq!(remaining_credits_from_percent(40.0, 225.0), 135.0);
        assert_eq!(remaining_credits_from_percent(120.0, 225.0), 0.0);
        assert_eq!(remaining_percent_from_used(30.0), 70.0);
        assert_eq!(remaining_percent_from_used(130.0), 0.0);
    }

    #[test]
    fn test_pooled_plan_type_priority() {
        assert_eq!(pooled_plan_type([Some("plus"), Some("pro")].into_iter()), "pro");
        assert_eq!(pooled_plan_type([Some("plus"), Some("plus")].into_iter()), "plus");
        assert_eq!(pooled_plan_type([None, Some("bogus")].into_iter()), "guest");
    }

    #[test]
    fn test_summarize_window_weights_by_capacity() {
        let plans = plans(&[("a", "plus"), ("b", "pro")]);
        let rows = vec![
            WindowRow {
                account_id: "a".into(),
                used_percent: Some(100.0),
                reset_at: Some(2000),
                window_minutes: Some(300),
            },
            WindowRow {
                account_id: "b".into(),
                used_percent: Some(0.0),
                reset_at: Some(1000),
                window_minutes: None,
            },
        ];
        let summary = summarize_window(&rows, &plans, UsageWindow::Primary);
        assert_eq!(summary.capacity_credits, 1725.0);
        assert_eq!(summary.used_credits, 225.0);
        // 225 used out of 1725 pooled credits
        let expected = 225.0 / 1725.0 * 100.0;
        assert!((summary.used_percent.unwrap() - expected).abs() < 1e-9);
        assert_eq!(summary.reset_at, Some(1000));
        assert_eq!(summary.window_minutes, 300);
    }

    #[test]
    fn test_summarize_window_without_capacity() {
        let plans = plans(&[("a", "free")]);
        let rows = vec![WindowRow {
            account_id: "a".into(),
            used_percent: Some(50.0),
            reset_at: None,
            window_minutes: None,
        }];
        let summary = summarize_window(&rows, &plans, UsageWindow::Secondary);
        assert_eq!(summary.used_percent, None);
        assert_eq!(summary.window_minutes, DEFAULT_WINDOW_MINUTES_SECONDARY);
    }
}
