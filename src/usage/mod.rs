//! Usage accounting: plan capacities, window math, pricing, snapshots.

pub mod plan;
pub mod pricing;
pub mod refresher;
pub mod repository;

pub use plan::{
    capacity_for_plan, default_window_minutes, normalize_plan_type, pooled_plan_type,
    remaining_credits_from_percent, remaining_percent_from_used, summarize_window,
    used_credits_from_percent, UsageWindow, WindowRow, WindowSummary,
};
