//! Tiered scoring over the eligible pool
//!
//! The pool is partitioned into tiers and the best tier picked first;
//! within it one account is drawn. Accounts whose plan has no known
//! secondary capacity always form a trailing tier: without credit math
//! there is no waste to protect, so known-capacity accounts go first.
//!
//! Waste pressure of an account is `remaining_credits / time_to_reset`, the
//! burn rate needed to zero the window out by reset. Higher means more
//! credits at risk of expiring unused.

use std::collections::HashMap;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::SelectionStrategy;
use crate::db::models::{Account, UsageSnapshot};
use crate::usage::plan::{
    capacity_for_plan, default_window_minutes, remaining_credits_from_percent, UsageWindow,
};

const WEIGHT_EPSILON: f64 = 1e-6;

/// Tier identity: known-capacity tiers order by reset bucket, the
/// unknown-capacity tier trails everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TierKey {
    /// Day-granularity bucket of the secondary reset (earlier first).
    ResetBucket(i64),
    /// Capacity known but the flag is off: one flat tier.
    Flat,
    /// No known secondary capacity.
    UnknownCapacity,
}

/// Scoring summary for one tier, surfaced for debugging.
#[derive(Debug, Clone)]
pub struct TierScore {
    pub key: TierKey,
    pub urgency_sum: f64,
    pub account_ids: Vec<String>,
}

#[derive(Debug)]
struct ScoredAccount<'a> {
    account: &'a Account,
    remaining_secondary: Option<f64>,
    urgency: f64,
    primary_used: Option<f64>,
}

/// Score `pool` and pick one account. Deterministic given identical inputs
/// and `seed`; the seed salts the weighted draw per request.
pub fn pick_account<'a>(
    pool: &[&'a Account],
    latest_primary: &HashMap<String, UsageSnapshot>,
    latest_secondary: &HashMap<String, UsageSnapshot>,
    strategy: SelectionStrategy,
    prefer_earlier_reset: bool,
    now_epoch: i64,
    seed: u64,
) -> (Option<&'a Account>, Option<TierKey>, Vec<TierScore>) {
    if pool.is_empty() {
        return (None, None, Vec::new());
    }

    let mut tiers: Vec<(TierKey, Vec<ScoredAccount<'a>>)> = Vec::new();
    for account in pool {
        let scored = score_account(account, latest_primary, latest_secondary, now_epoch);
        let key = tier_key(account, latest_secondary, prefer_earlier_reset);
        match tiers.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, members)) => members.push(scored),
            None => tiers.push((key, vec![scored])),
        }
    }

    tiers.sort_by(|(a_key, a_members), (b_key, b_members)| {
        a_key.cmp(b_key).then_with(|| {
            let a_urgency: f64 = a_members.iter().map(|m| m.urgency).sum();
            let b_urgency: f64 = b_members.iter().map(|m| m.urgency).sum();
            b_urgency.partial_cmp(&a_urgency).unwrap_or(std::cmp::Ordering::Equal)
        })
    });

    let tier_scores: Vec<TierScore> = tiers
        .iter()
        .map(|(key, members)| TierScore {
            key: *key,
            urgency_sum: members.iter().map(|m| m.urgency).sum(),
            account_ids: members.iter().map(|m| m.account.id.clone()).collect(),
        })
        .collect();

    let (selected_key, members) = match tiers.first() {
        Some((key, members)) => (*key, members),
        None => return (None, None, tier_scores),
    };

    let mut ordered: Vec<&ScoredAccount<'a>> = members.iter().collect();
    ordered.sort_by(|a, b| tie_break(a.account, b.account));

    let chosen = match strategy {
        SelectionStrategy::WastePressure => weighted_draw(&ordered, seed),
        SelectionStrategy::Usage => lowest_usage(&ordered),
    };

    (chosen.map(|scored| scored.account), Some(selected_key), tier_scores)
}

fn score_account<'a>(
    account: &'a Account,
    latest_primary: &HashMap<String, UsageSnapshot>,
    latest_secondary: &HashMap<String, UsageSnapshot>,
    now_epoch: i64,
) -> ScoredAccount<'a> {
    let secondary = latest_secondary.get(&account.id);
    let capacity = capacity_for_plan(Some(account.plan_type.as_str()), UsageWindow::Secondary);
    let used_percent = secondary.map(|entry| entry.used_percent).unwrap_or(0.0);
    let remaining = capacity.map(|capacity| remaining_credits_from_percent(used_percent, capacity));

    // No reset marker means the whole window may lie ahead; assume the
    // default span so urgency stays comparable.
    let time_to_reset = secondary
        .and_then(|entry| entry.reset_at)
        .map(|reset_at| (reset_at - now_epoch).max(0))
        .unwrap_or(default_window_minutes(UsageWindow::Secondary) * 60);
    let urgency = remaining
        .map(|remaining| remaining / (time_to_reset.max(1) as f64))
        .unwrap_or(0.0);

    ScoredAccount {
        account,
        remaining_secondary: remaining,
        urgency,
        primary_used: latest_primary.get(&account.id).map(|entry| entry.used_percent),
    }
}

fn tier_key(
    account: &Account,
    latest_secondary: &HashMap<String, UsageSnapshot>,
    prefer_earlier_reset: bool,
) -> TierKey {
    if capacity_for_plan(Some(account.plan_type.as_str()), UsageWindow::Secondary).is_none() {
        return TierKey::UnknownCapacity;
    }
    if !prefer_earlier_reset {
        return TierKey::Flat;
    }
    match latest_secondary.get(&account.id).and_then(|entry| entry.reset_at) {
        Some(reset_at) => TierKey::ResetBucket(reset_at.div_euclid(86_400)),
        None => TierKey::ResetBucket(i64::MAX),
    }
}

/// Lower `status_reset_at` first, then fresher tokens, then id.
fn tie_break(a: &Account, b: &Account) -> std::cmp::Ordering {
    a.status_reset_at
        .unwrap_or(0)
        .cmp(&b.status_reset_at.unwrap_or(0))
        .then_with(|| b.last_refresh.cmp(&a.last_refresh))
        .then_with(|| a.id.cmp(&b.id))
}

/// Weighted draw by remaining secondary credits. Equal weights resolve to
/// the tie-break order; otherwise a request-seeded PRNG draws, so identical
/// inputs with the same request id reproduce.
fn weighted_draw<'s, 'a>(
    ordered: &[&'s ScoredAccount<'a>],
    seed: u64,
) -> Option<&'s ScoredAccount<'a>> {
    if ordered.is_empty() {
        return None;
    }
    let weights: Vec<f64> = ordered
        .iter()
        .map(|scored| scored.remaining_secondary.unwrap_or(0.0) + WEIGHT_EPSILON)
        .collect();
    let all_equal = weights
        .windows(2)
        .all(|pair| (pair[0] - pair[1]).abs() < WEIGHT_EPSILON);
    if all_equal {
        return Some(ordered[0]);
    }

    let total: f64 = weights.iter().sum();
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut target = rng.gen::<f64>() * total;
    for (scored, weight) in ordered.iter().zip(&weights) {
        target -= weight;
        if target <= 0.0 {
            return Some(*scored);
        }
    }
    ordered.last().copied()
}

/// `usage` strategy: lowest primary usage, remaining credits break ties.
fn lowest_usage<'s, 'a>(ordered: &[&'s ScoredAccount<'a>]) -> Option<&'s ScoredAccount<'a>> {
    ordered
        .iter()
        .min_by(|a, b| {
            let a_used = a.primary_used.unwrap_or(0.0);
            let b_used = b.primary_used.unwrap_or(0.0);
            a_used
                .partial_cmp(&b_used)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_remaining = a.remaining_secondary.unwrap_or(0.0);
                    let b_remaining = b.remaining_secondary.unwrap_or(0.0);
                    b_remaining
                        .partial_cmp(&a_remaining)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        })
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::repository::test_account;

    fn usage(account_id: &str, window: &str, used: f64, reset_at: i64) -> UsageSnapshot {
        UsageSnapshot {
            id: 0,
            account_id: account_id.to_string(),
            recorded_at: chrono::Utc::now(),
            window: Some(window.to_string()),
            used_percent: used,
            input_tokens: None,
            output_tokens: None,
            reset_at: Some(reset_at),
            window_minutes: Some(if window == "primary" { 300 } else { 10_080 }),
            credits_has: None,
            credits_unlimited: None,
            credits_balance: None,
        }
    }

    const NOW: i64 = 1_800_000_000;

    #[test]
    fn test_earlier_reset_bucket_wins_in_usage_strategy() {
        let late = test_account("acc_late", "late@example.com", "plus");
        let soon = test_account("acc_soon", "soon@example.com", "plus");
        let pool = vec![&late, &soon];

        let primary = HashMap::from([
            ("acc_late".to_string(), usage("acc_late", "primary", 0.0, NOW + 3600)),
            ("acc_soon".to_string(), usage("acc_soon", "primary", 50.0, NOW + 3600)),
        ]);
        let secondary = HashMap::from([
            ("acc_late".to_string(), usage("acc_late", "secondary", 0.0, NOW + 5 * 86_400)),
            ("acc_soon".to_string(), usage("acc_soon", "secondary", 50.0, NOW + 3600)),
        ]);

        // Earlier reset bucket beats lower usage when the flag is on.
        let (chosen, tier, _) =
            pick_account(&pool, &primary, &secondary, SelectionStrategy::Usage, true, NOW, 7);
        assert_eq!(chosen.unwrap().id, "acc_soon");
        assert!(matches!(tier, Some(TierKey::ResetBucket(_))));
    }

    #[test]
    fn test_unknown_capacity_tier_trails_despite_earlier_reset() {
        let pro = test_account("acc_pro", "pro@example.com", "pro");
        let free = test_account("acc_free", "free@example.com", "free");
        let pool = vec![&free, &pro];

        let secondary = HashMap::from([
            ("acc_pro".to_string(), usage("acc_pro", "secondary", 0.0, NOW + 5 * 86_400)),
            ("acc_free".to_string(), usage("acc_free", "secondary", 0.0, NOW + 3600)),
        ]);

        let (chosen, _, tiers) = pick_account(
            &pool,
            &HashMap::new(),
            &secondary,
            SelectionStrategy::WastePressure,
            true,
            NOW,
            7,
        );
        assert_eq!(chosen.unwrap().id, "acc_pro");
        assert_eq!(tiers.last().unwrap().key, TierKey::UnknownCapacity);
    }

    #[test]
    fn test_equal_weights_resolve_by_tie_break() {
        let a = test_account("acc_a", "a@example.com", "plus");
        let b = test_account("acc_b", "b@example.com", "plus");
        let pool = vec![&b, &a];

        let (chosen, tier, _) = pick_account(
            &pool,
            &HashMap::new(),
            &HashMap::new(),
            SelectionStrategy::WastePressure,
            false,
            NOW,
            99,
        );
        assert_eq!(chosen.unwrap().id, "acc_a");
        assert_eq!(tier, Some(TierKey::Flat));
    }

    #[test]
    fn test_weighted_draw_reproducible_per_seed() {
        let a = test_account("acc_a", "a@example.com", "plus");
        let b = test_account("acc_b", "b@example.com", "plus");
        let pool = vec![&a, &b];
        let secondary = HashMap::from([
            ("acc_a".to_string(), usage("acc_a", "secondary", 10.0, NOW + 86_400)),
            ("acc_b".to_string(), usage("acc_b", "secondary", 90.0, NOW + 86_400)),
        ]);

        let pick = |seed| {
            pick_account(
                &pool,
                &HashMap::new(),
                &secondary,
                SelectionStrategy::WastePressure,
                false,
                NOW,
                seed,
            )
            .0
            .unwrap()
            .id
            .clone()
        };
        for seed in [1_u64, 17, 4242] {
            assert_eq!(pick(seed), pick(seed));
        }
    }

    #[test]
    fn test_usage_strategy_prefers_lowest_primary() {
        let a = test_account("acc_a", "a@example.com", "plus");
        let b = test_account("acc_b", "b@example.com", "plus");
        let pool = vec![&a, &b];
        let primary = HashMap::from([
            ("acc_a".to_string(), usage("acc_a", "primary", 80.0, NOW + 3600)),
            ("acc_b".to_string(), usage("acc_b", "primary", 5.0, NOW + 3600)),
        ]);

        let (chosen, _, _) = pick_account(
            &pool,
            &primary,
            &HashMap::new(),
            SelectionStrategy::Usage,
            false,
            NOW,
            1,
        );
        assert_eq!(chosen.unwrap().id, "acc_b");
    }
}
