//! Per-model pricing
//!
//! Model names seen on the wire are mapped to canonical priced models via
//! glob aliases; the longest matching pattern wins. Cached input tokens bill
//! at the cached rate and are clamped to `[0, input]`. When a log carries no
//! output count the reasoning count stands in.

use std::sync::OnceLock;

use globset::{Glob, GlobMatcher};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_1m: f64,
    pub cached_input_per_1m: Option<f64>,
    pub output_per_1m: f64,
}

/// Token counters normalized for costing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageTokens {
    pub input_tokens: f64,
    pub output_tokens: f64,
    pub cached_input_tokens: f64,
}

impl UsageTokens {
    /// Build from raw counters; `None` when input or output (and reasoning)
    /// are missing. Cached tokens clamp to `[0, input]`.
    pub fn from_counters(
        input_tokens: Option<i64>,
        output_tokens: Option<i64>,
        cached_input_tokens: Option<i64>,
        reasoning_tokens: Option<i64>,
    ) -> Option<Self> {
        let input = input_tokens? as f64;
        let output = output_tokens.or(reasoning_tokens)? as f64;
        let cached = (cached_input_tokens.unwrap_or(0) as f64).clamp(0.0, input);
        Some(Self {
            input_tokens: input,
            output_tokens: output,
            cached_input_tokens: cached,
        })
    }
}

const PRICING_MODELS: &[(&str, ModelPrice)] = &[
    (
        "gpt-5.3",
        ModelPrice { input_per_1m: 1.75, cached_input_per_1m: Some(0.175), output_per_1m: 14.0 },
    ),
    (
        "gpt-5.2",
        ModelPrice { input_per_1m: 1.75, cached_input_per_1m: Some(0.175), output_per_1m: 14.0 },
    ),
    (
        "gpt-5.1",
        ModelPrice { input_per_1m: 1.25, cached_input_per_1m: Some(0.125), output_per_1m: 10.0 },
    ),
    (
        "gpt-5",
        ModelPrice { input_per_1m: 1.25, cached_input_per_1m: Some(0.125), output_per_1m: 10.0 },
    ),
    (
        "gpt-5.1-codex-max",
        ModelPrice { input_per_1m: 1.25, cached_input_per_1m: Some(0.125), output_per_1m: 10.0 },
    ),
    (
        "gpt-5.1-codex-mini",
        ModelPrice { input_per_1m: 0.25, cached_input_per_1m: Some(0.025), output_per_1m: 2.0 },
    ),
    (
        "gpt-5.1-codex",
        ModelPrice { input_per_1m: 1.25, cached_input_per_1m: Some(0.125), output_per_1m: 10.0 },
    ),
    (
        "gpt-5-codex",
        ModelPrice { input_per_1m: 1.25, cached_input_per_1m: Some(0.125), output_per_1m: 10.0 },
    ),
];

const MODEL_ALIASES: &[(&str, &str)] = &[
    ("gpt-5.3*", "gpt-5.3"),
    ("gpt-5.2*", "gpt-5.2"),
    ("gpt-5.1*", "gpt-5.1"),
    ("gpt-5*", "gpt-5"),
    ("gpt-5.1-codex-max*", "gpt-5.1-codex-max"),
    ("gpt-5.1-codex-mini*", "gpt-5.1-codex-mini"),
    ("gpt-5.1-codex*", "gpt-5.1-codex"),
    ("gpt-5-codex*", "gpt-5-codex"),
];

fn compiled_aliases() -> &'static Vec<(GlobMatcher, usize, &'static str)> {
    static COMPILED: OnceLock<Vec<(GlobMatcher, usize, &'static str)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        MODEL_ALIASES
            .iter()
            .filter_map(|(pattern, target)| {
                let matcher = Glob::new(pattern).ok()?.compile_matcher();
                Some((matcher, pattern.len(), *target))
            })
            .collect()
    })
}

/// Canonical model ids known to the pricing table.
pub fn priced_model_ids() -> impl Iterator<Item = &'static str> {
    PRICING_MODELS.iter().map(|(id, _)| *id)
}

/// Resolve a wire model name to a canonical alias target, longest pattern
/// first. Case-insensitive.
pub fn resolve_model_alias(model: &str) -> Option<&'static str> {
    if model.is_empty() {
        return None;
    }
    let normalized = model.to_lowercase();
    compiled_aliases()
        .iter()
        .filter(|(matcher, _, _)| matcher.is_match(&normalized))
        .max_by_key(|(_, pattern_len, _)| *pattern_len)
        .map(|(_, _, target)| *target)
}

/// Price for a wire model name: exact table hit first, then alias match.
pub fn pricing_for_model(model: &str) -> Option<(&'static str, &'static ModelPrice)> {
    if model.is_empty() {
        return None;
    }
    let normalized = model.to_lowercase();
    if let Some((id, price)) = PRICING_MODELS
        .iter()
        .find(|(id, _)| id.eq_ignore_ascii_case(&normalized))
    {
        return Some((id, price));
    }
    let alias = resolve_model_alias(&normalized)?;
    PRICING_MODELS
        .iter()
        .find(|(id, _)| *id == alias)
        .map(|(id, price)| (*id, price))
}

/// `cost = (input - cached)/1e6 * r_in + cached/1e6 * r_cached + output/1e6 * r_out`
pub fn cost_from_usage(usage: &UsageTokens, price: &ModelPrice) -> f64 {
    let billable_input = usage.input_tokens - usage.cached_input_tokens;
    let cached_rate = price.cached_input_per_1m.unwrap_or(price.input_per_1m);
    (billable_input / 1_000_000.0) * price.input_per_1m
        + (usage.cached_input_tokens / 1_000_000.0) * cached_rate
        + (usage.output_tokens / 1_000_000.0) * price.output_per_1m
}

/// Cost of one request log, when the model is priced and counters suffice.
pub fn cost_for_log(
    model: &str,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cached_input_tokens: Option<i64>,
    reasoning_tokens: Option<i64>,
) -> Option<f64> {
    let (_, price) = pricing_for_model(model)?;
    let usage =
        UsageTokens::from_counters(input_tokens, output_tokens, cached_input_tokens, reasoning_tokens)?;
    Some(cost_from_usage(&usage, price))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_longest_pattern_wins() {
        assert_eq!(resolve_model_alias("gpt-5.1-codex-mini-2025"), Some("gpt-5.1-codex-mini"));
        assert_eq!(resolve_model_alias("gpt-5.1-codex"), Some("gpt-5.1-codex"));
        assert_eq!(resolve_model_alias("GPT-5.1-Preview"), Some("gpt-5.1"));
        assert_eq!(resolve_model_alias("gpt-4o"), None);
        assert_eq!(resolve_model_alias(""), None);
    }

    #[test]
    fn test_pricing_exact_match_before_alias() {
        let (id, price) = pricing_for_model("gpt-5.1-codex-max").unwrap();
        assert_eq!(id, "gpt-5.1-codex-max");
        assert_eq!(price.output_per_1m, 10.0);
        assert!(pricing_for_model("claude-3").is_none());
    }

    #[test]
    fn test_cost_formula() {
        let price = ModelPrice {
            input_per_1m: 1.25,
            cached_input_per_1m: Some(0.125),
            output_per_1m: 10.0,
        };
        let usage = UsageTokens {
            input_tokens: 1_000_000.0,
            output_tokens: 100_000.0,
            cached_input_tokens: 200_000.0,
        };
        let cost = cost_from_usage(&usage, &price);
        // 0.8M billed input + 0.2M cached + 0.1M output
        let expected = 0.8 * 1.25 + 0.2 * 0.125 + 0.1 * 10.0;
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn test_cached_clamped_and_reasoning_fallback() {
        let usage = UsageTokens::from_counters(Some(100), None, Some(500), Some(40)).unwrap();
        assert_eq!(usage.cached_input_tokens, 100.0);
        assert_eq!(usage.output_tokens, 40.0);

        assert!(UsageTokens::from_counters(Some(100), None, None, None).is_none());
        assert!(UsageTokens::from_counters(None, Some(10), None, None).is_none());

        let negative = UsageTokens::from_counters(Some(100), Some(10), Some(-5), None).unwrap();
        assert_eq!(negative.cached_input_tokens, 0.0);
    }

    #[test]
    fn test_cost_for_log() {
        let cost = cost_for_log("gpt-5.1-codex-mini-2025", Some(1_000_000), Some(1_000_000), None, None);
        let expected = 0.25 + 2.0;
        assert!((cost.unwrap() - expected).abs() < 1e-9);
        assert!(cost_for_log("unknown-model", Some(1), Some(1), None, None).is_none());
    }
}
