use std::collections::BTreeSet;

use itertools::Itertools;
use similar::TextDiff;

const UNBASE_SCALE: f64 = 0.95;

/// Lowercases, turns everything that is not alphanumeric into a space and
/// collapses runs of whitespace.
pub fn default_process(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .join(" ")
}

/// Case-fold and trim, the normalization used for exact key comparison.
pub fn fold_key(value: &str) -> String {
    value.trim().to_lowercase()
}

fn char_len(value: &str) -> usize {
    value.chars().count()
}

/// Plain character similarity, `2 * matches / total * 100`.
pub fn ratio(left: &str, right: &str) -> f64 {
    if left.is_empty() && right.is_empty() {
        return 100.0;
    }
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    f64::from(TextDiff::from_chars(left, right).ratio()) * 100.0
}

/// Best ratio between the shorter string and every same-length window of
/// the longer one.
pub fn partial_ratio(left: &str, right: &str) -> f64 {
    let (short, long) = if char_len(left) <= char_len(right) {
        (left, right)
    } else {
        (right, left)
    };
    let short_len = char_len(short);
    if short_len == 0 {
        return 0.0;
    }
    let long_chars = long.chars().collect::<Vec<_>>();
    if long_chars.len() == short_len {
        return ratio(short, long);
    }
    let mut best = 0.0_f64;
    for window in long_chars.windows(short_len) {
        let candidate = window.iter().collect::<String>();
        best = best.max(ratio(short, &candidate));
        if best >= 100.0 {
            break;
        }
    }
    best
}

fn sorted_tokens(value: &str) -> String {
    value.split_whitespace().sorted().join(" ")
}

pub fn token_sort_ratio(left: &str, right: &str) -> f64 {
    ratio(&sorted_tokens(left), &sorted_tokens(right))
}

fn partial_token_sort_ratio(left: &str, right: &str) -> f64 {
    partial_ratio(&sorted_tokens(left), &sorted_tokens(right))
}

fn token_set_with(left: &str, right: &str, scorer: fn(&str, &str) -> f64) -> f64 {
    let left_tokens: BTreeSet<&str> = left.split_whitespace().collect();
    let right_tokens: BTreeSet<&str> = right.split_whitespace().collect();
    if left_tokens.is_empty() || right_tokens.is_empty() {
        return 0.0;
    }
    let intersection = left_tokens.intersection(&right_tokens).join(" ");
    let only_left = left_tokens.difference(&right_tokens).join(" ");
    let only_right = right_tokens.difference(&left_tokens).join(" ");
    if !intersection.is_empty() && (only_left.is_empty() || only_right.is_empty()) {
        return 100.0;
    }
    let combined_left = format!("{intersection} {only_left}").trim().to_string();
    let combined_right = format!("{intersection} {only_right}").trim().to_string();
    let mut best = scorer(&combined_left, &combined_right);
    if !intersection.is_empty() {
        best = best
            .max(scorer(&intersection, &combined_left))
            .max(scorer(&intersection, &combined_right));
    }
    best
}

pub fn token_set_ratio(left: &str, right: &str) -> f64 {
    token_set_with(left, right, ratio)
}

fn partial_token_set_ratio(left: &str, right: &str) -> f64 {
    token_set_with(left, right, partial_ratio)
}

/// Length- and token-aware similarity between two raw keys, rounded to two
/// decimals. Inputs are run through [`default_process`] first.
pub fn weighted_ratio(left: &str, right: &str) -> f64 {
    let left = default_process(left);
    let right = default_process(right);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let base = ratio(&left, &right);
    let (left_len, right_len) = (char_len(&left), char_len(&right));
    let length_ratio = left_len.max(right_len) as f64 / left_len.min(right_len) as f64;

    let score = if length_ratio < 1.5 {
        base.max(token_sort_ratio(&left, &right) * UNBASE_SCALE)
            .max(token_set_ratio(&left, &right) * UNBASE_SCALE)
    } else {
        let partial_scale = if length_ratio < 8.0 { 0.9 } else { 0.6 };
        base.max(partial_ratio(&left, &right) * partial_scale)
            .max(partial_token_sort_ratio(&left, &right) * UNBASE_SCALE * partial_scale)
            .max(partial_token_set_ratio(&left, &right) * UNBASE_SCALE * partial_scale)
    };
    (score * 100.0).round() / 100.0
}
