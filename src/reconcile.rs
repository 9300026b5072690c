//! Tolerance-based reconciliation of two amount columns over a shared key.
//!
//! Rows are outer-joined on the key's display text and every pair lands in
//! exactly one status bucket. Amounts are exact decimals, so a tolerance of
//! `0.01` means one cent and nothing drifts through float rounding.

use std::{
    collections::HashMap,
    fmt::{self, Write as _},
};

use anyhow::Result;
use itertools::Itertools;
use rust_decimal::{
    Decimal,
    prelude::{FromPrimitive, ToPrimitive},
};
use serde::Serialize;

use crate::{
    audit::AuditLedger,
    data::{Value, parse_amount},
    dataset::{Column, Dataset},
    schema::ColumnType,
};

pub const RECONCILIATION_STEP: &str = "Reconciliation";

/// Differences at or below this are an exact match.
pub fn exact_epsilon() -> Decimal {
    Decimal::new(1, 6)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MatchStatus {
    ExactMatch,
    ToleranceMatch,
    Mismatch,
    UnmatchedLeft,
    UnmatchedRight,
}

impl MatchStatus {
    pub const ALL: [MatchStatus; 5] = [
        MatchStatus::ExactMatch,
        MatchStatus::ToleranceMatch,
        MatchStatus::Mismatch,
        MatchStatus::UnmatchedLeft,
        MatchStatus::UnmatchedRight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::ExactMatch => "exact match",
            MatchStatus::ToleranceMatch => "tolerance match",
            MatchStatus::Mismatch => "mismatch",
            MatchStatus::UnmatchedLeft => "unmatched (left)",
            MatchStatus::UnmatchedRight => "unmatched (right)",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileSpec {
    pub left_key: String,
    pub right_key: String,
    pub left_amount: String,
    pub right_amount: String,
    pub tolerance: Decimal,
}

impl ReconcileSpec {
    pub fn new(
        (left_key, left_amount): (&str, &str),
        (right_key, right_amount): (&str, &str),
    ) -> Self {
        ReconcileSpec {
            left_key: left_key.to_string(),
            right_key: right_key.to_string(),
            left_amount: left_amount.to_string(),
            right_amount: right_amount.to_string(),
            tolerance: Decimal::ZERO,
        }
    }

    /// Negative or NaN tolerances collapse to zero; positive values beyond
    /// the decimal range saturate to `Decimal::MAX`.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = if tolerance.is_nan() || tolerance <= 0.0 {
            Decimal::ZERO
        } else {
            Decimal::from_f64(tolerance).unwrap_or(Decimal::MAX)
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationRecord {
    pub left_key: Option<String>,
    pub right_key: Option<String>,
    pub left_amount: Decimal,
    pub right_amount: Decimal,
    /// `left - right`, with a missing side counted as zero.
    pub difference: Decimal,
    pub status: MatchStatus,
    pub left_unparsed: bool,
    pub right_unparsed: bool,
}

struct Side {
    key: Option<String>,
    amount: Decimal,
    unparsed: bool,
}

fn read_side(row: &[Option<Value>], key: usize, amount: usize) -> Side {
    let parsed = row[amount].as_ref().and_then(|v| parse_amount(&v.as_display()));
    Side {
        key: row[key].as_ref().map(Value::as_display),
        amount: parsed.unwrap_or(Decimal::ZERO),
        unparsed: parsed.is_none(),
    }
}

fn classify(left: Option<&Side>, right: Option<&Side>, tolerance: Decimal) -> MatchStatus {
    match (left, right) {
        (Some(_), None) => MatchStatus::UnmatchedLeft,
        (None, _) => MatchStatus::UnmatchedRight,
        (Some(l), Some(r)) => {
            // A difference outside the decimal range can never fall in a band.
            let Some(delta) = l.amount.checked_sub(r.amount).map(|d| d.abs()) else {
                return MatchStatus::Mismatch;
            };
            if delta <= exact_epsilon() {
                MatchStatus::ExactMatch
            } else if delta <= tolerance {
                MatchStatus::ToleranceMatch
            } else {
                MatchStatus::Mismatch
            }
        }
    }
}

fn record(left: Option<&Side>, right: Option<&Side>, tolerance: Decimal) -> ReconciliationRecord {
    let left_amount = left.map_or(Decimal::ZERO, |s| s.amount);
    let right_amount = right.map_or(Decimal::ZERO, |s| s.amount);
    ReconciliationRecord {
        left_key: left.and_then(|s| s.key.clone()),
        right_key: right.and_then(|s| s.key.clone()),
        left_amount,
        right_amount,
        difference: left_amount.saturating_sub(right_amount),
        status: classify(left, right, tolerance),
        left_unparsed: left.is_some_and(|s| s.unparsed),
        right_unparsed: right.is_some_and(|s| s.unparsed),
    }
}

/// Outer-joins `left` and `right` on their key columns and classifies every
/// pair. Left rows come first in their original order, each followed by
/// every right row sharing its key; unpaired right rows follow in order.
/// Null keys never pair.
pub fn reconcile(
    left: &Dataset,
    right: &Dataset,
    spec: &ReconcileSpec,
    ledger: &mut AuditLedger,
) -> Result<Vec<ReconciliationRecord>> {
    let left_key = left.require_column(&spec.left_key)?;
    let left_amount = left.require_column(&spec.left_amount)?;
    let right_key = right.require_column(&spec.right_key)?;
    let right_amount = right.require_column(&spec.right_amount)?;
    let tolerance = spec.tolerance.max(Decimal::ZERO);

    let right_sides = right
        .rows()
        .iter()
        .map(|row| read_side(row, right_key, right_amount))
        .collect::<Vec<_>>();
    let mut right_index: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, side) in right_sides.iter().enumerate() {
        if let Some(key) = side.key.as_deref() {
            right_index.entry(key).or_default().push(idx);
        }
    }

    let mut paired = vec![false; right_sides.len()];
    let mut records = Vec::with_capacity(left.row_count() + right.row_count());
    for row in left.rows() {
        let side = read_side(row, left_key, left_amount);
        let partners = side.key.as_deref().and_then(|key| right_index.get(key));
        match partners {
            Some(indices) => {
                for &idx in indices {
                    paired[idx] = true;
                    records.push(record(Some(&side), Some(&right_sides[idx]), tolerance));
                }
            }
            None => records.push(record(Some(&side), None, tolerance)),
        }
    }
    for (side, _) in right_sides.iter().zip(&paired).filter(|(_, p)| !**p) {
        records.push(record(None, Some(side), tolerance));
    }

    let description = summarize(left, right, &records, tolerance);
    ledger.record_operation(
        RECONCILIATION_STEP,
        &description,
        i64::try_from(records.len()).unwrap_or(i64::MAX),
    );
    Ok(records)
}

fn summarize(
    left: &Dataset,
    right: &Dataset,
    records: &[ReconciliationRecord],
    tolerance: Decimal,
) -> String {
    let counts = records.iter().counts_by(|r| r.status);
    let buckets = MatchStatus::ALL
        .iter()
        .map(|status| format!("{} {status}", counts.get(status).copied().unwrap_or(0)))
        .join(", ");
    let mut description = format!(
        "Reconciled '{}' against '{}' (tolerance {tolerance}): {buckets}",
        left.name(),
        right.name()
    );
    let unparsed = records
        .iter()
        .map(|r| usize::from(r.left_unparsed) + usize::from(r.right_unparsed))
        .sum::<usize>();
    if unparsed > 0 {
        let _ = write!(
            description,
            "; {unparsed} amount(s) could not be parsed and were counted as 0"
        );
    }
    description
}

/// Renders reconciliation records as a table for display or export.
pub fn records_to_dataset(name: &str, records: &[ReconciliationRecord]) -> Result<Dataset> {
    let columns = vec![
        Column::new("left_key", ColumnType::String),
        Column::new("right_key", ColumnType::String),
        Column::new("left_amount", ColumnType::Float),
        Column::new("right_amount", ColumnType::Float),
        Column::new("difference", ColumnType::Float),
        Column::new("status", ColumnType::String),
        Column::new("left_unparsed", ColumnType::Boolean),
        Column::new("right_unparsed", ColumnType::Boolean),
    ];
    let amount = |d: Decimal| d.to_f64().map(Value::Float);
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.left_key.clone().map(Value::String),
                r.right_key.clone().map(Value::String),
                amount(r.left_amount),
                amount(r.right_amount),
                amount(r.difference),
                Some(Value::String(r.status.to_string())),
                Some(Value::Boolean(r.left_unparsed)),
                Some(Value::Boolean(r.right_unparsed)),
            ]
        })
        .collect();
    Dataset::from_rows(name, columns, rows)
}
