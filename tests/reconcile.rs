mod common;

use proptest::prelude::*;
use rust_decimal::Decimal;
use tabheal::{
    audit::AuditLedger,
    reconcile::{MatchStatus, ReconcileSpec, reconcile, records_to_dataset},
};

use common::ledger;

fn spec(tolerance: f64) -> ReconcileSpec {
    ReconcileSpec::new(("key", "amount"), ("key", "amount")).with_tolerance(tolerance)
}

#[test]
fn difference_inside_tolerance_is_a_tolerance_match() {
    let left = ledger("books", &[("INV-1", 1000)]);
    let right = ledger("bank", &[("INV-1", 995)]);
    let records = reconcile(&left, &right, &spec(10.0), &mut AuditLedger::default()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, MatchStatus::ToleranceMatch);
    assert_eq!(records[0].difference, Decimal::from(5));
}

#[test]
fn huge_tolerances_keep_the_match() {
    let left = ledger("books", &[("INV-1", 1000)]);
    let right = ledger("bank", &[("INV-1", 995)]);
    for tolerance in [10.0, 1e30, f64::MAX, f64::INFINITY] {
        let records =
            reconcile(&left, &right, &spec(tolerance), &mut AuditLedger::default()).unwrap();
        assert_eq!(records[0].status, MatchStatus::ToleranceMatch, "tolerance {tolerance}");
    }
}

#[test]
fn left_only_key_is_unmatched_left() {
    let left = ledger("books", &[("X123", 40), ("INV-2", 7)]);
    let right = ledger("bank", &[("INV-2", 7), ("INV-9", 3)]);
    let mut audit = AuditLedger::default();
    let records = reconcile(&left, &right, &spec(0.0), &mut audit).unwrap();
    let statuses: Vec<_> = records.iter().map(|r| (r.left_key.clone(), r.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (Some("X123".to_string()), MatchStatus::UnmatchedLeft),
            (Some("INV-2".to_string()), MatchStatus::ExactMatch),
            (None, MatchStatus::UnmatchedRight),
        ]
    );
    assert_eq!(audit.entries()[0].affected_rows, 3);

    let table = records_to_dataset("reconciliation", &records).unwrap();
    assert_eq!(table.row_count(), 3);
    assert!(table.column_index("status").is_some());
}

fn keyed_rows() -> impl Strategy<Value = Vec<(String, i64)>> {
    proptest::collection::vec(
        (
            proptest::sample::select(vec!["A", "B", "C", "D", "E", "F"]),
            -500i64..500,
        ),
        0..12,
    )
    .prop_map(|rows| {
        let mut seen = std::collections::HashSet::new();
        rows.into_iter()
            .filter(|(key, _)| seen.insert(*key))
            .map(|(key, amount)| (key.to_string(), amount))
            .collect()
    })
}

fn tolerances() -> impl Strategy<Value = f64> {
    prop_oneof![
        4 => 0.0f64..50.0,
        2 => 50.0f64..f64::MAX,
        1 => Just(f64::MAX),
        1 => Just(f64::INFINITY),
    ]
}

fn as_ledger(name: &str, rows: &[(String, i64)]) -> tabheal::dataset::Dataset {
    let borrowed: Vec<(&str, i64)> = rows.iter().map(|(k, a)| (k.as_str(), *a)).collect();
    ledger(name, &borrowed)
}

proptest! {
    #[test]
    fn record_count_is_left_plus_right_minus_matched(left in keyed_rows(), right in keyed_rows()) {
        let records = reconcile(
            &as_ledger("l", &left),
            &as_ledger("r", &right),
            &spec(0.0),
            &mut AuditLedger::default(),
        )
        .unwrap();
        let matched = left
            .iter()
            .filter(|(key, _)| right.iter().any(|(other, _)| other == key))
            .count();
        prop_assert_eq!(records.len(), left.len() + right.len() - matched);
    }

    #[test]
    fn widening_tolerance_never_loses_matches(
        left in keyed_rows(),
        right in keyed_rows(),
        narrow in tolerances(),
        extra in tolerances(),
    ) {
        let matches = |tolerance: f64| {
            reconcile(
                &as_ledger("l", &left),
                &as_ledger("r", &right),
                &spec(tolerance),
                &mut AuditLedger::default(),
            )
            .unwrap()
            .iter()
            .filter(|r| matches!(r.status, MatchStatus::ExactMatch | MatchStatus::ToleranceMatch))
            .count()
        };
        prop_assert!(matches(narrow + extra) >= matches(narrow));
    }
}
