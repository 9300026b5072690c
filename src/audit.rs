use std::{fmt, path::Path};

use anyhow::Result;
use chrono::{DateTime, Local};
use log::info;
use serde::Serialize;

use crate::{
    data::Value,
    dataset::{Column, Dataset},
    schema::ColumnType,
};

pub const DEFAULT_SAMPLE_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    Operation,
    Exclusion,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Operation => f.write_str("Operation"),
            EntryKind::Exclusion => f.write_str("Exclusion"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Local>,
    pub step: String,
    pub description: String,
    pub affected_rows: usize,
    pub kind: EntryKind,
    pub dataset: Option<String>,
}

/// First rows removed by one exclusion entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExclusionSample {
    pub entry_index: usize,
    pub step: String,
    pub rows: Dataset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditLedger {
    entries: Vec<AuditEntry>,
    samples: Vec<ExclusionSample>,
    sample_limit: usize,
}

impl Default for AuditLedger {
    fn default() -> Self {
        AuditLedger::new(DEFAULT_SAMPLE_LIMIT)
    }
}

impl AuditLedger {
    pub fn new(sample_limit: usize) -> Self {
        AuditLedger {
            entries: Vec::new(),
            samples: Vec::new(),
            sample_limit,
        }
    }

    /// Appends an `Operation` entry. Negative counts are clamped to zero.
    pub fn record_operation(&mut self, step: &str, description: &str, affected_rows: i64) {
        let affected = usize::try_from(affected_rows.max(0)).unwrap_or(0);
        self.push(step, description, affected, EntryKind::Operation, None);
    }

    /// Appends an `Exclusion` entry for `excluded`, whose name identifies the
    /// dataset the rows were removed from.
    pub fn record_exclusion(&mut self, step: &str, description: &str, excluded: &Dataset) {
        let affected = excluded.row_count();
        let index = self.push(
            step,
            description,
            affected,
            EntryKind::Exclusion,
            Some(excluded.name().to_string()),
        );
        if affected > 0 {
            self.samples.push(ExclusionSample {
                entry_index: index,
                step: step.to_string(),
                rows: excluded.head(self.sample_limit),
            });
        }
    }

    fn push(
        &mut self,
        step: &str,
        description: &str,
        affected_rows: usize,
        kind: EntryKind,
        dataset: Option<String>,
    ) -> usize {
        info!(
            "[audit] {step}: {} (rows: {affected_rows})",
            description.lines().next().unwrap_or_default()
        );
        self.entries.push(AuditEntry {
            timestamp: Local::now(),
            step: step.to_string(),
            description: description.to_string(),
            affected_rows,
            kind,
            dataset,
        });
        self.entries.len() - 1
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn samples(&self) -> &[ExclusionSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total rows excluded from `dataset` across all exclusion entries.
    pub fn excluded_rows(&self, dataset: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Exclusion && e.dataset.as_deref() == Some(dataset))
            .map(|e| e.affected_rows)
            .sum()
    }

    /// Appends all of `other`'s entries after ours, preserving their order.
    pub fn absorb(&mut self, other: AuditLedger) {
        let offset = self.entries.len();
        self.entries.extend(other.entries);
        self.samples
            .extend(other.samples.into_iter().map(|mut sample| {
                sample.entry_index += offset;
                sample
            }));
    }

    /// The full entry sequence as a flat table for report assembly.
    pub fn export(&self) -> Dataset {
        let mut table = Dataset::new(
            "audit_log",
            vec![
                Column::new("Timestamp", ColumnType::String),
                Column::new("Step", ColumnType::String),
                Column::new("Description", ColumnType::String),
                Column::new("Affected_Rows", ColumnType::Integer),
                Column::new("Type", ColumnType::String),
                Column::new("Dataset", ColumnType::String),
            ],
        );
        for entry in &self.entries {
            let row = vec![
                Some(Value::String(
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                )),
                Some(Value::String(entry.step.clone())),
                Some(Value::String(entry.description.clone())),
                Some(Value::Integer(
                    i64::try_from(entry.affected_rows).unwrap_or(i64::MAX),
                )),
                Some(Value::String(entry.kind.to_string())),
                entry.dataset.clone().map(Value::String),
            ];
            // Arity is fixed above, so this cannot fail.
            let _ = table.push_row(row);
        }
        table
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        self.export().write_csv(path, b',')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;

    fn rows(name: &str, count: usize) -> Dataset {
        Dataset::from_rows(
            name,
            vec![Column::new("n", ColumnType::Integer)],
            (0..count)
                .map(|i| vec![Some(Value::Integer(i as i64))])
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn negative_counts_clamp_to_zero() {
        let mut ledger = AuditLedger::default();
        ledger.record_operation("Fill", "filled gaps", -4);
        assert_eq!(ledger.entries()[0].affected_rows, 0);
        assert_eq!(ledger.entries()[0].kind, EntryKind::Operation);
    }

    #[test]
    fn exclusion_samples_are_bounded() {
        let mut ledger = AuditLedger::new(10);
        ledger.record_exclusion("Drop", "removed noise", &rows("sales", 25));
        assert_eq!(ledger.entries()[0].affected_rows, 25);
        assert_eq!(ledger.samples()[0].rows.row_count(), 10);
        assert_eq!(ledger.excluded_rows("sales"), 25);
        assert_eq!(ledger.excluded_rows("other"), 0);
    }

    #[test]
    fn empty_exclusion_keeps_entry_without_sample() {
        let mut ledger = AuditLedger::default();
        ledger.record_exclusion("Drop", "nothing matched", &rows("sales", 0));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.samples().is_empty());
    }

    #[test]
    fn export_preserves_order_and_kinds() {
        let mut ledger = AuditLedger::default();
        ledger.record_operation("Merge", "joined\nwith details", 3);
        ledger.record_exclusion("Dedupe", "duplicates", &rows("crm", 2));
        let table = ledger.export();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(0, 1), Some(&Value::String("Merge".into())));
        assert_eq!(table.cell(1, 3), Some(&Value::Integer(2)));
        assert_eq!(table.cell(1, 4), Some(&Value::String("Exclusion".into())));
        assert_eq!(table.cell(0, 5), None);
    }

    #[test]
    fn absorb_appends_and_reindexes_samples() {
        let mut pending = AuditLedger::default();
        pending.record_operation("First", "a", 1);
        let mut attempt = AuditLedger::default();
        attempt.record_exclusion("Drop", "b", &rows("sales", 1));
        pending.absorb(attempt);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.samples()[0].entry_index, 1);
        assert_eq!(pending.entries()[0].step, "First");
    }
}
