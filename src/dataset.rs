use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Write as _,
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail, ensure};
use encoding_rs::Encoding;
use itertools::Itertools;
use log::debug;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::Serialize;

use crate::{
    data::{ComparableValue, Value, normalize_column_name, parse_amount, parse_typed_value},
    io_utils,
    schema::{self, ColumnType},
    table,
};

pub(crate) const KEY_SEPARATOR: &str = "\u{1f}";

pub type Row = Vec<Option<Value>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub datatype: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, datatype: ColumnType) -> Self {
        Column {
            name: name.into(),
            datatype,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    name: String,
    columns: Vec<Column>,
    rows: Vec<Row>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Dataset {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(name: impl Into<String>, columns: Vec<Column>, rows: Vec<Row>) -> Result<Self> {
        let mut dataset = Dataset::new(name, columns);
        for row in rows {
            dataset.push_row(row)?;
        }
        Ok(dataset)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn headers(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn push_row(&mut self, row: Row) -> Result<()> {
        ensure!(
            row.len() == self.columns.len(),
            "Row has {} value(s) but dataset '{}' has {} column(s)",
            row.len(),
            self.name,
            self.columns.len()
        );
        self.rows.push(row);
        Ok(())
    }

    /// Looks a column up by exact name, then by normalized name
    /// (`Order ID` and `order_id` are the same column).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .or_else(|| {
                let wanted = normalize_column_name(name.trim());
                self.columns
                    .iter()
                    .position(|c| normalize_column_name(&c.name) == wanted)
            })
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name).ok_or_else(|| {
            anyhow!(
                "Column '{name}' not found in dataset '{}' (columns: {})",
                self.name,
                self.columns.iter().map(|c| c.name.as_str()).join(", ")
            )
        })
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column)).and_then(|v| v.as_ref())
    }

    /// Sorted distinct display values of a column, nulls skipped.
    pub fn distinct_display(&self, column: usize) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.get(column).and_then(|v| v.as_ref()))
            .map(Value::as_display)
            .sorted()
            .dedup()
            .collect()
    }

    pub fn head(&self, limit: usize) -> Dataset {
        Dataset {
            name: self.name.clone(),
            columns: self.columns.clone(),
            rows: self.rows.iter().take(limit).cloned().collect(),
        }
    }

    /// Removes every row for which `remove` answers true and returns the
    /// removed rows as a dataset carrying this dataset's name and columns.
    pub fn partition_rows<F>(&mut self, mut remove: F) -> Result<Dataset>
    where
        F: FnMut(usize, &[Option<Value>]) -> Result<bool>,
    {
        // Decide every row before touching the table so an error leaves it intact.
        let verdicts = self
            .rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                remove(idx, row.as_slice()).with_context(|| format!("Evaluating row {}", idx + 1))
            })
            .collect::<Result<Vec<bool>>>()?;
        let mut kept = Vec::with_capacity(self.rows.len());
        let mut removed = Vec::new();
        for (row, drop) in std::mem::take(&mut self.rows).into_iter().zip(verdicts) {
            if drop {
                removed.push(row);
            } else {
                kept.push(row);
            }
        }
        self.rows = kept;
        Ok(Dataset {
            name: self.name.clone(),
            columns: self.columns.clone(),
            rows: removed,
        })
    }

    /// Drops every row whose key (all columns when `key_columns` is empty)
    /// was already seen, keeping the first occurrence.
    pub fn dedupe(&mut self, key_columns: &[usize]) -> Dataset {
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(self.rows.len());
        let mut removed = Vec::new();
        for row in std::mem::take(&mut self.rows) {
            let key = if key_columns.is_empty() {
                row_key(&row, 0..row.len())
            } else {
                row_key(&row, key_columns.iter().copied())
            };
            if seen.insert(key) {
                kept.push(row);
            } else {
                removed.push(row);
            }
        }
        self.rows = kept;
        Dataset {
            name: self.name.clone(),
            columns: self.columns.clone(),
            rows: removed,
        }
    }

    /// Adds `name` or replaces it in place. Returns true when replaced.
    pub fn set_column(&mut self, name: &str, values: Vec<Option<Value>>) -> Result<bool> {
        ensure!(
            values.len() == self.rows.len(),
            "Column '{name}' has {} value(s) but dataset '{}' has {} row(s)",
            values.len(),
            self.name,
            self.rows.len()
        );
        let datatype = values
            .iter()
            .flatten()
            .map(Value::column_type)
            .reduce(ColumnType::unify)
            .unwrap_or(ColumnType::String);
        match self.column_index(name) {
            Some(idx) => {
                self.columns[idx].datatype = datatype;
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
                Ok(true)
            }
            None => {
                self.columns.push(Column::new(name, datatype));
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
                Ok(false)
            }
        }
    }

    pub fn rename_column(&mut self, old: &str, new: &str) -> Result<()> {
        let idx = self.require_column(old)?;
        if let Some(existing) = self.columns.iter().position(|c| c.name == new) {
            ensure!(
                existing == idx,
                "Column '{new}' already exists in dataset '{}'",
                self.name
            );
        }
        self.columns[idx].name = new.to_string();
        Ok(())
    }

    pub fn select(&mut self, names: &[String]) -> Result<()> {
        let indices = names
            .iter()
            .map(|name| self.require_column(name))
            .collect::<Result<Vec<_>>>()?;
        self.columns = indices.iter().map(|&i| self.columns[i].clone()).collect();
        for row in &mut self.rows {
            *row = indices.iter().map(|&i| row[i].clone()).collect();
        }
        Ok(())
    }

    /// Stable multi-key sort; nulls order first.
    pub fn sort_by(&mut self, keys: &[(usize, bool)]) {
        self.rows.sort_by(|a, b| {
            for (idx, ascending) in keys {
                let left = ComparableValue(a[*idx].clone());
                let right = ComparableValue(b[*idx].clone());
                let ordering = if *ascending {
                    left.cmp(&right)
                } else {
                    right.cmp(&left)
                };
                if ordering.is_ne() {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    /// Groups by the key columns and sums the amount columns. Amounts are
    /// coerced like reconciliation amounts; unparseable cells add nothing.
    pub fn group_sum(&self, name: &str, keys: &[usize], sums: &[usize]) -> Result<Dataset> {
        ensure!(!keys.is_empty(), "Aggregation requires at least one key column");
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, (Row, Vec<Decimal>)> = HashMap::new();
        for row in &self.rows {
            let key = row_key(row, keys.iter().copied());
            let entry = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                (
                    keys.iter().map(|&k| row[k].clone()).collect(),
                    vec![Decimal::ZERO; sums.len()],
                )
            });
            for (total, &column) in entry.1.iter_mut().zip(sums) {
                if let Some(amount) = row[column]
                    .as_ref()
                    .and_then(|v| parse_amount(&v.as_display()))
                {
                    *total = total.checked_add(amount).ok_or_else(|| {
                        anyhow!(
                            "Sum of column '{}' overflowed",
                            self.columns[column].name
                        )
                    })?;
                }
            }
        }

        let mut columns: Vec<Column> = keys.iter().map(|&k| self.columns[k].clone()).collect();
        columns.extend(
            sums.iter()
                .map(|&s| Column::new(self.columns[s].name.clone(), ColumnType::Float)),
        );
        let mut output = Dataset::new(name, columns);
        for key in order {
            let Some((mut row, totals)) = groups.remove(&key) else {
                continue;
            };
            row.extend(
                totals
                    .into_iter()
                    .map(|total| total.to_f64().map(Value::Float)),
            );
            output.push_row(row)?;
        }
        Ok(output)
    }

    pub fn display_rows(&self, limit: usize) -> Vec<Vec<String>> {
        self.rows
            .iter()
            .take(limit)
            .map(|row| {
                row.iter()
                    .map(|v| v.as_ref().map(Value::as_display).unwrap_or_default())
                    .collect()
            })
            .collect()
    }

    pub fn render(&self, limit: usize) -> String {
        table::render_table(&self.headers(), &self.display_rows(limit))
    }

    /// One-paragraph schema summary: name, shape, typed columns, preview.
    pub fn describe(&self, preview_rows: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "--- Dataset: {} ({} rows x {} columns) ---",
            self.name,
            self.rows.len(),
            self.columns.len()
        );
        for (idx, column) in self.columns.iter().enumerate() {
            let nulls = self.rows.iter().filter(|r| r[idx].is_none()).count();
            let _ = writeln!(
                out,
                "  {} ({}) as `{}`, {} null",
                column.name,
                column.datatype,
                normalize_column_name(&column.name),
                nulls
            );
        }
        if preview_rows > 0 && !self.rows.is_empty() {
            out.push_str(&self.render(preview_rows));
        }
        out
    }

    pub fn from_csv(
        name: impl Into<String>,
        path: &Path,
        delimiter: u8,
        encoding: &'static Encoding,
    ) -> Result<Dataset> {
        let name = name.into();
        let mut reader = io_utils::open_csv_reader(path, delimiter)?;
        let headers = io_utils::decode_record(
            &reader.byte_headers().context("Reading CSV headers")?.clone(),
            encoding,
        )?;
        let mut raw_rows = Vec::new();
        for (idx, record) in reader.byte_records().enumerate() {
            let record = record.with_context(|| format!("Reading row {} of {path:?}", idx + 2))?;
            raw_rows.push(io_utils::decode_record(&record, encoding)?);
        }

        let columns = headers
            .iter()
            .enumerate()
            .map(|(idx, header)| {
                let datatype = schema::infer_column_type(
                    raw_rows
                        .iter()
                        .take(schema::DEFAULT_SAMPLE_ROWS)
                        .map(|r| r.get(idx).map(String::as_str).unwrap_or("")),
                );
                Column::new(header.trim(), datatype)
            })
            .collect::<Vec<_>>();

        let mut dataset = Dataset::new(name, columns);
        for (row_idx, raw) in raw_rows.iter().enumerate() {
            let mut row = Vec::with_capacity(dataset.columns.len());
            for (col_idx, column) in dataset.columns.iter().enumerate() {
                let value = raw.get(col_idx).map(String::as_str).unwrap_or("");
                // Values past the inference sample may not fit; keep them as text.
                let parsed = match parse_typed_value(value, &column.datatype) {
                    Ok(parsed) => parsed,
                    Err(_) if !value.is_empty() => Some(Value::String(value.to_string())),
                    Err(err) => {
                        return Err(err.context(format!(
                            "Row {} column '{}'",
                            row_idx + 2,
                            column.name
                        )));
                    }
                };
                row.push(parsed);
            }
            dataset.rows.push(row);
        }
        debug!(
            "Loaded '{}' from {:?}: {} row(s), {} column(s)",
            dataset.name,
            path,
            dataset.rows.len(),
            dataset.columns.len()
        );
        Ok(dataset)
    }

    pub fn write_csv(&self, path: &Path, delimiter: u8) -> Result<()> {
        let mut writer = io_utils::open_csv_writer(path, delimiter)?;
        writer
            .write_record(self.headers())
            .context("Writing CSV headers")?;
        for row in self.display_rows(usize::MAX) {
            writer.write_record(&row).context("Writing CSV row")?;
        }
        writer.flush().context("Flushing CSV output")?;
        Ok(())
    }
}

pub(crate) fn row_key<I>(row: &[Option<Value>], columns: I) -> String
where
    I: IntoIterator<Item = usize>,
{
    columns
        .into_iter()
        .map(|idx| {
            row.get(idx)
                .and_then(|v| v.as_ref())
                .map(Value::as_display)
                .unwrap_or_default()
        })
        .join(KEY_SEPARATOR)
}

#[derive(Debug, Clone)]
struct Entry {
    working: Dataset,
    snapshot: Option<Arc<Dataset>>,
}

/// Name-keyed working datasets plus their ingestion snapshots.
///
/// Cloning is cheap for snapshots (shared `Arc`) and deep for the working
/// copies, which is what the sandbox relies on for all-or-nothing commits.
#[derive(Debug, Clone, Default)]
pub struct DatasetCollection {
    entries: BTreeMap<String, Entry>,
}

impl DatasetCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dataset arriving from ingestion and freezes its snapshot.
    pub fn ingest(&mut self, dataset: Dataset) {
        let snapshot = Arc::new(dataset.clone());
        self.entries.insert(
            dataset.name().to_string(),
            Entry {
                working: dataset,
                snapshot: Some(snapshot),
            },
        );
    }

    /// Stores a dataset produced by a transformation. An existing snapshot
    /// under the same name is kept.
    pub fn insert(&mut self, dataset: Dataset) {
        let name = dataset.name().to_string();
        match self.entries.get_mut(&name) {
            Some(entry) => entry.working = dataset,
            None => {
                self.entries.insert(
                    name,
                    Entry {
                        working: dataset,
                        snapshot: None,
                    },
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.entries.get(name).map(|e| &e.working)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Dataset> {
        self.entries.get_mut(name).map(|e| &mut e.working)
    }

    pub fn require(&self, name: &str) -> Result<&Dataset> {
        self.get(name).ok_or_else(|| self.missing(name))
    }

    pub fn require_mut(&mut self, name: &str) -> Result<&mut Dataset> {
        if !self.entries.contains_key(name) {
            return Err(self.missing(name));
        }
        self.get_mut(name)
            .ok_or_else(|| anyhow!("Dataset '{name}' not found"))
    }

    fn missing(&self, name: &str) -> anyhow::Error {
        anyhow!(
            "Dataset '{name}' not found (available: {})",
            self.entries.keys().join(", ")
        )
    }

    pub fn snapshot(&self, name: &str) -> Option<&Dataset> {
        self.entries
            .get(name)
            .and_then(|e| e.snapshot.as_deref())
    }

    /// Restores the working copy from the ingestion snapshot and returns
    /// the restored row count.
    pub fn reload(&mut self, name: &str) -> Result<usize> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| anyhow!("Dataset '{name}' not found"))?;
        let Some(snapshot) = entry.snapshot.as_ref() else {
            bail!("Dataset '{name}' was created by a transformation and has no snapshot to reload");
        };
        entry.working = Dataset::clone(snapshot);
        Ok(entry.working.row_count())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dataset> {
        self.entries.values().map(|e| &e.working)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::from_rows(
            "orders",
            vec![
                Column::new("Order ID", ColumnType::Integer),
                Column::new("customer", ColumnType::String),
                Column::new("amount", ColumnType::Float),
            ],
            vec![
                vec![
                    Some(Value::Integer(1)),
                    Some(Value::String("acme".into())),
                    Some(Value::Float(10.0)),
                ],
                vec![
                    Some(Value::Integer(2)),
                    Some(Value::String("globex".into())),
                    Some(Value::Float(-3.0)),
                ],
                vec![
                    Some(Value::Integer(3)),
                    Some(Value::String("acme".into())),
                    Some(Value::Float(5.5)),
                ],
            ],
        )
        .unwrap()
    }

    #[test]
    fn column_lookup_accepts_normalized_names() {
        let ds = sample();
        assert_eq!(ds.column_index("order_id"), Some(0));
        assert_eq!(ds.column_index("Order ID"), Some(0));
        assert!(ds.require_column("missing").is_err());
    }

    #[test]
    fn partition_returns_removed_rows() {
        let mut ds = sample();
        let removed = ds
            .partition_rows(|_, row| {
                Ok(row[2]
                    .as_ref()
                    .and_then(Value::as_f64)
                    .is_some_and(|v| v < 0.0))
            })
            .unwrap();
        assert_eq!(removed.row_count(), 1);
        assert_eq!(ds.row_count(), 2);
        assert_eq!(removed.name(), "orders");
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let mut ds = sample();
        let removed = ds.dedupe(&[1]);
        assert_eq!(removed.row_count(), 1);
        assert_eq!(ds.row_count(), 2);
        assert_eq!(ds.cell(0, 0), Some(&Value::Integer(1)));
    }

    #[test]
    fn group_sum_preserves_first_seen_order() {
        let ds = sample();
        let grouped = ds.group_sum("by_customer", &[1], &[2]).unwrap();
        assert_eq!(grouped.row_count(), 2);
        assert_eq!(grouped.cell(0, 0), Some(&Value::String("acme".into())));
        assert_eq!(grouped.cell(0, 1), Some(&Value::Float(15.5)));
        assert_eq!(grouped.cell(1, 1), Some(&Value::Float(-3.0)));
    }

    #[test]
    fn group_sum_overflow_is_an_error() {
        let huge = || Some(Value::String("79228162514264337593543950335".into()));
        let ds = Dataset::from_rows(
            "ledger",
            vec![
                Column::new("customer", ColumnType::String),
                Column::new("amount", ColumnType::String),
            ],
            vec![
                vec![Some(Value::String("acme".into())), huge()],
                vec![Some(Value::String("acme".into())), huge()],
            ],
        )
        .unwrap();
        let err = ds.group_sum("totals", &[0], &[1]).unwrap_err();
        assert!(err.to_string().contains("overflowed"));
    }

    #[test]
    fn set_column_widens_mixed_numeric_types() {
        let mut ds = sample();
        let replaced = ds
            .set_column(
                "score",
                vec![
                    Some(Value::Integer(1)),
                    Some(Value::Float(0.5)),
                    None,
                ],
            )
            .unwrap();
        assert!(!replaced);
        assert_eq!(ds.columns()[3].datatype, ColumnType::Float);
    }

    #[test]
    fn reload_restores_snapshot_and_rejects_derived() {
        let mut collection = DatasetCollection::new();
        collection.ingest(sample());
        collection
            .require_mut("orders")
            .unwrap()
            .partition_rows(|_, _| Ok(true))
            .unwrap();
        assert_eq!(collection.require("orders").unwrap().row_count(), 0);
        assert_eq!(collection.reload("orders").unwrap(), 3);

        let mut derived = sample();
        derived.set_name("copy");
        collection.insert(derived);
        assert!(collection.reload("copy").is_err());
    }
}
