use anyhow::{Context, Result, anyhow, bail, ensure};
use evalexpr::Value as EvalValue;
use itertools::Itertools;
use log::debug;
use rust_decimal::{Decimal, prelude::ToPrimitive};

use super::{
    AttemptError, Chart, ExecutionOutput,
    payload::{MeasureFn, Statement, StatementKind},
};
use crate::{
    audit::AuditLedger,
    config::EngineConfig,
    data::{Value, evalexpr_to_value, parse_amount},
    dataset::{Dataset, DatasetCollection},
    expr::{self, Scalars},
    matching::{self, MatchingCascade},
    reconcile::{self, ReconcileSpec},
    semantic::{Embedder, MatchJudge},
};

pub struct Interpreter<'w> {
    datasets: &'w mut DatasetCollection,
    config: &'w EngineConfig,
    embedder: Option<&'w dyn Embedder>,
    judge: Option<&'w dyn MatchJudge>,
    ledger: AuditLedger,
    scalars: Scalars,
    log: Vec<String>,
    output: ExecutionOutput,
    current: Option<(usize, String)>,
}

impl<'w> Interpreter<'w> {
    pub fn new(
        datasets: &'w mut DatasetCollection,
        config: &'w EngineConfig,
        embedder: Option<&'w dyn Embedder>,
        judge: Option<&'w dyn MatchJudge>,
        ledger: AuditLedger,
    ) -> Self {
        Interpreter {
            datasets,
            config,
            embedder,
            judge,
            ledger,
            scalars: Scalars::new(),
            log: Vec::new(),
            output: ExecutionOutput::default(),
            current: None,
        }
    }

    pub fn run(&mut self, statements: &[Statement]) -> Result<(), AttemptError> {
        for statement in statements {
            self.current = Some((statement.line, statement.text.clone()));
            debug!("line {}: {}", statement.line, statement.text);
            self.execute(&statement.kind)
                .map_err(|err| AttemptError::Runtime {
                    line: statement.line,
                    statement: statement.text.clone(),
                    message: format!("{err:#}"),
                })?;
        }
        self.current = None;
        Ok(())
    }

    /// Attributes a caught panic to the statement that was running.
    pub fn panic_error(&self, message: String) -> AttemptError {
        let (line, statement) = self.current.clone().unwrap_or_default();
        AttemptError::Runtime {
            line,
            statement,
            message: format!("internal error: {message}"),
        }
    }

    pub fn finish(self) -> (Vec<String>, ExecutionOutput, AuditLedger) {
        (self.log, self.output, self.ledger)
    }

    fn execute(&mut self, kind: &StatementKind) -> Result<()> {
        match kind {
            StatementKind::Print(expr) => {
                let value = self.eval_scalar(expr)?;
                self.log.push(display_eval(&value));
            }
            StatementKind::Let { name, expr } => {
                let value = self.eval_scalar(expr)?;
                self.scalars.insert(name.clone(), value);
            }
            StatementKind::Measure {
                name,
                func,
                dataset,
                column,
            } => {
                let value = measure(self.datasets.require(dataset)?, *func, column.as_deref())?;
                self.scalars.insert(name.clone(), value);
            }
            StatementKind::Drop {
                dataset,
                predicate,
                step,
            } => self.drop_rows(dataset, predicate, step.as_deref())?,
            StatementKind::Dedupe {
                dataset,
                columns,
                step,
            } => {
                let target = self.datasets.require_mut(dataset)?;
                let indices = columns
                    .iter()
                    .map(|c| target.require_column(c))
                    .collect::<Result<Vec<_>>>()?;
                let removed = target.dedupe(&indices);
                let scope = if columns.is_empty() {
                    "all columns".to_string()
                } else {
                    columns.join(", ")
                };
                self.ledger.record_exclusion(
                    step.as_deref().unwrap_or("Deduplicate"),
                    &format!("Removed duplicate rows of '{dataset}' by {scope}"),
                    &removed,
                );
            }
            StatementKind::Derive {
                dataset,
                column,
                expr,
            } => {
                let values = self.eval_rows(dataset, expr, |_| true)?;
                let target = self.datasets.require_mut(dataset)?;
                let replaced =
                    target.set_column(column, values.into_iter().map(|(_, v)| v).collect())?;
                let rows = target.row_count();
                self.ledger.record_operation(
                    "Derive",
                    &format!(
                        "{} column '{column}' of '{dataset}' as {expr}",
                        if replaced { "Replaced" } else { "Added" }
                    ),
                    count(rows),
                );
            }
            StatementKind::Fill {
                dataset,
                column,
                expr,
            } => {
                let idx = self.datasets.require(dataset)?.require_column(column)?;
                let filled = self.eval_rows(dataset, expr, |row| row[idx].is_none())?;
                let target = self.datasets.require_mut(dataset)?;
                let mut values = target
                    .rows()
                    .iter()
                    .map(|row| row[idx].clone())
                    .collect::<Vec<_>>();
                let mut changed = 0;
                for (row, value) in filled {
                    if value.is_some() {
                        changed += 1;
                    }
                    values[row] = value;
                }
                let name = target.columns()[idx].name.clone();
                target.set_column(&name, values)?;
                self.ledger.record_operation(
                    "Fill",
                    &format!("Filled {changed} null value(s) in '{name}' of '{dataset}' with {expr}"),
                    count(changed),
                );
            }
            StatementKind::Rename { dataset, from, to } => {
                let target = self.datasets.require_mut(dataset)?;
                target.rename_column(from, to)?;
                let rows = target.row_count();
                self.ledger.record_operation(
                    "Rename",
                    &format!("Renamed column '{from}' of '{dataset}' to '{to}'"),
                    count(rows),
                );
            }
            StatementKind::Select { dataset, columns } => {
                let target = self.datasets.require_mut(dataset)?;
                target.select(columns)?;
                let rows = target.row_count();
                self.ledger.record_operation(
                    "Select",
                    &format!("Kept columns {} of '{dataset}'", columns.join(", ")),
                    count(rows),
                );
            }
            StatementKind::Sort { dataset, keys } => {
                let target = self.datasets.require_mut(dataset)?;
                let indices = keys
                    .iter()
                    .map(|(name, ascending)| Ok((target.require_column(name)?, *ascending)))
                    .collect::<Result<Vec<_>>>()?;
                target.sort_by(&indices);
                let rows = target.row_count();
                let order = keys
                    .iter()
                    .map(|(name, asc)| format!("{name} {}", if *asc { "asc" } else { "desc" }))
                    .join(", ");
                self.ledger.record_operation(
                    "Sort",
                    &format!("Sorted '{dataset}' by {order}"),
                    count(rows),
                );
            }
            StatementKind::Copy { source, target } => {
                let mut copy = self.datasets.require(source)?.clone();
                copy.set_name(target.clone());
                self.datasets.insert(copy);
            }
            StatementKind::Aggregate {
                dataset,
                keys,
                sums,
                into,
            } => {
                let source = self.datasets.require(dataset)?;
                let key_idx = keys
                    .iter()
                    .map(|k| source.require_column(k))
                    .collect::<Result<Vec<_>>>()?;
                let sum_idx = sums
                    .iter()
                    .map(|s| source.require_column(s))
                    .collect::<Result<Vec<_>>>()?;
                let grouped = source.group_sum(into, &key_idx, &sum_idx)?;
                let groups = grouped.row_count();
                self.ledger.record_operation(
                    "Aggregate",
                    &format!(
                        "Grouped '{dataset}' by {} summing {} into '{into}' ({groups} group(s))",
                        keys.join(", "),
                        sums.join(", ")
                    ),
                    count(groups),
                );
                self.datasets.insert(grouped);
            }
            StatementKind::Resolve {
                left,
                left_key,
                right,
                right_key,
                into,
            } => {
                let mut cascade = MatchingCascade::new(self.config.matching.clone());
                if let Some(embedder) = self.embedder {
                    cascade = cascade.with_embedder(embedder);
                }
                if let Some(judge) = self.judge {
                    cascade = cascade.with_judge(judge);
                }
                let merged = matching::resolve_and_merge(
                    &cascade,
                    into,
                    (self.datasets.require(left)?, left_key.as_str()),
                    (self.datasets.require(right)?, right_key.as_str()),
                    &mut self.ledger,
                )?;
                self.datasets.insert(merged);
            }
            StatementKind::Reconcile {
                left,
                left_key,
                left_amount,
                right,
                right_key,
                right_amount,
                tolerance,
                into,
            } => {
                let spec = ReconcileSpec::new(
                    (left_key.as_str(), left_amount.as_str()),
                    (right_key.as_str(), right_amount.as_str()),
                )
                .with_tolerance(tolerance.unwrap_or(self.config.reconcile.default_tolerance));
                let records = reconcile::reconcile(
                    self.datasets.require(left)?,
                    self.datasets.require(right)?,
                    &spec,
                    &mut self.ledger,
                )?;
                self.datasets
                    .insert(reconcile::records_to_dataset(into, &records)?);
            }
            StatementKind::Reload(dataset) => {
                let rows = self.datasets.reload(dataset)?;
                self.ledger.record_operation(
                    "Reload",
                    &format!("Restored '{dataset}' from its ingestion snapshot"),
                    count(rows),
                );
            }
            StatementKind::Chart {
                kind,
                dataset,
                x,
                y,
                title,
            } => {
                let chart = Chart::from_dataset(
                    *kind,
                    self.datasets.require(dataset)?,
                    x,
                    y,
                    title.as_deref(),
                )?;
                self.output.charts.push(chart);
            }
            StatementKind::Result(dataset) => {
                ensure!(
                    self.output.result.is_none(),
                    "A result table was already designated"
                );
                self.output.result = Some(self.datasets.require(dataset)?.clone());
            }
            StatementKind::Head { dataset, rows } => {
                let limit = rows.unwrap_or(self.config.sandbox.preview_rows);
                let rendered = self.datasets.require(dataset)?.render(limit);
                self.log.push(rendered.trim_end().to_string());
            }
            StatementKind::Describe(dataset) => {
                let description = self
                    .datasets
                    .require(dataset)?
                    .describe(self.config.sandbox.preview_rows);
                self.log.push(description.trim_end().to_string());
            }
            StatementKind::Assert { expr, message } => {
                let context = expr::build_scalar_context(&self.scalars)?;
                if !expr::evaluate_to_bool(expr, &context)? {
                    bail!(
                        "{}",
                        message
                            .clone()
                            .unwrap_or_else(|| format!("Assertion failed: {expr}"))
                    );
                }
            }
            StatementKind::Fail(message) => bail!("{message}"),
            StatementKind::Done => {
                self.output.completed = true;
                self.log
                    .push(self.config.orchestration.completion_marker.clone());
            }
        }
        Ok(())
    }

    fn eval_scalar(&self, expr: &str) -> Result<EvalValue> {
        let context = expr::build_scalar_context(&self.scalars)?;
        expr::evaluate(expr, &context)
    }

    /// Evaluates `expr` for every row accepted by `filter`, returning the
    /// row index with the resulting cell.
    fn eval_rows<F>(
        &self,
        dataset: &str,
        expr: &str,
        filter: F,
    ) -> Result<Vec<(usize, Option<Value>)>>
    where
        F: Fn(&[Option<Value>]) -> bool,
    {
        let source = self.datasets.require(dataset)?;
        source
            .rows()
            .iter()
            .enumerate()
            .filter(|(_, row)| filter(row))
            .map(|(idx, row)| -> Result<(usize, Option<Value>)> {
                let context =
                    expr::build_row_context(source.columns(), row, idx + 1, &self.scalars)?;
                let value = expr::evaluate(expr, &context)
                    .with_context(|| format!("Row {}", idx + 1))?;
                Ok((idx, evalexpr_to_value(value)))
            })
            .collect()
    }

    fn drop_rows(&mut self, dataset: &str, predicate: &str, step: Option<&str>) -> Result<()> {
        let scalars = &self.scalars;
        let target = self.datasets.require_mut(dataset)?;
        let columns = target.columns().to_vec();
        let removed = target.partition_rows(|idx, row| {
            let context = expr::build_row_context(&columns, row, idx + 1, scalars)?;
            expr::evaluate_to_bool(predicate, &context)
        })?;
        self.ledger.record_exclusion(
            step.unwrap_or("Drop rows"),
            &format!("Removed rows of '{dataset}' where {predicate}"),
            &removed,
        );
        Ok(())
    }
}

fn count(rows: usize) -> i64 {
    i64::try_from(rows).unwrap_or(i64::MAX)
}

fn display_eval(value: &EvalValue) -> String {
    match value {
        EvalValue::String(s) => s.clone(),
        EvalValue::Empty => String::new(),
        other => evalexpr_to_value(other.clone())
            .map(|v| v.as_display())
            .unwrap_or_default(),
    }
}

fn measure(dataset: &Dataset, func: MeasureFn, column: Option<&str>) -> Result<EvalValue> {
    if func == MeasureFn::Rows {
        return Ok(EvalValue::Int(count(dataset.row_count())));
    }
    let name = column.ok_or_else(|| anyhow!("Measure needs a column"))?;
    let idx = dataset.require_column(name)?;
    let cells = dataset.rows().iter().map(|row| row[idx].as_ref());
    Ok(match func {
        MeasureFn::Rows => EvalValue::Int(count(dataset.row_count())),
        MeasureFn::Nulls => EvalValue::Int(count(cells.filter(Option::is_none).count())),
        MeasureFn::Distinct => EvalValue::Int(count(dataset.distinct_display(idx).len())),
        MeasureFn::Sum | MeasureFn::Mean | MeasureFn::Min | MeasureFn::Max => {
            let amounts = cells
                .flatten()
                .filter_map(|v| parse_amount(&v.as_display()))
                .collect::<Vec<Decimal>>();
            let total = || {
                amounts
                    .iter()
                    .try_fold(Decimal::ZERO, |acc, d| acc.checked_add(*d))
                    .ok_or_else(|| {
                        anyhow!("Sum of column '{name}' of '{}' overflowed", dataset.name())
                    })
            };
            let result = match func {
                MeasureFn::Sum => Some(total()?),
                MeasureFn::Mean if amounts.is_empty() => None,
                MeasureFn::Mean => total()?.checked_div(Decimal::from(amounts.len())),
                MeasureFn::Min => amounts.iter().min().copied(),
                _ => amounts.iter().max().copied(),
            };
            match result.and_then(|d| d.to_f64()) {
                Some(value) => EvalValue::Float(value),
                None => bail!("Column '{name}' of '{}' has no numeric values", dataset.name()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::Column, schema::ColumnType};

    fn datasets() -> DatasetCollection {
        let mut collection = DatasetCollection::new();
        collection.ingest(
            Dataset::from_rows(
                "orders",
                vec![
                    Column::new("customer", ColumnType::String),
                    Column::new("amount", ColumnType::Integer),
                ],
                vec![
                    vec![Some(Value::String("acme".into())), Some(Value::Integer(5))],
                    vec![Some(Value::String("acme".into())), Some(Value::Integer(7))],
                    vec![Some(Value::String("zeta".into())), None],
                ],
            )
            .unwrap(),
        );
        collection
    }

    type Outcome = (Result<(), AttemptError>, Vec<String>, AuditLedger);

    fn run(collection: &mut DatasetCollection, source: &str) -> Outcome {
        let config = EngineConfig::default();
        let statements = crate::sandbox::payload::parse(source).unwrap();
        let mut interpreter =
            Interpreter::new(collection, &config, None, None, AuditLedger::default());
        let result = interpreter.run(&statements);
        let (log, _, ledger) = interpreter.finish();
        (result, log, ledger)
    }

    #[test]
    fn measures_bind_scalars() {
        let mut collection = datasets();
        let (result, log, _) = run(
            &mut collection,
            "measure total = sum orders amount\nmeasure n = rows orders\nmeasure gaps = nulls orders amount\nprint total / n\nprint gaps",
        );
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(log, vec!["4", "1"]);
    }

    #[test]
    fn overflowing_sum_is_a_runtime_error() {
        let mut collection = datasets();
        let (result, _, _) = run(
            &mut collection,
            "let huge = \"79228162514264337593543950335\"\nderive orders big = huge\nmeasure total = sum orders big",
        );
        match result {
            Err(AttemptError::Runtime { line, message, .. }) => {
                assert_eq!(line, 3);
                assert!(message.contains("overflowed"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fill_only_touches_nulls() {
        let mut collection = datasets();
        let (result, _, ledger) = run(&mut collection, "fill orders amount with 0");
        assert!(result.is_ok(), "{result:?}");
        let orders = collection.require("orders").unwrap();
        assert_eq!(orders.cell(2, 1), Some(&Value::Integer(0)));
        assert_eq!(orders.cell(0, 1), Some(&Value::Integer(5)));
        assert_eq!(ledger.entries()[0].affected_rows, 1);
    }

    #[test]
    fn second_result_is_an_error() {
        let mut collection = datasets();
        let (result, _, _) = run(&mut collection, "result orders\nresult orders");
        match result {
            Err(AttemptError::Runtime { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reload_restores_snapshot_but_not_for_derived_tables() {
        let mut collection = datasets();
        let (result, _, _) = run(
            &mut collection,
            "drop orders where customer == \"acme\"\nreload orders",
        );
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(collection.require("orders").unwrap().row_count(), 3);

        let (result, _, _) = run(&mut collection, "copy orders to scratch\nreload scratch");
        assert!(matches!(result, Err(AttemptError::Runtime { line: 2, .. })));
    }

    #[test]
    fn aggregate_and_assert() {
        let mut collection = datasets();
        let (result, _, _) = run(
            &mut collection,
            "aggregate orders by customer sum amount into totals\nmeasure groups = rows totals\nassert groups == 2 else \"expected two customers\"",
        );
        assert!(result.is_ok(), "{result:?}");
        let totals = collection.require("totals").unwrap();
        assert_eq!(totals.cell(0, 1), Some(&Value::Float(12.0)));
    }

    #[test]
    fn failed_assert_carries_message() {
        let mut collection = datasets();
        let (result, _, _) = run(&mut collection, "assert 1 > 2 else \"numbers are broken\"");
        match result {
            Err(AttemptError::Runtime { message, .. }) => assert_eq!(message, "numbers are broken"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
