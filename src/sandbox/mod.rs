//! Atomic execution of proposed transformations.
//!
//! A payload is cleaned, parsed and validated before anything runs. It then
//! executes against a clone of the dataset collection; the clone replaces
//! the caller's collection only when every statement succeeded. Failures of
//! any kind, panics included, come back as a failed
//! [`TransformationAttempt`] and never propagate.

pub mod chart;
pub mod interp;
pub mod payload;

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    audit::AuditLedger,
    config::EngineConfig,
    dataset::{Dataset, DatasetCollection},
    semantic::{Embedder, MatchJudge},
};

pub use chart::Chart;
pub use payload::{PayloadError, Statement, StatementKind, clean_payload};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum AttemptError {
    /// The payload was rejected before execution.
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Line {line} `{statement}` failed: {message}")]
    Runtime {
        line: usize,
        statement: String,
        message: String,
    },
}

impl From<PayloadError> for AttemptError {
    fn from(err: PayloadError) -> Self {
        AttemptError::Validation(err.to_string())
    }
}

/// What a successful payload declared through `result`, `chart` and `done`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionOutput {
    pub result: Option<Dataset>,
    pub charts: Vec<Chart>,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformationAttempt {
    pub payload: String,
    /// SHA-256 of the cleaned payload, hex encoded.
    pub fingerprint: String,
    pub log: Vec<String>,
    pub output: ExecutionOutput,
    pub ledger: AuditLedger,
    pub error: Option<AttemptError>,
}

impl TransformationAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn log_text(&self) -> String {
        self.log.join("\n")
    }
}

pub fn fingerprint(payload: &str) -> String {
    Sha256::digest(payload.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

pub struct Sandbox<'a> {
    config: EngineConfig,
    embedder: Option<&'a dyn Embedder>,
    judge: Option<&'a dyn MatchJudge>,
}

impl<'a> Sandbox<'a> {
    pub fn new(config: EngineConfig) -> Self {
        Sandbox {
            config,
            embedder: None,
            judge: None,
        }
    }

    pub fn with_embedder(mut self, embedder: &'a dyn Embedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_judge(mut self, judge: &'a dyn MatchJudge) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn execute(&self, datasets: &mut DatasetCollection, raw_payload: &str) -> TransformationAttempt {
        let payload = clean_payload(raw_payload);
        let mut attempt = TransformationAttempt {
            fingerprint: fingerprint(&payload),
            payload,
            log: Vec::new(),
            output: ExecutionOutput::default(),
            ledger: AuditLedger::new(self.config.sandbox.exclusion_sample_rows),
            error: None,
        };

        let statements = match self.validate(&attempt.payload) {
            Ok(statements) => statements,
            Err(err) => {
                warn!("Rejected payload {}: {err}", short(&attempt.fingerprint));
                attempt.error = Some(err);
                return attempt;
            }
        };
        debug!(
            "Executing payload {} ({} statement(s))",
            short(&attempt.fingerprint),
            statements.len()
        );

        let mut working = datasets.clone();
        let mut interpreter = interp::Interpreter::new(
            &mut working,
            &self.config,
            self.embedder,
            self.judge,
            attempt.ledger.clone(),
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| interpreter.run(&statements)));
        let outcome = match outcome {
            Ok(result) => result,
            Err(panic) => Err(interpreter.panic_error(panic_message(panic.as_ref()))),
        };
        let (log, output, ledger) = interpreter.finish();
        attempt.log = log;
        attempt.ledger = ledger;

        match outcome {
            Ok(()) => {
                attempt.output = output;
                *datasets = working;
                info!(
                    "Payload {} committed: {} audit entr(ies), {} chart(s){}",
                    short(&attempt.fingerprint),
                    attempt.ledger.len(),
                    attempt.output.charts.len(),
                    if attempt.output.completed { ", completed" } else { "" }
                );
            }
            Err(err) => {
                warn!("Payload {} failed: {err}", short(&attempt.fingerprint));
                attempt.error = Some(err);
            }
        }
        attempt
    }

    fn validate(&self, payload: &str) -> Result<Vec<Statement>, AttemptError> {
        let statements = payload::parse(payload)?;
        let limit = self.config.sandbox.max_statements;
        if statements.len() > limit {
            return Err(PayloadError::TooLong {
                count: statements.len(),
                limit,
            }
            .into());
        }
        Ok(statements)
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "interpreter panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::Value,
        dataset::{Column, Dataset},
        schema::ColumnType,
    };

    fn collection() -> DatasetCollection {
        let mut datasets = DatasetCollection::new();
        datasets.ingest(
            Dataset::from_rows(
                "sales",
                vec![
                    Column::new("region", ColumnType::String),
                    Column::new("amount", ColumnType::Integer),
                ],
                vec![
                    vec![Some(Value::String("north".into())), Some(Value::Integer(10))],
                    vec![Some(Value::String("south".into())), Some(Value::Integer(-4))],
                ],
            )
            .unwrap(),
        );
        datasets
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn empty_payload_is_a_validation_failure() {
        let sandbox = Sandbox::new(EngineConfig::default());
        let mut datasets = collection();
        let attempt = sandbox.execute(&mut datasets, "```\n```");
        assert!(matches!(attempt.error, Some(AttemptError::Validation(_))));
        assert!(attempt.log.is_empty());
    }

    #[test]
    fn oversized_payload_is_rejected_before_running() {
        let mut config = EngineConfig::default();
        config.sandbox.max_statements = 1;
        let sandbox = Sandbox::new(config);
        let mut datasets = collection();
        let attempt = sandbox.execute(&mut datasets, "drop sales where amount < 0\nprint 1");
        assert!(matches!(attempt.error, Some(AttemptError::Validation(_))));
        assert_eq!(datasets.require("sales").unwrap().row_count(), 2);
    }

    #[test]
    fn failure_leaves_collection_untouched() {
        let sandbox = Sandbox::new(EngineConfig::default());
        let mut datasets = collection();
        let attempt = sandbox.execute(
            &mut datasets,
            "drop sales where amount < 0\nderive sales total = amount * 2\nfail \"stop\"",
        );
        match attempt.error {
            Some(AttemptError::Runtime { line, ref message, .. }) => {
                assert_eq!(line, 3);
                assert!(message.contains("stop"));
            }
            ref other => panic!("unexpected {other:?}"),
        }
        let sales = datasets.require("sales").unwrap();
        assert_eq!(sales.row_count(), 2);
        assert_eq!(sales.column_count(), 2);
        assert!(attempt.output.result.is_none());
    }

    #[test]
    fn success_commits_and_reports_outputs() {
        let sandbox = Sandbox::new(EngineConfig::default());
        let mut datasets = collection();
        let attempt = sandbox.execute(
            &mut datasets,
            "```\ndrop sales where amount < 0 as \"Remove refunds\"\nresult sales\ndone\n```",
        );
        assert!(attempt.succeeded(), "{:?}", attempt.error);
        assert!(attempt.output.completed);
        assert_eq!(attempt.output.result.as_ref().unwrap().row_count(), 1);
        assert_eq!(datasets.require("sales").unwrap().row_count(), 1);
        assert_eq!(attempt.ledger.excluded_rows("sales"), 1);
        assert!(attempt.log.iter().any(|l| l == "WORKER_DONE"));
    }
}
