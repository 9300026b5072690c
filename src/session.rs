use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    audit::AuditLedger,
    dataset::{Dataset, DatasetCollection},
    sandbox::{Chart, ExecutionOutput},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Executor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
            Role::Executor => f.write_str("executor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// One user's working state. Sessions never share datasets, history or
/// outputs with each other.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    datasets: DatasetCollection,
    history: Vec<Message>,
    error_count: u32,
    charts: Vec<Chart>,
    pending_result: Option<Dataset>,
    pending_audit: Option<AuditLedger>,
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Session {
            id: Uuid::new_v4(),
            datasets: DatasetCollection::new(),
            history: Vec::new(),
            error_count: 0,
            charts: Vec::new(),
            pending_result: None,
            pending_audit: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Registers a freshly loaded dataset together with its snapshot.
    pub fn ingest(&mut self, dataset: Dataset) {
        self.datasets.ingest(dataset);
    }

    pub fn reload(&mut self, name: &str) -> Result<usize> {
        self.datasets.reload(name)
    }

    pub fn datasets(&self) -> &DatasetCollection {
        &self.datasets
    }

    pub(crate) fn datasets_mut(&mut self) -> &mut DatasetCollection {
        &mut self.datasets
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn push_message(&mut self, role: Role, content: impl Into<String>) {
        self.history.push(Message {
            role,
            content: content.into(),
        });
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub(crate) fn reset_errors(&mut self) {
        self.error_count = 0;
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.error_count += 1;
        self.error_count
    }

    /// Folds a committed attempt's outputs into the session.
    pub(crate) fn record_success(&mut self, output: ExecutionOutput, ledger: AuditLedger) {
        self.error_count = 0;
        self.charts.extend(output.charts);
        if let Some(result) = output.result {
            self.pending_result = Some(result);
        }
        match self.pending_audit.as_mut() {
            Some(pending) => pending.absorb(ledger),
            None if !ledger.is_empty() => self.pending_audit = Some(ledger),
            None => {}
        }
    }

    pub fn charts(&self) -> &[Chart] {
        &self.charts
    }

    pub fn take_result(&mut self) -> Option<Dataset> {
        self.pending_result.take()
    }

    pub fn take_audit(&mut self) -> Option<AuditLedger> {
        self.pending_audit.take()
    }

    /// Schema and preview of every dataset, as handed to the code generator.
    pub fn schema_summary(&self, preview_rows: usize) -> String {
        self.datasets
            .iter()
            .map(|dataset| dataset.describe(preview_rows))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
