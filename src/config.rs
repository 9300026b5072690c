use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::yaml_provider;

/// Engine tuning knobs. Every section falls back to its defaults when it is
/// missing from the YAML file, so a config only has to name what it changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub orchestration: OrchestrationConfig,
    pub matching: MatchingConfig,
    pub sandbox: SandboxConfig,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Consecutive failed attempts tolerated before the turn aborts.
    pub retry_threshold: u32,
    /// Decision visits allowed in one turn.
    pub max_decisions: u32,
    /// Trailing history messages shown to the decision service.
    pub history_window: usize,
    pub completion_marker: String,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        OrchestrationConfig {
            retry_threshold: 3,
            max_decisions: 10,
            history_window: 2,
            completion_marker: "WORKER_DONE".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub lexical_threshold: f64,
    pub top_k: usize,
    pub semantic_floor: f32,
    /// Targets at or under this count skip vector narrowing entirely.
    pub full_list_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig {
            lexical_threshold: 90.0,
            top_k: 5,
            semantic_floor: 0.1,
            full_list_limit: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_statements: usize,
    pub exclusion_sample_rows: usize,
    pub preview_rows: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            max_statements: 500,
            exclusion_sample_rows: 100,
            preview_rows: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Tolerance used when a `reconcile` statement or command names none.
    pub default_tolerance: f64,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        yaml_provider::load_from_path(path)
            .with_context(|| format!("Loading engine configuration from {path:?}"))
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
