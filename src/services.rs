use std::{collections::VecDeque, path::Path, sync::Mutex};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::{session::Message, yaml_provider};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRequest {
    pub instruction: String,
    /// Trailing window of the conversation, oldest first.
    pub history: Vec<Message>,
    pub datasets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// No instruction was given: summarize the loaded data.
    Overview,
    Instruction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub instruction: String,
    pub mode: GenerationMode,
    /// Columns, types and first rows of every dataset.
    pub schema: String,
    /// Failure of the previous attempt when this is a retry.
    pub previous_error: Option<String>,
}

/// Chooses the next step for an instruction. The reply is free text that
/// should contain `{"decision": ..., "reason": ...}`.
pub trait DecisionService {
    fn decide(&self, request: &DecisionRequest) -> Result<String>;
}

/// Proposes a transformation payload.
pub trait CodeGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub payloads: Vec<String>,
}

/// Answers from queues. An exhausted queue is a service error, which the
/// orchestrator treats like any other unavailable service.
#[derive(Debug, Default)]
pub struct ScriptedServices {
    decisions: Mutex<VecDeque<String>>,
    payloads: Mutex<VecDeque<String>>,
    decision_requests: Mutex<Vec<DecisionRequest>>,
    generation_requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedServices {
    pub fn new<D, P>(decisions: D, payloads: P) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        ScriptedServices {
            decisions: Mutex::new(decisions.into_iter().map(Into::into).collect()),
            payloads: Mutex::new(payloads.into_iter().map(Into::into).collect()),
            decision_requests: Mutex::new(Vec::new()),
            generation_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_script(script: Script) -> Self {
        Self::new(script.decisions, script.payloads)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let script: Script = yaml_provider::load_from_path(path)
            .with_context(|| format!("Loading replay script from {path:?}"))?;
        Ok(Self::from_script(script))
    }

    pub fn decision_requests(&self) -> Vec<DecisionRequest> {
        self.decision_requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Every generation request received so far, in order.
    pub fn generation_requests(&self) -> Vec<GenerationRequest> {
        self.generation_requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn next(queue: &Mutex<VecDeque<String>>, what: &str) -> Result<String> {
        queue
            .lock()
            .map_err(|_| anyhow!("Scripted {what} queue is poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("Scripted {what} queue is exhausted"))
    }
}

impl DecisionService for ScriptedServices {
    fn decide(&self, request: &DecisionRequest) -> Result<String> {
        if let Ok(mut requests) = self.decision_requests.lock() {
            requests.push(request.clone());
        }
        Self::next(&self.decisions, "decision")
    }
}

impl CodeGenerator for ScriptedServices {
    fn generate(&self, request: &GenerationRequest) -> Result<String> {
        if let Ok(mut requests) = self.generation_requests.lock() {
            requests.push(request.clone());
        }
        Self::next(&self.payloads, "payload")
    }
}
