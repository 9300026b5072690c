//! Turn-level state machine: decide, generate, execute, evaluate, retry.
//!
//! Termination is bounded twice over: failed attempts past the retry
//! threshold abort the turn, and more than `max_decisions` visits to the
//! decision state end it with [`TurnStatus::IterationLimit`].

use std::{fmt, sync::OnceLock};

use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    config::EngineConfig,
    sandbox::{Sandbox, TransformationAttempt, clean_payload},
    services::{CodeGenerator, DecisionRequest, DecisionService, GenerationMode, GenerationRequest},
    session::{Role, Session},
};

pub const FALLBACK_REPLY: &str =
    "Sorry, I could not work out how to handle that request. Please rephrase it.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TurnState {
    Deciding,
    Replying,
    Proceeding,
    Generating,
    Executing,
    Evaluating,
    End,
    Aborted,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Replied,
    Aborted,
    IterationLimit,
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TurnStatus::Completed => "completed",
            TurnStatus::Replied => "replied",
            TurnStatus::Aborted => "aborted",
            TurnStatus::IterationLimit => "iteration limit",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub status: TurnStatus,
    pub replies: Vec<String>,
    pub attempts: Vec<TransformationAttempt>,
    pub transitions: Vec<TurnState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    DataOperation,
    NonDataReply(String),
    End,
}

#[derive(Deserialize)]
struct RawDecision {
    decision: String,
    #[serde(default)]
    reason: String,
}

/// Reads a decision out of free text. Fences and surrounding prose are
/// tolerated; anything else yields `None`.
pub fn parse_decision(text: &str) -> Option<Decision> {
    static OBJECT: OnceLock<Option<Regex>> = OnceLock::new();
    let object = OBJECT.get_or_init(|| Regex::new(r"(?s)\{.*\}").ok());
    let cleaned = clean_payload(text);
    let json = object.as_ref()?.find(&cleaned)?.as_str();
    let raw: RawDecision = serde_json::from_str(json).ok()?;
    match raw.decision.trim().to_ascii_lowercase().as_str() {
        "data_operation" => Some(Decision::DataOperation),
        "non_data_reply" => Some(Decision::NonDataReply(raw.reason)),
        "end" => Some(Decision::End),
        _ => None,
    }
}

pub struct Orchestrator<'a> {
    decider: &'a dyn DecisionService,
    generator: &'a dyn CodeGenerator,
    sandbox: Sandbox<'a>,
}

enum Next {
    Decide,
    Generate { previous_error: Option<String> },
    Finish(TurnStatus),
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        decider: &'a dyn DecisionService,
        generator: &'a dyn CodeGenerator,
        sandbox: Sandbox<'a>,
    ) -> Self {
        Orchestrator {
            decider,
            generator,
            sandbox,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.sandbox.config()
    }

    /// Drives one instruction to a terminal state. Service failures never
    /// escape: they become fallback replies or empty payloads.
    pub fn run_turn(&self, session: &mut Session, instruction: &str) -> TurnReport {
        let config = &self.config().orchestration;
        let instruction = instruction.trim();
        let overview = instruction.is_empty() && session.history().is_empty();
        if !instruction.is_empty() {
            session.push_message(Role::User, instruction);
        }
        session.reset_errors();
        info!("Session {} turn started: {:?}", session.id(), instruction);

        let mut report = TurnReport {
            status: TurnStatus::Completed,
            replies: Vec::new(),
            attempts: Vec::new(),
            transitions: Vec::new(),
        };
        let mut decisions = 0u32;
        let mut next = Next::Decide;
        let mut mode = GenerationMode::Instruction;

        loop {
            match next {
                Next::Decide => {
                    report.transitions.push(TurnState::Deciding);
                    decisions += 1;
                    if decisions > config.max_decisions {
                        warn!("Decision limit of {} reached", config.max_decisions);
                        next = Next::Finish(TurnStatus::IterationLimit);
                        continue;
                    }
                    let decision = if overview && decisions == 1 {
                        mode = GenerationMode::Overview;
                        Decision::DataOperation
                    } else {
                        self.decide(session, instruction)
                    };
                    debug!("Decision: {decision:?}");
                    match decision {
                        Decision::DataOperation => {
                            report.transitions.push(TurnState::Proceeding);
                            next = Next::Generate {
                                previous_error: None,
                            };
                        }
                        Decision::NonDataReply(reason) => {
                            report.transitions.push(TurnState::Replying);
                            session.push_message(Role::Assistant, reason.clone());
                            report.replies.push(reason);
                            next = Next::Finish(TurnStatus::Replied);
                        }
                        Decision::End => next = Next::Finish(TurnStatus::Completed),
                    }
                }
                Next::Generate { previous_error } => {
                    report.transitions.push(TurnState::Generating);
                    let request = GenerationRequest {
                        instruction: instruction.to_string(),
                        mode,
                        schema: session.schema_summary(self.config().sandbox.preview_rows),
                        previous_error,
                    };
                    let payload = self.generator.generate(&request).unwrap_or_else(|err| {
                        warn!("Code generation failed: {err:#}");
                        String::new()
                    });

                    report.transitions.push(TurnState::Executing);
                    let attempt = self.sandbox.execute(session.datasets_mut(), &payload);
                    report.transitions.push(TurnState::Evaluating);

                    next = self.evaluate(session, &attempt);
                    report.attempts.push(attempt);
                }
                Next::Finish(status) => {
                    report.transitions.push(match status {
                        TurnStatus::Aborted => TurnState::Aborted,
                        _ => TurnState::End,
                    });
                    report.status = status;
                    break;
                }
            }
        }

        info!(
            "Session {} turn finished: {} after {} attempt(s)",
            session.id(),
            report.status,
            report.attempts.len()
        );
        report
    }

    fn decide(&self, session: &Session, instruction: &str) -> Decision {
        let window = self.config().orchestration.history_window;
        let history = session.history();
        let request = DecisionRequest {
            instruction: instruction.to_string(),
            history: history[history.len().saturating_sub(window)..].to_vec(),
            datasets: session.datasets().names(),
        };
        match self.decider.decide(&request) {
            Ok(text) => parse_decision(&text).unwrap_or_else(|| {
                warn!("Unusable decision reply: {text:?}");
                Decision::NonDataReply(FALLBACK_REPLY.to_string())
            }),
            Err(err) => {
                warn!("Decision service failed: {err:#}");
                Decision::NonDataReply(FALLBACK_REPLY.to_string())
            }
        }
    }

    /// Applies an attempt to the session and picks the next step.
    fn evaluate(&self, session: &mut Session, attempt: &TransformationAttempt) -> Next {
        let threshold = self.config().orchestration.retry_threshold;
        match &attempt.error {
            None => {
                session.push_message(Role::Executor, format!("success: {}", attempt.log_text()));
                session.record_success(attempt.output.clone(), attempt.ledger.clone());
                if attempt.output.completed {
                    Next::Finish(TurnStatus::Completed)
                } else {
                    Next::Decide
                }
            }
            Some(err) => {
                let failures = session.record_failure();
                let context = failure_context(attempt, &err.to_string());
                session.push_message(Role::Executor, format!("error: {context}"));
                if failures > threshold {
                    warn!("Giving up after {failures} failed attempt(s)");
                    Next::Finish(TurnStatus::Aborted)
                } else {
                    debug!("Attempt {failures} failed, retrying");
                    Next::Generate {
                        previous_error: Some(context),
                    }
                }
            }
        }
    }
}

fn failure_context(attempt: &TransformationAttempt, error: &str) -> String {
    if attempt.log.is_empty() {
        error.to_string()
    } else {
        format!("{error}\nOutput before the failure:\n{}", attempt.log_text())
    }
}
