//! Shared plumbing for chat-backed evaluators.
//!
//! A chat evaluator is a JSON-format chat agent whose `on_reply` stores a
//! scored record instead of mutating the task; `run_evaluation` drives the
//! chat round-trip and hands the record back.

use crate::agents::base::run_chat_agent;
use crate::agents::ChatAgent;
use crate::evaluation::EvaluationRecord;
use crate::outputs;

/// Render an evaluator's structured verdict into the sink.
pub fn display_verdict(value: &serde_json::Value) {
    outputs::output_block(
        &serde_json::to_string_pretty(value).unwrap_or_default(),
        "Evaluator Reply",
        true,
        "code",
        "json",
    );
}

/// Drive a chat evaluator and return the record its `on_reply` captured in
/// `slot`.
pub async fn run_evaluation<A: ChatAgent>(
    agent: &mut A,
    slot: impl Fn(&A) -> Option<EvaluationRecord>,
) -> anyhow::Result<EvaluationRecord> {
    run_chat_agent(agent).await?;
    slot(agent).ok_or_else(|| anyhow::anyhow!("evaluator {} produced no record", agent.name()))
}
