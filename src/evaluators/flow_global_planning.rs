//! Scores a finished global-planning flow.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agents::base::{schema_string, ChatAgent, CombinedReply, OutputFormat, SchemaSpec};
use crate::agents::{AgentContext, AgentState};
use crate::chat::BotChat;
use crate::evaluation::EvaluationRecord;

use super::base::{display_verdict, run_evaluation};
use super::Evaluator;

const PROMPT_ROLE: &str = "\
You are a planning quality assessor who scores notebook task plans.";

const PROMPT_RULES: &str = "\
Assess the produced global plan against the user's goal:

1. Judge whether the plan is consistent with the goal (structure, order and
   content match the intent).
2. Score the plan quality from 0 to 1, one decimal:
   - 0.90-1.00 highly reasonable, consistent, complete;
   - 0.70-0.89 reasonable with minor flaws;
   - 0.50-0.69 basically reasonable but with clear gaps;
   - below 0.50 inadequate, needs a rewrite.
3. Give structured feedback: logic errors, redundant or misordered steps,
   missing prerequisites, unclear wording.";

/// Structured planning verdict.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GlobalPlanningVerdict {
    /// Whether the plan matches the user's goal.
    pub is_correct: bool,
    /// Plan quality in [0, 1]; at least 0.5 means acceptable.
    pub quality_score: f64,
    /// Actionable assessment feedback.
    pub feedback: String,
}

#[derive(Debug)]
pub struct FlowGlobalPlanningEvaluator {
    context: AgentContext,
    chat: BotChat,
    record: Option<EvaluationRecord>,
}

impl FlowGlobalPlanningEvaluator {
    pub fn new(context: AgentContext, chat: BotChat) -> FlowGlobalPlanningEvaluator {
        FlowGlobalPlanningEvaluator {
            context,
            chat,
            record: None,
        }
    }
}

#[async_trait]
impl ChatAgent for FlowGlobalPlanningEvaluator {
    fn name(&self) -> &'static str {
        "flow_global_planning"
    }

    fn context(&self) -> &AgentContext {
        &self.context
    }

    fn chat_client(&self) -> &BotChat {
        &self.chat
    }

    fn prompt_role(&self) -> String {
        PROMPT_ROLE.to_string()
    }

    fn prompt_rules(&self) -> String {
        PROMPT_RULES.to_string()
    }

    fn prompt_trigger(&self) -> String {
        "Output the plan assessment as required:".to_string()
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn display_reply(&self) -> bool {
        false
    }

    fn output_json_schema(&self) -> Option<SchemaSpec> {
        Some(SchemaSpec {
            schema: schema_string::<GlobalPlanningVerdict>(),
            example: serde_json::to_string_pretty(&json!({
                "is_correct": true,
                "quality_score": 0.8,
                "feedback": "The plan matches the goal, but step 3 lacks inputs.",
            }))
            .unwrap_or_default(),
        })
    }

    fn task_data(&self) -> Value {
        self.context.with_task(|task| {
            json!({
                "goal": task.cell_code,
                "plan": task.agent_data.result,
            })
        })
    }

    fn validate_reply(&self, value: &Value) -> bool {
        serde_json::from_value::<GlobalPlanningVerdict>(value.clone()).is_ok()
    }

    async fn on_reply(&mut self, reply: CombinedReply) -> anyhow::Result<(bool, AgentState)> {
        let CombinedReply::Json(value) = reply else {
            anyhow::bail!("evaluator reply is not a JSON object");
        };
        display_verdict(&value);
        let verdict: GlobalPlanningVerdict = serde_json::from_value(value)?;
        self.record = Some(EvaluationRecord {
            is_success: verdict.is_correct,
            correct_score: verdict.quality_score,
            ..EvaluationRecord::flow("", "flow_global_planning")
        });
        Ok((false, AgentState::Finished))
    }
}

#[async_trait]
impl Evaluator for FlowGlobalPlanningEvaluator {
    fn name(&self) -> &'static str {
        "flow_global_planning"
    }

    async fn evaluate(&mut self) -> anyhow::Result<EvaluationRecord> {
        run_evaluation(self, |agent| agent.record.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;
    use crate::evaluation::EvalType;

    #[tokio::test]
    async fn test_verdict_becomes_flow_record() {
        let (factory, _runtime) = test_factory("-P", "Analyse monthly sales.");
        let mut evaluator =
            FlowGlobalPlanningEvaluator::new(factory.context.clone(), BotChat::default());
        evaluator
            .on_reply(CombinedReply::Json(json!({
                "is_correct": true,
                "quality_score": 0.9,
                "feedback": "solid",
            })))
            .await
            .unwrap();
        let record = evaluator.record.unwrap();
        assert_eq!(record.eval_type, EvalType::Flow);
        assert_eq!(record.evaluator, "flow_global_planning");
        assert!(record.is_success);
        assert!((record.correct_score - 0.9).abs() < f64::EPSILON);
    }
}
