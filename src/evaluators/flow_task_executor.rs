//! Scores a finished subtask-executor flow along seven dimensions.

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
You are a rigorous execution assessor who scores a finished subtask along \
several structured dimensions, closing the quality loop over the whole task \
chain.";

const PROMPT_RULES: &str = "\
Score the finished subtask along these dimensions (each in [0, 1]; at least \
0.5 means acceptable):

| dimension | meaning |
| --- | --- |
| is_correct | did the subtask reach its goal |
| correct_score | how well the output matches the goal |
| planning_score | was the subtask goal clear and consistent with the global plan |
| reasoning_score | was the reasoning sound, without jumps or conflicts |
| coding_score | did the code implement the plan without defects or bloat |
| important_info_score | were earlier important infos used completely and accurately |
| user_supply_info_score | were user-supplied infos used without omission or conflict |

Give short feedback for each score.";

/// Structured subtask verdict.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskExecutorVerdict {
    pub is_correct: bool,
    pub correct_score: f64,
    #[serde(default)]
    pub correct_score_feedback: String,
    pub planning_score: f64,
    #[serde(default)]
    pub planning_score_feedback: String,
    pub reasoning_score: f64,
    #[serde(default)]
    pub reasoning_score_feedback: String,
    pub coding_score: f64,
    #[serde(default)]
    pub coding_score_feedback: String,
    pub important_info_score: f64,
    #[serde(default)]
    pub important_info_score_feedback: String,
    pub user_supply_info_score: f64,
    #[serde(default)]
    pub user_supply_info_score_feedback: String,
}

#[derive(Debug)]
pub struct FlowTaskExecutorEvaluator {
    context: AgentContext,
    chat: BotChat,
    record: Option<EvaluationRecord>,
}

impl FlowTaskExecutorEvaluator {
    pub fn new(context: AgentContext, chat: BotChat) -> FlowTaskExecutorEvaluator {
        FlowTaskExecutorEvaluator {
            context,
            chat,
            record: None,
        }
    }
}

#[async_trait]
impl ChatAgent for FlowTaskExecutorEvaluator {
    fn name(&self) -> &'static str {
        "flow_task_executor"
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
        "Output the subtask assessment as required:".to_string()
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn display_reply(&self) -> bool {
        false
    }

    fn output_json_schema(&self) -> Option<SchemaSpec> {
        Some(SchemaSpec {
            schema: schema_string::<TaskExecutorVerdict>(),
            example: serde_json::to_string_pretty(&json!({
                "is_correct": true,
                "correct_score": 0.9,
                "planning_score": 0.8,
                "reasoning_score": 0.9,
                "coding_score": 0.8,
                "important_info_score": 1.0,
                "user_supply_info_score": 1.0,
            }))
            .unwrap_or_default(),
        })
    }

    fn task_data(&self) -> Value {
        self.context.with_task(|task| {
            json!({
                "task_id": task.agent_data.task_id,
                "subject": task.agent_data.subject,
                "coding_prompt": task.agent_data.coding_prompt,
                "summary_prompt": task.agent_data.summary_prompt,
                "source": task.cell_code,
                "output": task.combined_output(),
                "result": task.agent_data.result,
            })
        })
    }

    fn validate_reply(&self, value: &Value) -> bool {
        serde_json::from_value::<TaskExecutorVerdict>(value.clone()).is_ok()
    }

    async fn on_reply(&mut self, reply: CombinedReply) -> anyhow::Result<(bool, AgentState)> {
        let CombinedReply::Json(value) = reply else {
            anyhow::bail!("evaluator reply is not a JSON object");
        };
        display_verdict(&value);
        let verdict: TaskExecutorVerdict = serde_json::from_value(value)?;
        self.record = Some(EvaluationRecord {
            is_success: verdict.is_correct,
            correct_score: verdict.correct_score,
            planning_score: verdict.planning_score,
            reasoning_score: verdict.reasoning_score,
            coding_score: verdict.coding_score,
            important_score: verdict.important_info_score,
            user_supply_score: verdict.user_supply_info_score,
            ..EvaluationRecord::flow("", "flow_task_executor")
        });
        Ok((false, AgentState::Finished))
    }
}

#[async_trait]
impl Evaluator for FlowTaskExecutorEvaluator {
    fn name(&self) -> &'static str {
        "flow_task_executor"
    }

    async fn evaluate(&mut self) -> anyhow::Result<EvaluationRecord> {
        run_evaluation(self, |agent| agent.record.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;

    #[tokio::test]
    async fn test_sub_scores_land_on_record() {
        let (factory, _runtime) = test_factory("-s completed", "");
        let mut evaluator =
            FlowTaskExecutorEvaluator::new(factory.context.clone(), BotChat::default());
        evaluator
            .on_reply(CombinedReply::Json(json!({
                "is_correct": true,
                "correct_score": 0.9,
                "planning_score": 0.7,
                "reasoning_score": 0.8,
                "coding_score": 0.6,
                "important_info_score": 1.0,
                "user_supply_info_score": 0.5,
            })))
            .await
            .unwrap();
        let record = evaluator.record.unwrap();
        assert!((record.planning_score - 0.7).abs() < f64::EPSILON);
        assert!((record.coding_score - 0.6).abs() < f64::EPSILON);
        assert!((record.user_supply_score - 0.5).abs() < f64::EPSILON);
    }
}
