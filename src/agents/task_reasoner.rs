//! Structured reasoner: derives the subtask conclusion by analysis alone,
//! without running code. Shares the summary reply shape.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::chat::BotChat;

use super::base::{schema_string, ChatAgent, CombinedReply, OutputFormat, SchemaSpec};
use super::task_summary::{apply_summary, TaskSummaryOutput};
use super::{AgentContext, AgentState};

const PROMPT_ROLE: &str = "\
You are a reasoning and information distillation expert who derives key \
conclusions from the data and results already at hand.";

const PROMPT_RULES: &str = "\
- Reason over the existing data and results; do not assume code will run.
- Output a human-readable conclusion containing:
  1. the core findings,
  2. the supporting numbers or observations,
  3. any suggestions for follow-up subtasks.
- Only this conclusion is recorded in the global context; include everything \
later subtasks will need.
- Put structured facts worth carrying forward into `important_infos`.
- If a fact needs the user's confirmation, list a short yes/no question for \
it in `request_confirm_infos`.";

#[derive(Debug)]
pub struct TaskReasoningAgent {
    context: AgentContext,
    chat: BotChat,
}

impl TaskReasoningAgent {
    pub fn new(context: AgentContext, chat: BotChat) -> TaskReasoningAgent {
        TaskReasoningAgent { context, chat }
    }
}

#[async_trait]
impl ChatAgent for TaskReasoningAgent {
    fn name(&self) -> &'static str {
        "TaskReasoningAgent"
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
        "Output the task conclusion as required:".to_string()
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn output_json_schema(&self) -> Option<SchemaSpec> {
        Some(SchemaSpec {
            schema: schema_string::<TaskSummaryOutput>(),
            example: serde_json::to_string_pretty(&json!({
                "summary": "Model A fits the constraint better than model B.",
                "important_infos": {"chosen_model": "A"},
            }))
            .unwrap_or_default(),
        })
    }

    fn task_data(&self) -> Value {
        self.context.with_task(|task| {
            json!({
                "subject": task.agent_data.subject,
                "summary_prompt": task.agent_data.summary_prompt,
            })
        })
    }

    fn validate_reply(&self, value: &Value) -> bool {
        serde_json::from_value::<TaskSummaryOutput>(value.clone())
            .map(|reply| !reply.summary.is_empty())
            .unwrap_or(false)
    }

    async fn on_reply(&mut self, reply: CombinedReply) -> anyhow::Result<(bool, AgentState)> {
        let CombinedReply::Json(value) = reply else {
            anyhow::bail!("reasoning reply is not a JSON object");
        };
        let reply: TaskSummaryOutput = serde_json::from_value(value)?;
        Ok((false, apply_summary(&self.context, &reply)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;

    #[tokio::test]
    async fn test_reasoning_reply_fills_result() {
        let (factory, _runtime) = test_factory("-s reasoning", "");
        let mut agent = TaskReasoningAgent::new(factory.context.clone(), BotChat::default());
        let (_, state) = agent
            .on_reply(CombinedReply::Json(json!({"summary": "A beats B"})))
            .await
            .unwrap();
        assert_eq!(state, AgentState::Named("done".to_string()));
        agent
            .context
            .with_task(|task| assert_eq!(task.agent_data.result, "A beats B"));
    }
}
