//! Structured summariser: distils the executed code's output into a
//! human-readable summary plus structured important infos, optionally
//! flagging facts that need user confirmation.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actions::RequestUserSupplyInfo;
use crate::chat::BotChat;
use crate::outputs::{self, ReplyType};

use super::base::{schema_string, ChatAgent, CombinedReply, OutputFormat, SchemaSpec};
use super::{AgentContext, AgentState};

const PROMPT_ROLE: &str = "\
You are an information distillation expert who extracts the key conclusions \
from analysis results.";

const PROMPT_RULES: &str = "\
- Turn the code execution output into a human-readable summary containing:
  1. a short account of what the code produced,
  2. the core findings (e.g. \"Electronics grew 12% per month\"),
  3. the supporting numbers or charts,
  4. any suggestions for follow-up subtasks.
- Code execution results are not recorded in the global context; only this \
summary is. Include everything later subtasks will need.
- When citing earlier subtasks, especially their important infos, be \
accurate and complete.
- Put structured facts worth carrying forward into `important_infos`; keep \
it structured data only, no code or long prose.
- If a fact needs the user's confirmation, list a short yes/no question for \
it in `request_confirm_infos`.";

/// Structured summary reply, shared with the reasoning agent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskSummaryOutput {
    /// The human-readable summary of the subtask outcome.
    pub summary: String,
    /// Structured facts later subtasks should rely on.
    #[serde(default)]
    pub important_infos: Option<serde_json::Map<String, Value>>,
    /// Facts that need the user's confirmation before they can be trusted.
    #[serde(default)]
    pub request_confirm_infos: Option<Vec<RequestUserSupplyInfo>>,
}

/// Apply a summary reply onto the task; returns the resulting state.
pub(crate) fn apply_summary(context: &AgentContext, reply: &TaskSummaryOutput) -> AgentState {
    outputs::agent_display(
        &format!("### Task summary\n\n{}", reply.summary),
        Some(ReplyType::TaskResult),
        false,
    );
    context.with_task(|task| {
        task.agent_data.result = reply.summary.clone();
        task.agent_data.important_infos = reply.important_infos.clone();
    });
    if let Some(infos) = &reply.important_infos {
        outputs::output_block(
            &serde_json::to_string_pretty(infos).unwrap_or_default(),
            "Important Infos",
            true,
            "code",
            "json",
        );
    }
    match &reply.request_confirm_infos {
        Some(infos) if !infos.is_empty() => {
            context.with_task(|task| {
                task.agent_data.request_below_supply_infos = Some(infos.clone());
            });
            AgentState::Named("request_info".to_string())
        }
        _ => AgentState::Named("done".to_string()),
    }
}

#[derive(Debug)]
pub struct TaskSummaryAgent {
    context: AgentContext,
    chat: BotChat,
}

impl TaskSummaryAgent {
    pub fn new(context: AgentContext, chat: BotChat) -> TaskSummaryAgent {
        TaskSummaryAgent { context, chat }
    }
}

#[async_trait]
impl ChatAgent for TaskSummaryAgent {
    fn name(&self) -> &'static str {
        "TaskSummaryAgent"
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
        "Output the task summary as required:".to_string()
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn output_json_schema(&self) -> Option<SchemaSpec> {
        Some(SchemaSpec {
            schema: schema_string::<TaskSummaryOutput>(),
            example: serde_json::to_string_pretty(&json!({
                "summary": "Loaded 100 rows from data.csv; all twelve months are present.",
                "important_infos": {"row_count": 100},
            }))
            .unwrap_or_default(),
        })
    }

    fn task_data(&self) -> Value {
        self.context.with_task(|task| {
            json!({
                "subject": task.agent_data.subject,
                "coding_prompt": task.agent_data.coding_prompt,
                "source": task.cell_code,
                "output": task.combined_output(),
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
            anyhow::bail!("summary reply is not a JSON object");
        };
        let reply: TaskSummaryOutput = serde_json::from_value(value)?;
        Ok((false, apply_summary(&self.context, &reply)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;
    use crate::agents::ChatAgent;

    fn summariser() -> TaskSummaryAgent {
        let (factory, _runtime) = test_factory("-s summary", "");
        TaskSummaryAgent::new(factory.context.clone(), BotChat::default())
    }

    #[tokio::test]
    async fn test_summary_fills_result_and_infos() {
        let mut agent = summariser();
        let (failed, state) = agent
            .on_reply(CombinedReply::Json(json!({
                "summary": "100 rows loaded",
                "important_infos": {"row_count": 100},
            })))
            .await
            .unwrap();
        assert!(!failed);
        assert_eq!(state, AgentState::Named("done".to_string()));
        agent.context.with_task(|task| {
            assert_eq!(task.agent_data.result, "100 rows loaded");
            let infos = task.agent_data.important_infos.as_ref().unwrap();
            assert_eq!(infos["row_count"], json!(100));
        });
    }

    #[tokio::test]
    async fn test_confirm_infos_request_user_input() {
        let mut agent = summariser();
        let (_, state) = agent
            .on_reply(CombinedReply::Json(json!({
                "summary": "Column names are ambiguous",
                "request_confirm_infos": [{"question": "Is `amt` the net amount?"}],
            })))
            .await
            .unwrap();
        assert_eq!(state, AgentState::Named("request_info".to_string()));
        agent.context.with_task(|task| {
            assert!(task.agent_data.request_below_supply_infos.is_some());
        });
    }

    #[test]
    fn test_empty_summary_fails_validation() {
        let agent = summariser();
        assert!(!agent.validate_reply(&json!({"summary": ""})));
        assert!(agent.validate_reply(&json!({"summary": "ok"})));
    }
}
