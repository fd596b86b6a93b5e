//! Verifier: checks the executed subtask's output against its verification
//! conditions and records the issues on failure.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::chat::BotChat;
use crate::outputs;

use super::base::{schema_string, ChatAgent, CombinedReply, OutputFormat, SchemaSpec};
use super::{AgentContext, AgentState};

const PROMPT_ROLE: &str = "\
You are a data quality inspector who verifies the correctness of a \
subtask's output and result.";

const PROMPT_RULES: &str = "\
- Compare the subtask prompt's expected output with the actual result along:
  1. data completeness (no missing values, plausible volumes),
  2. logical consistency (e.g. growth rates computed correctly).
- Output the verdict and, on failure, a concrete issue list so the subtask \
can be replanned.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskVerifyState {
    Passed,
    Failed,
}

/// Structured verifier reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskVerifyOutput {
    /// The verification verdict.
    pub state: TaskVerifyState,
    /// Issues found; required and non-empty when the verdict is `failed`.
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug)]
pub struct TaskVerifyAgent {
    context: AgentContext,
    chat: BotChat,
}

impl TaskVerifyAgent {
    pub fn new(context: AgentContext, chat: BotChat) -> TaskVerifyAgent {
        TaskVerifyAgent { context, chat }
    }
}

#[async_trait]
impl ChatAgent for TaskVerifyAgent {
    fn name(&self) -> &'static str {
        "TaskVerifyAgent"
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
        "Output the verification result as required:".to_string()
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn output_json_schema(&self) -> Option<SchemaSpec> {
        Some(SchemaSpec {
            schema: schema_string::<TaskVerifyOutput>(),
            example: serde_json::to_string_pretty(&json!({
                "state": "passed",
                "issues": [],
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
                "verify_prompt": task.agent_data.verify_prompt,
            })
        })
    }

    fn validate_reply(&self, value: &Value) -> bool {
        match serde_json::from_value::<TaskVerifyOutput>(value.clone()) {
            Ok(reply) => reply.state == TaskVerifyState::Passed || !reply.issues.is_empty(),
            Err(_) => false,
        }
    }

    async fn on_reply(&mut self, reply: CombinedReply) -> anyhow::Result<(bool, AgentState)> {
        let CombinedReply::Json(value) = reply else {
            anyhow::bail!("verify reply is not a JSON object");
        };
        let reply: TaskVerifyOutput = serde_json::from_value(value)?;
        match reply.state {
            TaskVerifyState::Passed => {
                outputs::output_markdown("### Verification passed");
                self.context
                    .with_task(|task| task.agent_data.issue = String::new());
                Ok((false, AgentState::Named("passed".to_string())))
            }
            TaskVerifyState::Failed => {
                let issue_list: String = reply
                    .issues
                    .iter()
                    .map(|issue| format!("- {issue}\n"))
                    .collect();
                outputs::output_markdown(&format!("### Verification failed\n\n{issue_list}"));
                self.context
                    .with_task(|task| task.agent_data.issue = issue_list);
                Ok((true, AgentState::Named("failed".to_string())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;
    use crate::agents::ChatAgent;

    fn verifier() -> TaskVerifyAgent {
        let (factory, _runtime) = test_factory("-s verifying", "");
        TaskVerifyAgent::new(factory.context.clone(), BotChat::default())
    }

    #[tokio::test]
    async fn test_pass_clears_issue() {
        let mut agent = verifier();
        agent
            .context
            .with_task(|task| task.agent_data.issue = "- stale issue\n".to_string());
        let (failed, state) = agent
            .on_reply(CombinedReply::Json(json!({"state": "passed"})))
            .await
            .unwrap();
        assert!(!failed);
        assert_eq!(state, AgentState::Named("passed".to_string()));
        agent
            .context
            .with_task(|task| assert_eq!(task.agent_data.issue, ""));
    }

    #[tokio::test]
    async fn test_failure_records_issue_list() {
        let mut agent = verifier();
        let (failed, state) = agent
            .on_reply(CombinedReply::Json(json!({
                "state": "failed",
                "issues": ["row count missing", "growth rate out of range"],
            })))
            .await
            .unwrap();
        assert!(failed);
        assert_eq!(state, AgentState::Named("failed".to_string()));
        agent.context.with_task(|task| {
            assert!(task.agent_data.issue.contains("- row count missing"));
            assert!(task.agent_data.issue.contains("- growth rate out of range"));
        });
    }

    #[test]
    fn test_failed_verdict_requires_issues() {
        let agent = verifier();
        assert!(!agent.validate_reply(&json!({"state": "failed", "issues": []})));
        assert!(agent.validate_reply(&json!({"state": "failed", "issues": ["x"]})));
    }
}
