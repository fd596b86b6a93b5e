//! Subtask planner: reviews the global plan and the completed subtasks,
//! then either plans the next subtask (coding or pure reasoning), asks the
//! user for missing information, or declares the global goal reached.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actions::RequestUserSupplyInfo;
use crate::chat::BotChat;
use crate::outputs::{self, ReplyType};

use super::base::{schema_string, ChatAgent, CombineReply, CombinedReply, OutputFormat, SchemaSpec};
use super::{AgentContext, AgentState, ModelType};

const PROMPT_ROLE: &str = "\
You are a task planning expert. Given the global goal of a computational \
notebook, you decompose the remaining work into cell-sized subtasks and \
drive them forward one at a time.";

const PROMPT_RULES: &str = "\
- Review the global goal and the results of the completed subtasks. If the \
global goal is already achieved, finish the flow and report the final state.
- Otherwise plan the next subtask:
  - First describe the subtask: its goal, inputs and expected outputs.
  - Then choose how it should be carried out:
    - Direct reasoning: when the goal can be reached by analysis alone \
(comparisons, model design, strategy or report generation). Provide a \
summary prompt only.
    - Code execution plus analysis: when the goal needs code to run (data \
loading, cleaning, statistics, visualisation, complex algorithms). Provide \
both a coding prompt (code type, concrete inputs, expected output variables) \
and a summary prompt (what the analysis must state for later subtasks).
    - If information only the user can supply is missing, ask for it with \
precise questions.
- Code execution results are not recorded in the global context; only \
reasoning and summary results are. Plan accordingly.
- When referencing completed subtasks, especially their important infos, be \
accurate and complete; never invent or distort information the user already \
supplied.";

/// Planner outcome states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskPlannerState {
    CodingPlanned,
    ReasoningPlanned,
    RequestInfo,
    GlobalFinished,
}

impl TaskPlannerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPlannerState::CodingPlanned => "coding_planned",
            TaskPlannerState::ReasoningPlanned => "reasoning_planned",
            TaskPlannerState::RequestInfo => "request_info",
            TaskPlannerState::GlobalFinished => "global_finished",
        }
    }
}

/// Structured planner reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskPlannerOutput {
    /// Planning outcome: `coding_planned` (code + analysis subtask),
    /// `reasoning_planned` (direct reasoning subtask), `request_info`
    /// (user input needed), or `global_finished`.
    pub state: TaskPlannerState,
    /// Globally unique subtask id; required when a subtask was planned.
    #[serde(default)]
    pub subtask_id: String,
    /// Subtask description; required when a subtask was planned.
    #[serde(default)]
    pub subtask_subject: String,
    /// Code-generation prompt; required for `coding_planned`.
    #[serde(default)]
    pub subtask_coding_prompt: String,
    /// Summary prompt; required when a subtask was planned.
    #[serde(default)]
    pub subtask_summary_prompt: String,
    /// Questions for the user; required and non-empty for `request_info`.
    #[serde(default)]
    pub request_supply_infos: Option<Vec<RequestUserSupplyInfo>>,
}

impl TaskPlannerOutput {
    /// Required-when rules per state.
    fn is_complete(&self) -> bool {
        match self.state {
            TaskPlannerState::CodingPlanned => {
                !self.subtask_id.is_empty()
                    && !self.subtask_subject.is_empty()
                    && !self.subtask_coding_prompt.is_empty()
                    && !self.subtask_summary_prompt.is_empty()
            }
            TaskPlannerState::ReasoningPlanned => {
                !self.subtask_id.is_empty()
                    && !self.subtask_subject.is_empty()
                    && !self.subtask_summary_prompt.is_empty()
            }
            TaskPlannerState::RequestInfo => self
                .request_supply_infos
                .as_ref()
                .map(|infos| !infos.is_empty())
                .unwrap_or(false),
            TaskPlannerState::GlobalFinished => true,
        }
    }
}

#[derive(Debug)]
pub struct TaskPlannerAgent {
    context: AgentContext,
    chat: BotChat,
}

impl TaskPlannerAgent {
    pub fn new(context: AgentContext, chat: BotChat) -> TaskPlannerAgent {
        TaskPlannerAgent { context, chat }
    }

    fn is_replanning(&self) -> bool {
        self.context.with_task(|task| {
            !task.agent_data.subject.is_empty() && !task.agent_data.issue.is_empty()
        })
    }
}

#[async_trait]
impl ChatAgent for TaskPlannerAgent {
    fn name(&self) -> &'static str {
        "TaskPlannerAgent"
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
        if self.is_replanning() {
            "The current subtask failed verification; replan it using the information above:".to_string()
        } else {
            "Plan the next subtask as required:".to_string()
        }
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn combine_reply(&self) -> CombineReply {
        CombineReply::Merge
    }

    fn output_json_schema(&self) -> Option<SchemaSpec> {
        Some(SchemaSpec {
            schema: schema_string::<TaskPlannerOutput>(),
            example: serde_json::to_string_pretty(&json!({
                "state": "coding_planned",
                "subtask_id": "task-1",
                "subtask_subject": "Load and preview the sales data",
                "subtask_coding_prompt": "Read data.csv into df and print its shape",
                "subtask_summary_prompt": "State the row count and column names",
            }))
            .unwrap_or_default(),
        })
    }

    fn task_data(&self) -> Value {
        if !self.is_replanning() {
            return Value::Null;
        }
        self.context.with_task(|task| {
            json!({
                "cell_idx": task.cell_idx,
                "task_id": task.agent_data.task_id,
                "subject": task.agent_data.subject,
                "issue": task.agent_data.issue,
                "coding_prompt": task.agent_data.coding_prompt,
                "source": task.cell_code,
                "output": task.combined_output(),
            })
        })
    }

    fn validate_reply(&self, value: &Value) -> bool {
        serde_json::from_value::<TaskPlannerOutput>(value.clone())
            .map(|reply| reply.is_complete())
            .unwrap_or(false)
    }

    async fn on_reply(&mut self, reply: CombinedReply) -> anyhow::Result<(bool, AgentState)> {
        let CombinedReply::Json(value) = reply else {
            anyhow::bail!("planner reply is not a JSON object");
        };
        let reply: TaskPlannerOutput = serde_json::from_value(value)?;

        self.context.with_task(|task| {
            task.agent_data.result = String::new();
            task.agent_data.coding_prompt = String::new();
            task.agent_data.summary_prompt = String::new();
            task.agent_data.important_infos = None;
            task.agent_data.request_above_supply_infos = None;
            task.agent_data.request_below_supply_infos = None;
        });

        match reply.state {
            TaskPlannerState::GlobalFinished => {
                outputs::agent_display(
                    "The global goal is achieved; all tasks are complete.",
                    Some(ReplyType::TaskResult),
                    false,
                );
            }
            TaskPlannerState::RequestInfo => {
                self.context.with_task(|task| {
                    task.agent_data.request_above_supply_infos = reply.request_supply_infos.clone();
                });
            }
            TaskPlannerState::CodingPlanned => {
                outputs::output_markdown(&format!(
                    "### Subtask: {}\n- ID: {}\n- Coding: {}\n- Summary: {}\n",
                    reply.subtask_subject,
                    reply.subtask_id,
                    reply.subtask_coding_prompt,
                    reply.subtask_summary_prompt,
                ));
                self.context.with_task(|task| {
                    task.agent_data.task_id = reply.subtask_id.clone();
                    task.agent_data.subject = reply.subtask_subject.clone();
                    task.agent_data.coding_prompt = reply.subtask_coding_prompt.clone();
                    task.agent_data.summary_prompt = reply.subtask_summary_prompt.clone();
                });
            }
            TaskPlannerState::ReasoningPlanned => {
                outputs::output_markdown(&format!(
                    "### Subtask: {}\n- ID: {}\n- Reasoning: {}\n",
                    reply.subtask_subject, reply.subtask_id, reply.subtask_summary_prompt,
                ));
                self.context.with_task(|task| {
                    task.agent_data.task_id = reply.subtask_id.clone();
                    task.agent_data.subject = reply.subtask_subject.clone();
                    task.agent_data.summary_prompt = reply.subtask_summary_prompt.clone();
                });
            }
        }
        Ok((false, AgentState::Named(reply.state.as_str().to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;
    use crate::agents::ChatAgent;

    fn planner() -> TaskPlannerAgent {
        let (factory, _runtime) = test_factory("-s planning", "body");
        TaskPlannerAgent::new(factory.context.clone(), BotChat::default())
    }

    #[test]
    fn test_validation_requires_fields_per_state() {
        let agent = planner();
        assert!(agent.validate_reply(&json!({
            "state": "coding_planned",
            "subtask_id": "t1",
            "subtask_subject": "load csv",
            "subtask_coding_prompt": "Read data.csv into df",
            "subtask_summary_prompt": "State row count",
        })));
        // Missing coding prompt fails the coding-planned rule.
        assert!(!agent.validate_reply(&json!({
            "state": "coding_planned",
            "subtask_id": "t1",
            "subtask_subject": "load csv",
            "subtask_summary_prompt": "State row count",
        })));
        // Reasoning plan needs no coding prompt.
        assert!(agent.validate_reply(&json!({
            "state": "reasoning_planned",
            "subtask_id": "t2",
            "subtask_subject": "compare models",
            "subtask_summary_prompt": "State the winner",
        })));
        // Request-info needs a non-empty question list.
        assert!(!agent.validate_reply(&json!({"state": "request_info"})));
        assert!(agent.validate_reply(&json!({
            "state": "request_info",
            "request_supply_infos": [{"question": "CSV path?"}],
        })));
        assert!(agent.validate_reply(&json!({"state": "global_finished"})));
        assert!(!agent.validate_reply(&json!({"state": "unheard_of"})));
    }

    #[tokio::test]
    async fn test_on_reply_coding_planned_fills_agent_data() {
        let mut agent = planner();
        agent.context.with_task(|task| {
            task.agent_data.result = "stale".to_string();
            task.agent_data.important_infos = Some(serde_json::Map::new());
        });
        let (failed, state) = agent
            .on_reply(CombinedReply::Json(json!({
                "state": "coding_planned",
                "subtask_id": "t1",
                "subtask_subject": "load csv",
                "subtask_coding_prompt": "Read data.csv into df",
                "subtask_summary_prompt": "State row count",
            })))
            .await
            .unwrap();
        assert!(!failed);
        assert_eq!(state, AgentState::Named("coding_planned".to_string()));
        agent.context.with_task(|task| {
            assert_eq!(task.agent_data.task_id, "t1");
            assert_eq!(task.agent_data.subject, "load csv");
            assert_eq!(task.agent_data.coding_prompt, "Read data.csv into df");
            assert_eq!(task.agent_data.summary_prompt, "State row count");
            // Stage outcome resets stale fields.
            assert_eq!(task.agent_data.result, "");
            assert!(task.agent_data.important_infos.is_none());
        });
    }

    #[tokio::test]
    async fn test_on_reply_request_info_records_questions() {
        let mut agent = planner();
        let (failed, state) = agent
            .on_reply(CombinedReply::Json(json!({
                "state": "request_info",
                "request_supply_infos": [{"question": "CSV path?", "example": "/data/x.csv"}],
            })))
            .await
            .unwrap();
        assert!(!failed);
        assert_eq!(state, AgentState::Named("request_info".to_string()));
        agent.context.with_task(|task| {
            let infos = task.agent_data.request_above_supply_infos.as_ref().unwrap();
            assert_eq!(infos[0].question, "CSV path?");
        });
    }

    #[test]
    fn test_trigger_switches_when_replanning() {
        let agent = planner();
        assert!(agent.prompt_trigger().starts_with("Plan the next subtask"));
        agent.context.with_task(|task| {
            task.agent_data.subject = "load csv".to_string();
            task.agent_data.issue = "- row count mismatch\n".to_string();
        });
        assert!(agent.prompt_trigger().contains("replan"));
        assert!(agent.task_data().is_object());
    }
}
