//! Requests supplementary information from the human.
//!
//! Three strategies, picked from the host capabilities: mock the human with
//! the model, round-trip an action through the dispatcher and block for the
//! reply, or write a pre-filled user-supply cell next to the current one for
//! the human to complete.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::actions::{
    self, Action, ActionPayload, ReceiveUserSupplyInfoParams, RequestUserSupplyInfo,
    RequestUserSupplyInfoParams, SetCellContentParams, UserSupplyInfoReply,
};
use crate::chat::BotChat;
use crate::contexts::render_user_supply_cell;
use crate::outputs;
use crate::utils::{get_env_capabilities, no_indent};

use super::base::{schema_string, ChatAgent, CombinedReply, OutputFormat, SchemaSpec};
use super::{Agent, AgentContext, AgentState};

/// Where the supplied information lands relative to the current cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupplySide {
    Above,
    Below,
}

impl SupplySide {
    fn insert_index(&self) -> i64 {
        match self {
            SupplySide::Above => -1,
            SupplySide::Below => 1,
        }
    }
}

fn format_request(infos: &[RequestUserSupplyInfo]) -> String {
    let mut text = String::from("### Information needed from you\n\n");
    for info in infos {
        text.push_str(&format!(
            "- **Assistant**: {}{}\n- **Your reply**: \n",
            info.question,
            info.example
                .as_deref()
                .map(|example| format!(" (e.g. {example})"))
                .unwrap_or_default(),
        ));
    }
    text
}

fn format_received(replies: &[UserSupplyInfoReply]) -> String {
    let mut text = String::from("### Information supplied by you\n\n");
    for reply in replies {
        text.push_str(&format!(
            "- **Assistant**: {}\n- **Your reply**: {}\n",
            reply.question, reply.answer
        ));
    }
    text
}

/// Persist answered questions beside the current cell as a user-supply
/// cell, or tell the human to do it when the host cannot insert cells.
async fn persist_replies(
    side: SupplySide,
    replies: &[UserSupplyInfoReply],
) -> anyhow::Result<()> {
    if get_env_capabilities().set_cell_content {
        let dispatcher = actions::get_action_dispatcher().await?;
        let mut action = Action::set_cell_content(
            "RequestUserSupplyAgent",
            SetCellContentParams {
                index: side.insert_index(),
                cell_type: "raw".to_string(),
                source: render_user_supply_cell(replies),
                tags: vec![],
                metadata: serde_json::Map::new(),
            },
        );
        dispatcher.send_action(&mut action, false)?;
    } else {
        outputs::output_markdown(
            "### Supplied information\n\nSave the following content into its own cell so later tasks can use it:",
        );
        outputs::output_markdown(&format!("```markdown\n{}```", format_received(replies)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Mock-the-human chat agent
// ---------------------------------------------------------------------------

const MOCK_PROMPT_ROLE: &str = "\
You are a requirements completion expert who answers pending questions on \
behalf of the user so the task can proceed.";

const MOCK_PROMPT_RULES: &str = "\
- Answer every pending question with a definite answer; do not leave any \
question open.
- Ground the answers in the notebook context and the examples given.";

const MOCK_PROMPT_TRIGGER_TPL: &str = r#"Questions to answer on the user's behalf:

{% for issue in request_supply_infos %}
- {{ issue.question }}{% if issue.example %} (e.g. {{ issue.example }}){% endif %}
{% endfor %}

---

Answer the questions above on the user's behalf:
"#;

struct MockUserReplyAgent {
    context: AgentContext,
    chat: BotChat,
    side: SupplySide,
    infos: Vec<RequestUserSupplyInfo>,
}

#[async_trait]
impl ChatAgent for MockUserReplyAgent {
    fn name(&self) -> &'static str {
        "MockUserReplyAgent"
    }

    fn context(&self) -> &AgentContext {
        &self.context
    }

    fn chat_client(&self) -> &BotChat {
        &self.chat
    }

    fn prompt_role(&self) -> String {
        MOCK_PROMPT_ROLE.to_string()
    }

    fn prompt_rules(&self) -> String {
        MOCK_PROMPT_RULES.to_string()
    }

    fn prompt_trigger(&self) -> String {
        no_indent(MOCK_PROMPT_TRIGGER_TPL)
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn output_json_schema(&self) -> Option<SchemaSpec> {
        Some(SchemaSpec {
            schema: schema_string::<ReceiveUserSupplyInfoParams>(),
            example: serde_json::to_string_pretty(&json!({
                "replies": [{"question": "CSV path?", "answer": "/data/sales.csv"}],
            }))
            .unwrap_or_default(),
        })
    }

    fn extra_context(&self) -> serde_json::Map<String, Value> {
        let mut extra = serde_json::Map::new();
        extra.insert(
            "request_supply_infos".to_string(),
            serde_json::to_value(&self.infos).unwrap_or(Value::Null),
        );
        extra
    }

    fn validate_reply(&self, value: &Value) -> bool {
        serde_json::from_value::<ReceiveUserSupplyInfoParams>(value.clone())
            .map(|params| !params.replies.is_empty())
            .unwrap_or(false)
    }

    async fn on_reply(&mut self, reply: CombinedReply) -> anyhow::Result<(bool, AgentState)> {
        let CombinedReply::Json(value) = reply else {
            anyhow::bail!("mock user reply is not a JSON object");
        };
        let params: ReceiveUserSupplyInfoParams = serde_json::from_value(value)?;
        persist_replies(self.side, &params.replies).await?;
        Ok((false, AgentState::Finished))
    }
}

// ---------------------------------------------------------------------------
// Public agents
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RequestUserSupplyCore {
    context: AgentContext,
    chat: BotChat,
    side: SupplySide,
    mock_user_supply: bool,
}

impl RequestUserSupplyCore {
    fn pending_infos(&self) -> Vec<RequestUserSupplyInfo> {
        self.context.with_task(|task| {
            let infos = match self.side {
                SupplySide::Above => &task.agent_data.request_above_supply_infos,
                SupplySide::Below => &task.agent_data.request_below_supply_infos,
            };
            infos.clone().unwrap_or_default()
        })
    }

    async fn run(&mut self) -> anyhow::Result<(bool, AgentState)> {
        let infos = self.pending_infos();
        if self.mock_user_supply {
            let mut mock = MockUserReplyAgent {
                context: self.context.clone(),
                chat: self.chat.clone(),
                side: self.side,
                infos,
            };
            return super::base::run_chat_agent(&mut mock).await;
        }

        let caps = get_env_capabilities();
        if caps.user_supply_info {
            outputs::info(format!("requesting user supply info: {} questions", infos.len()));
            let dispatcher = actions::get_action_dispatcher().await?;
            let mut action = Action::request_user_supply_info(
                "RequestUserSupplyAgent",
                RequestUserSupplyInfoParams {
                    title: "Supplementary information needed".to_string(),
                    issues: infos,
                },
            );
            dispatcher.send_action(&mut action, true)?;
            let reply = dispatcher.get_action_reply(&action, true).await;
            if let Some(reply) = reply {
                if let ActionPayload::ReceiveUserSupplyInfo(params) = reply.payload {
                    persist_replies(self.side, &params.replies).await?;
                }
            }
        } else if caps.set_cell_content {
            outputs::output_markdown(&format!(
                "**Supplementary information needed** — complete the cell {} this one, then re-run.",
                if self.side == SupplySide::Above { "above" } else { "below" },
            ));
            let placeholders: Vec<UserSupplyInfoReply> = self
                .pending_infos()
                .into_iter()
                .map(|info| UserSupplyInfoReply {
                    question: info.question,
                    answer: String::new(),
                })
                .collect();
            let dispatcher = actions::get_action_dispatcher().await?;
            let mut action = Action::set_cell_content(
                "RequestUserSupplyAgent",
                SetCellContentParams {
                    index: self.side.insert_index(),
                    cell_type: "raw".to_string(),
                    source: render_user_supply_cell(&placeholders),
                    tags: vec![],
                    metadata: serde_json::Map::new(),
                },
            );
            dispatcher.send_action(&mut action, false)?;
        } else {
            outputs::output_markdown(
                "### Information needed\n\nSave the following content into its own cell, complete it, then re-run:",
            );
            outputs::output_markdown(&format!("```markdown\n{}```", format_request(&infos)));
        }
        Ok((false, AgentState::Finished))
    }
}

/// Requests information that belongs above the current cell (planner-side
/// questions).
#[derive(Debug)]
pub struct RequestAboveUserSupplyAgent(RequestUserSupplyCore);

impl RequestAboveUserSupplyAgent {
    pub fn new(context: AgentContext, chat: BotChat) -> RequestAboveUserSupplyAgent {
        RequestAboveUserSupplyAgent(RequestUserSupplyCore {
            context,
            chat,
            side: SupplySide::Above,
            mock_user_supply: false,
        })
    }

    /// Let the model answer the pending questions on the user's behalf.
    pub fn with_mock_user(mut self, mock: bool) -> RequestAboveUserSupplyAgent {
        self.0.mock_user_supply = mock;
        self
    }
}

#[async_trait]
impl Agent for RequestAboveUserSupplyAgent {
    fn name(&self) -> &'static str {
        "RequestAboveUserSupplyAgent"
    }

    async fn call(&mut self) -> anyhow::Result<(bool, AgentState)> {
        self.0.run().await
    }
}

/// Requests information that belongs below the current cell (summary-side
/// confirmations).
#[derive(Debug)]
pub struct RequestBelowUserSupplyAgent(RequestUserSupplyCore);

impl RequestBelowUserSupplyAgent {
    pub fn new(context: AgentContext, chat: BotChat) -> RequestBelowUserSupplyAgent {
        RequestBelowUserSupplyAgent(RequestUserSupplyCore {
            context,
            chat,
            side: SupplySide::Below,
            mock_user_supply: false,
        })
    }

    /// Let the model answer the pending questions on the user's behalf.
    pub fn with_mock_user(mut self, mock: bool) -> RequestBelowUserSupplyAgent {
        self.0.mock_user_supply = mock;
        self
    }
}

#[async_trait]
impl Agent for RequestBelowUserSupplyAgent {
    fn name(&self) -> &'static str {
        "RequestBelowUserSupplyAgent"
    }

    async fn call(&mut self) -> anyhow::Result<(bool, AgentState)> {
        self.0.run().await
    }
}
