//! Global planner: turns the user's free-form goal into a master plan for
//! the whole notebook.

use async_trait::async_trait;

use crate::chat::BotChat;
use crate::outputs::{self, ReplyType};
use crate::utils::no_indent;

use super::base::{ChatAgent, CombinedReply};
use super::{AgentContext, AgentState};

const MASTER_PLANNER_PROMPT: &str = r#"**Role**:

You are a senior analysis planner who decomposes natural-language goals into
executable notebook workflows.

**Task requirements**:

- Parse the user's goal and extract the core requirements (data sources,
  analysis targets, output formats).
- Turn them into an ordered list of notebook subtasks, each as simple and
  self-contained as possible.
- State the input/output dependencies between subtasks.
- State the expected final deliverable (text, charts, tables).

**User goal**:

{{ task.source }}

---

Produce the global execution plan for this goal:
"#;

#[derive(Debug)]
pub struct MasterPlannerAgent {
    context: AgentContext,
    chat: BotChat,
}

impl MasterPlannerAgent {
    pub fn new(context: AgentContext, chat: BotChat) -> MasterPlannerAgent {
        MasterPlannerAgent { context, chat }
    }
}

#[async_trait]
impl ChatAgent for MasterPlannerAgent {
    fn name(&self) -> &'static str {
        "MasterPlannerAgent"
    }

    fn context(&self) -> &AgentContext {
        &self.context
    }

    fn chat_client(&self) -> &BotChat {
        &self.chat
    }

    fn prompt(&self) -> String {
        no_indent(MASTER_PLANNER_PROMPT)
    }

    fn prompt_role(&self) -> String {
        String::new()
    }

    fn display_reply(&self) -> bool {
        false
    }

    async fn on_reply(&mut self, reply: CombinedReply) -> anyhow::Result<(bool, AgentState)> {
        let plan = reply.as_text().to_string();
        outputs::agent_display(&plan, Some(ReplyType::TaskResult), false);
        self.context
            .with_task(|task| task.agent_data.result = plan.clone());
        Ok((false, AgentState::Finished))
    }
}
