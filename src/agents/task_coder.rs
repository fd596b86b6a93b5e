//! Code generator: turns the planned coding prompt into the cell's source.

use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Value};

use crate::chat::BotChat;

use super::base::{ChatAgent, CombinedReply, OutputFormat};
use super::{AgentContext, AgentState};

const PROMPT_ROLE: &str = "\
You are a notebook code architect who turns natural-language requirements \
into executable Python code.";

const PROMPT_RULES: &str = "\
- Generate Python code for the subtask prompt, imports included.
- Reuse variables that already exist; give new variables clear names.
- On unrecoverable conditions raise the exception directly so the executor \
can see the failure; do not swallow errors.
- Keep the logic simple and encapsulate key steps as functions where it \
helps; include docstrings for non-trivial functions.
- Store results in variables and print them (or leave them as the cell's \
final expression) so the execution output is visible.
- Make full use of the important infos and user-supplied infos recorded by \
earlier subtasks; never re-ask for information already supplied.
- Do not repeat code that earlier cells already executed.";

/// Stamp prepended to every generated cell source.
pub fn generated_header() -> String {
    format!(
        "# Generated by Jupyter Agent (Coder) {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

#[derive(Debug)]
pub struct TaskCodingAgent {
    context: AgentContext,
    chat: BotChat,
}

impl TaskCodingAgent {
    pub fn new(context: AgentContext, chat: BotChat) -> TaskCodingAgent {
        TaskCodingAgent { context, chat }
    }
}

#[async_trait]
impl ChatAgent for TaskCodingAgent {
    fn name(&self) -> &'static str {
        "TaskCodingAgent"
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
        "Generate the code for the current subtask:".to_string()
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Code
    }

    fn task_data(&self) -> Value {
        self.context.with_task(|task| {
            json!({
                "cell_idx": task.cell_idx,
                "task_id": task.agent_data.task_id,
                "subject": task.agent_data.subject,
                "coding_prompt": task.agent_data.coding_prompt,
                "issue": task.agent_data.issue,
            })
        })
    }

    async fn on_reply(&mut self, reply: CombinedReply) -> anyhow::Result<(bool, AgentState)> {
        let mut generated = generated_header();
        generated.push_str(reply.as_text());
        self.context.with_task(|task| task.cell_code = generated);
        Ok((false, AgentState::Finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;

    #[tokio::test]
    async fn test_reply_becomes_cell_source_with_header() {
        let (factory, _runtime) = test_factory("-s coding", "");
        let mut agent = TaskCodingAgent::new(factory.context.clone(), BotChat::default());
        agent
            .on_reply(CombinedReply::Code("print(len(df))".to_string()))
            .await
            .unwrap();
        agent.context.with_task(|task| {
            assert!(task.cell_code.starts_with("# Generated by Jupyter Agent (Coder) "));
            assert!(task.cell_code.ends_with("print(len(df))"));
        });
    }
}
