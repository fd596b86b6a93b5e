//! Code debugger: given a failed execution, emits replacement source.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::chat::BotChat;

use super::base::{ChatAgent, CombinedReply, OutputFormat};
use super::task_coder::generated_header;
use super::{AgentContext, AgentState};

const PROMPT_ROLE: &str = "\
You are a debugging expert for notebook code. Given the failing source and \
the captured error, you produce a corrected version of the whole cell.";

const PROMPT_RULES: &str = "\
- Diagnose the root cause from the error and traceback before changing code.
- Emit the complete replacement source for the cell, not a fragment.
- Keep the original intent and variable names; change only what the fix \
requires.
- On unrecoverable conditions keep raising the exception so the executor \
can see any remaining failure.";

#[derive(Debug)]
pub struct CodeDebuggerAgent {
    context: AgentContext,
    chat: BotChat,
}

impl CodeDebuggerAgent {
    pub fn new(context: AgentContext, chat: BotChat) -> CodeDebuggerAgent {
        CodeDebuggerAgent { context, chat }
    }
}

#[async_trait]
impl ChatAgent for CodeDebuggerAgent {
    fn name(&self) -> &'static str {
        "CodeDebuggerAgent"
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
        "Fix the failing cell and output the corrected code:".to_string()
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Code
    }

    fn task_data(&self) -> Value {
        self.context.with_task(|task| {
            json!({
                "subject": task.agent_data.subject,
                "coding_prompt": task.agent_data.coding_prompt,
                "source": task.cell_code,
                "output": task.combined_output(),
                "error": task.cell_error(),
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
    async fn test_reply_replaces_cell_source() {
        let (factory, _runtime) = test_factory("-s debugging", "df = load()");
        let mut agent = CodeDebuggerAgent::new(factory.context.clone(), BotChat::default());
        agent
            .context
            .with_task(|task| task.set_cell_error("NameError: name 'load' is not defined"));
        agent
            .on_reply(CombinedReply::Code("import pandas as pd\ndf = pd.read_csv('data.csv')".to_string()))
            .await
            .unwrap();
        agent.context.with_task(|task| {
            assert!(task.cell_code.contains("pd.read_csv"));
            assert!(!task.cell_code.contains("load()"));
        });
    }
}
