//! Writes the finished task's result and important infos to the display.

use async_trait::async_trait;

use crate::outputs::{self, ReplyType};

use super::{Agent, AgentContext, AgentState};

#[derive(Debug)]
pub struct OutputTaskResult {
    context: AgentContext,
}

impl OutputTaskResult {
    pub fn new(context: AgentContext) -> OutputTaskResult {
        OutputTaskResult { context }
    }
}

#[async_trait]
impl Agent for OutputTaskResult {
    fn name(&self) -> &'static str {
        "OutputTaskResult"
    }

    async fn call(&mut self) -> anyhow::Result<(bool, AgentState)> {
        let (result, important_infos) = self.context.with_task(|task| {
            (
                task.agent_data.result.clone(),
                task.agent_data.important_infos.clone(),
            )
        });
        if !result.is_empty() {
            outputs::agent_display(
                &format!("### Task result\n\n{result}"),
                Some(ReplyType::TaskResult),
                false,
            );
        }
        if let Some(infos) = important_infos {
            outputs::agent_display(
                &outputs::markdown_block(
                    &format!(
                        "```json\n{}\n```",
                        serde_json::to_string_pretty(&infos).unwrap_or_default()
                    ),
                    "Important Infos",
                    true,
                ),
                None,
                true,
            );
        }
        Ok((false, AgentState::Finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;

    #[tokio::test]
    async fn test_empty_result_is_a_no_op() {
        let (factory, _runtime) = test_factory("-s output_result", "");
        let mut agent = OutputTaskResult::new(factory.context.clone());
        let (failed, state) = agent.call().await.unwrap();
        assert!(!failed);
        assert_eq!(state, AgentState::Finished);
    }
}
