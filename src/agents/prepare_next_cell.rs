//! Prepares the follow-up agent cell so the user can continue the flow by
//! simply executing it.

use async_trait::async_trait;
use chrono::Local;

use crate::actions::{self, Action, SetCellContentParams};
use crate::outputs;
use crate::utils::get_env_capabilities;

use super::{Agent, AgentContext, AgentState};

fn next_cell_source() -> String {
    format!(
        "%%bot\n\n\
         # Execute this cell to generate the next task\n\
         # {}\n\
         # Special Note: Ensure the notebook is SAVED before executing this cell!\n",
        Local::now().format("%Y-%m-%dT%H:%M:%S")
    )
}

#[derive(Debug)]
pub struct PrepareNextCell;

impl PrepareNextCell {
    pub fn new(_context: AgentContext) -> PrepareNextCell {
        PrepareNextCell
    }
}

#[async_trait]
impl Agent for PrepareNextCell {
    fn name(&self) -> &'static str {
        "PrepareNextCell"
    }

    async fn call(&mut self) -> anyhow::Result<(bool, AgentState)> {
        if get_env_capabilities().set_cell_content {
            outputs::info("setting next cell content to generate the next task");
            let dispatcher = actions::get_action_dispatcher().await?;
            let mut action = Action::set_cell_content(
                "PrepareNextCell",
                SetCellContentParams {
                    index: 1,
                    cell_type: "code".to_string(),
                    source: next_cell_source(),
                    tags: vec![],
                    metadata: serde_json::Map::new(),
                },
            );
            dispatcher.send_action(&mut action, false)?;
        } else {
            outputs::output_markdown(
                "Copy the following code to the next cell to generate the next task ...",
            );
            outputs::output_markdown(&format!("```python\n{}```", next_cell_source()));
        }
        Ok((false, AgentState::Finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_cell_source_shape() {
        let source = next_cell_source();
        assert!(source.starts_with("%%bot\n"));
        assert!(source.contains("generate the next task"));
    }
}
