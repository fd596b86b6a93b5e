//! Invocation entry point: the `%%bot` cell magic equivalent.
//!
//! Parses the invocation flags, wires the agent factory to the configured
//! models, picks a flow, and runs it once for the current cell execution.

use std::path::PathBuf;

use crate::agents::{AgentContext, AgentFactory, ModelConfig, ModelType};
use crate::contexts::{split_args, NotebookContext, NotebookRuntime};
use crate::flows::{create_flow, master_planner_flow, ConfirmInput, TaskFlow};
use crate::outputs::{self, LogLevel};
use crate::utils::{get_env_capabilities, set_env_capabilities};

/// Host-level configuration of the magic entry point.
#[derive(Debug, Clone)]
pub struct BotMagicConfig {
    pub logging_level: String,
    pub default_model: ModelConfig,
    pub planner_model: ModelConfig,
    pub coding_model: ModelConfig,
    pub reasoning_model: ModelConfig,
    pub evaluating_model: ModelConfig,
    pub display_message: bool,
    pub display_think: bool,
    pub display_response: bool,
    pub notebook_path: Option<PathBuf>,
    pub default_task_flow: String,
    pub support_save_meta: bool,
}

impl Default for BotMagicConfig {
    fn default() -> Self {
        Self {
            logging_level: "INFO".to_string(),
            default_model: ModelConfig::default(),
            planner_model: ModelConfig::default(),
            coding_model: ModelConfig::default(),
            reasoning_model: ModelConfig::default(),
            evaluating_model: ModelConfig::default(),
            display_message: false,
            display_think: true,
            display_response: false,
            notebook_path: None,
            default_task_flow: "v3".to_string(),
            support_save_meta: false,
        }
    }
}

/// Flags parsed from one invocation line.
#[derive(Debug, Clone, PartialEq)]
pub struct MagicOptions {
    pub logging_level: String,
    pub planning: bool,
    pub stage: Option<String>,
    pub flow: String,
    pub max_tries: u32,
    pub step_mode: bool,
    pub auto_confirm: bool,
}

/// The `%%bot` entry point.
#[derive(Debug)]
pub struct BotMagic {
    pub config: BotMagicConfig,
}

impl BotMagic {
    pub fn new(config: BotMagicConfig) -> BotMagic {
        BotMagic { config }
    }

    /// Parse the invocation flags; unknown flags are ignored.
    pub fn parse_args(&self, line: &str) -> MagicOptions {
        let mut options = MagicOptions {
            logging_level: self.config.logging_level.clone(),
            planning: false,
            stage: None,
            flow: self.config.default_task_flow.clone(),
            max_tries: 3,
            step_mode: false,
            auto_confirm: false,
        };
        let mut words = split_args(line).into_iter();
        while let Some(word) = words.next() {
            match word.as_str() {
                "-l" | "--logging-level" => {
                    if let Some(level) = words.next() {
                        options.logging_level = level;
                    }
                }
                "-P" | "--planning" => options.planning = true,
                "-s" | "--stage" => options.stage = words.next(),
                "-f" | "--flow" => {
                    if let Some(flow) = words.next() {
                        options.flow = flow;
                    }
                }
                "-m" | "--max-tries" => {
                    if let Some(tries) = words.next().and_then(|word| word.parse().ok()) {
                        options.max_tries = tries;
                    }
                }
                "-S" | "--step-mode" => options.step_mode = true,
                "-Y" | "--auto-confirm" => options.auto_confirm = true,
                _ => {}
            }
        }
        options
    }

    fn build_factory(&self, context: AgentContext) -> AgentFactory {
        let mut factory = AgentFactory::new(context);
        factory.display_think = self.config.display_think;
        factory.display_message = self.config.display_message;
        factory.display_response = self.config.display_response;
        factory.config_model(ModelType::Default, self.config.default_model.clone());
        factory.config_model(ModelType::Planner, self.config.planner_model.clone());
        factory.config_model(ModelType::Coding, self.config.coding_model.clone());
        factory.config_model(ModelType::Reasoning, self.config.reasoning_model.clone());
        factory.config_model(ModelType::Evaluating, self.config.evaluating_model.clone());
        factory
    }

    fn build_flow(&self, options: &MagicOptions, factory: AgentFactory) -> anyhow::Result<TaskFlow> {
        if options.planning {
            Ok(master_planner_flow(factory)?)
        } else {
            Ok(create_flow(&options.flow, factory)?)
        }
    }

    /// Run one agent-cell execution. Returns the stage the flow ended at.
    pub async fn bot(
        &mut self,
        line: &str,
        cell: &str,
        runtime: Box<dyn NotebookRuntime>,
        confirm: Option<Box<dyn ConfirmInput>>,
    ) -> anyhow::Result<String> {
        let mut capabilities = get_env_capabilities();
        capabilities.save_metadata = self.config.support_save_meta;
        set_env_capabilities(capabilities);

        outputs::reset_output(
            None,
            false,
            Some("Logging"),
            LogLevel::from_name(&self.config.logging_level),
        );
        outputs::info("cell magic %%bot executing ...");
        outputs::debug(format!("cell magic called with line: {line}"));
        outputs::debug(format!("cell magic called with cell: {:.50?} ...", cell));

        if cell.trim().is_empty() {
            outputs::output_markdown(
                "The cell is **empty**, we can't do anything.\n\n\
                 It has been filled with a stamp; please **re-run** the cell.",
            );
            let mut runtime = runtime;
            let stamp = format!(
                "%%bot {}\n\n# {}",
                line.trim(),
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            );
            runtime.set_next_input(&stamp, true)?;
            return Ok(String::new());
        }

        let options = self.parse_args(line);
        outputs::debug(format!("cell magic options: {options:?}"));
        outputs::set_logging_level(&options.logging_level);

        let notebook =
            NotebookContext::new(line, cell, self.config.notebook_path.clone())?;
        let context = AgentContext::new(notebook, runtime);
        let factory = self.build_factory(context);
        let mut flow = self.build_flow(&options, factory)?;
        if let Some(confirm) = confirm {
            flow.set_confirm(confirm);
        }
        let final_stage = flow
            .run(
                options.stage.as_deref(),
                options.max_tries,
                !options.step_mode,
                !options.auto_confirm,
            )
            .await?;
        log::debug!("flow `{}` finished at stage `{final_stage}`", flow.name);
        Ok(final_stage)
    }

    /// Synchronous wrapper for hosts without an async context.
    pub fn bot_blocking(
        &mut self,
        line: &str,
        cell: &str,
        runtime: Box<dyn NotebookRuntime>,
        confirm: Option<Box<dyn ConfirmInput>>,
    ) -> anyhow::Result<String> {
        if tokio::runtime::Handle::try_current().is_ok() {
            anyhow::bail!(
                "bot_blocking() cannot be called from within an async context; \
                 use `bot(...).await` instead"
            );
        }
        let runtime_handle = tokio::runtime::Runtime::new()?;
        runtime_handle.block_on(self.bot(line, cell, runtime, confirm))
    }
}
