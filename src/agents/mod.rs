//! Agents: uniform units of work over the current task.
//!
//! An agent is either deterministic (code executor, result writer) or
//! LLM-backed (planner, coder, summariser, ...). Concrete agents are bound
//! to model configurations through the [`AgentFactory`], which looks them up
//! in a registered constructor table by name.

pub mod base;
pub mod code_debugger;
pub mod code_executor;
pub mod master_planner;
pub mod output_task_result;
pub mod prepare_next_cell;
pub mod request_user_supply;
pub mod task_coder;
pub mod task_planner;
pub mod task_reasoner;
pub mod task_summary;
pub mod task_verifier;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use crate::chat::BotChat;
use crate::contexts::{AgentCellContext, NotebookContext, NotebookRuntime};

pub use base::{ChatAgent, CombineReply, CombinedReply, OutputFormat};
pub use code_debugger::CodeDebuggerAgent;
pub use code_executor::CodeExecutor;
pub use master_planner::MasterPlannerAgent;
pub use output_task_result::OutputTaskResult;
pub use prepare_next_cell::PrepareNextCell;
pub use request_user_supply::{RequestAboveUserSupplyAgent, RequestBelowUserSupplyAgent};
pub use task_coder::TaskCodingAgent;
pub use task_planner::{TaskPlannerAgent, TaskPlannerState};
pub use task_reasoner::TaskReasoningAgent;
pub use task_summary::TaskSummaryAgent;
pub use task_verifier::TaskVerifyAgent;

/// Synthetic state the flow engine substitutes when an agent errors.
pub const AGENT_STATE_ERROR: &str = "_AGENT_STATE_ERROR_32534526_";

/// Errors raised by agents themselves.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to get a usable reply after {0} attempts")]
    Reply(u32),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("unsupported combine policy {policy} for {format} output")]
    Combine { policy: String, format: String },
}

/// Return state of an agent call, used as the transition key in the flow
/// graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    /// No particular state; the node's default transition applies.
    Finished,
    /// Boolean outcome (e.g. the code executor's success flag).
    Flag(bool),
    /// Named outcome (e.g. a planner state).
    Named(String),
    /// Synthetic error state.
    Error,
}

impl AgentState {
    /// The transition-map key this state resolves under.
    pub fn key(&self) -> &str {
        match self {
            AgentState::Finished => "finished",
            AgentState::Flag(true) => "true",
            AgentState::Flag(false) => "false",
            AgentState::Named(name) => name,
            AgentState::Error => AGENT_STATE_ERROR,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// A unit of work over the current task. The returned pair is
/// `(failed, state)`: `failed` drives the retry policy, `state` drives the
/// transition.
#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &'static str;
    async fn call(&mut self) -> anyhow::Result<(bool, AgentState)>;
}

// ---------------------------------------------------------------------------
// Shared context handle
// ---------------------------------------------------------------------------

/// Handle bundle threaded through every agent: the notebook context and the
/// interactive runtime. Clones share state.
#[derive(Clone)]
pub struct AgentContext {
    pub notebook: Arc<Mutex<NotebookContext>>,
    pub runtime: Arc<Mutex<Box<dyn NotebookRuntime>>>,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext").finish()
    }
}

impl AgentContext {
    pub fn new(notebook: NotebookContext, runtime: Box<dyn NotebookRuntime>) -> AgentContext {
        AgentContext {
            notebook: Arc::new(Mutex::new(notebook)),
            runtime: Arc::new(Mutex::new(runtime)),
        }
    }

    /// Run `f` against the current task.
    pub fn with_task<R>(&self, f: impl FnOnce(&mut AgentCellContext) -> R) -> R {
        f(&mut self.notebook.lock().cur_task)
    }

    /// Template-facing view of the current task.
    pub fn task_value(&self) -> Value {
        self.notebook.lock().cur_task.to_value()
    }

    /// Template-facing views of the preceding cells.
    pub fn cells_value(&self) -> Vec<Value> {
        self.notebook.lock().cells_value()
    }

    /// Persist the current task back into its cell.
    pub fn update_cell(&self) -> anyhow::Result<()> {
        let notebook = self.notebook.lock();
        let mut runtime = self.runtime.lock();
        notebook.cur_task.update_cell(runtime.as_mut())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Model configuration and factory
// ---------------------------------------------------------------------------

/// Named model configurations an agent class can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Default,
    Planner,
    Coding,
    Reasoning,
    Evaluating,
}

/// Endpoint configuration for one model type.
#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    pub api_url: String,
    pub api_key: String,
    pub model_name: String,
}

enum AgentBuilder {
    Plain(fn(AgentContext) -> Box<dyn Agent>),
    Chat(ModelType, fn(AgentContext, BotChat) -> Box<dyn Agent>),
}

/// The registered agent table. Adding an agent means adding one entry here.
static AGENT_REGISTRY: Lazy<HashMap<&'static str, AgentBuilder>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, AgentBuilder> = HashMap::new();
    table.insert(
        "CodeExecutor",
        AgentBuilder::Plain(|ctx| Box::new(CodeExecutor::new(ctx))),
    );
    table.insert(
        "OutputTaskResult",
        AgentBuilder::Plain(|ctx| Box::new(OutputTaskResult::new(ctx))),
    );
    table.insert(
        "PrepareNextCell",
        AgentBuilder::Plain(|ctx| Box::new(PrepareNextCell::new(ctx))),
    );
    table.insert(
        "MasterPlannerAgent",
        AgentBuilder::Chat(ModelType::Planner, |ctx, chat| {
            Box::new(MasterPlannerAgent::new(ctx, chat))
        }),
    );
    table.insert(
        "TaskPlannerAgent",
        AgentBuilder::Chat(ModelType::Planner, |ctx, chat| {
            Box::new(TaskPlannerAgent::new(ctx, chat))
        }),
    );
    table.insert(
        "TaskCodingAgent",
        AgentBuilder::Chat(ModelType::Coding, |ctx, chat| {
            Box::new(TaskCodingAgent::new(ctx, chat))
        }),
    );
    table.insert(
        "CodeDebuggerAgent",
        AgentBuilder::Chat(ModelType::Coding, |ctx, chat| {
            Box::new(CodeDebuggerAgent::new(ctx, chat))
        }),
    );
    table.insert(
        "TaskSummaryAgent",
        AgentBuilder::Chat(ModelType::Reasoning, |ctx, chat| {
            Box::new(TaskSummaryAgent::new(ctx, chat))
        }),
    );
    table.insert(
        "TaskReasoningAgent",
        AgentBuilder::Chat(ModelType::Reasoning, |ctx, chat| {
            Box::new(TaskReasoningAgent::new(ctx, chat))
        }),
    );
    table.insert(
        "TaskVerifyAgent",
        AgentBuilder::Chat(ModelType::Reasoning, |ctx, chat| {
            Box::new(TaskVerifyAgent::new(ctx, chat))
        }),
    );
    table.insert(
        "RequestAboveUserSupplyAgent",
        AgentBuilder::Chat(ModelType::Reasoning, |ctx, chat| {
            Box::new(RequestAboveUserSupplyAgent::new(ctx, chat))
        }),
    );
    table.insert(
        "RequestBelowUserSupplyAgent",
        AgentBuilder::Chat(ModelType::Reasoning, |ctx, chat| {
            Box::new(RequestBelowUserSupplyAgent::new(ctx, chat))
        }),
    );
    table
});

/// Binds agent names to model configurations and the shared context.
#[derive(Debug, Clone)]
pub struct AgentFactory {
    pub context: AgentContext,
    models: HashMap<ModelType, ModelConfig>,
    pub display_think: bool,
    pub display_message: bool,
    pub display_response: bool,
}

impl AgentFactory {
    pub fn new(context: AgentContext) -> AgentFactory {
        let mut models = HashMap::new();
        models.insert(ModelType::Default, ModelConfig::default());
        AgentFactory {
            context,
            models,
            display_think: true,
            display_message: false,
            display_response: false,
        }
    }

    /// Configure the endpoint for one model type.
    pub fn config_model(&mut self, model_type: ModelType, config: ModelConfig) {
        self.models.insert(model_type, config);
    }

    pub fn chat_for_model(&self, model_type: ModelType) -> BotChat {
        let fallback = self
            .models
            .get(&ModelType::Default)
            .cloned()
            .unwrap_or_default();
        let config = self
            .models
            .get(&model_type)
            .filter(|config| !config.model_name.is_empty())
            .cloned()
            .unwrap_or(fallback);
        let mut chat = BotChat::new(&config.api_url, &config.api_key, &config.model_name);
        chat.display_think = self.display_think;
        chat.display_message = self.display_message;
        chat.display_response = self.display_response;
        chat
    }

    /// Instantiate an agent by its registered name. Unknown names are a
    /// programmer error and fail fast.
    pub fn create(&self, name: &str) -> Result<Box<dyn Agent>, AgentError> {
        match AGENT_REGISTRY.get(name) {
            Some(AgentBuilder::Plain(build)) => Ok(build(self.context.clone())),
            Some(AgentBuilder::Chat(model_type, build)) => {
                Ok(build(self.context.clone(), self.chat_for_model(*model_type)))
            }
            None => Err(AgentError::UnknownAgent(name.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::evaluation::ScriptedRuntime;

    /// A factory over an empty in-memory notebook, for agent tests. The
    /// returned runtime handle shares state with the one inside the factory.
    pub fn test_factory(cur_line: &str, cur_content: &str) -> (AgentFactory, ScriptedRuntime) {
        let notebook = NotebookContext::new(cur_line, cur_content, None).expect("parse");
        let runtime = ScriptedRuntime::default();
        let context = AgentContext::new(notebook, Box::new(runtime.clone()));
        (AgentFactory::new(context), runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::test_factory;

    #[test]
    fn test_state_keys() {
        assert_eq!(AgentState::Flag(true).key(), "true");
        assert_eq!(AgentState::Flag(false).key(), "false");
        assert_eq!(
            AgentState::Named("coding_planned".into()).key(),
            "coding_planned"
        );
        assert_eq!(AgentState::Error.key(), AGENT_STATE_ERROR);
    }

    #[test]
    fn test_factory_creates_registered_agents() {
        let (factory, _runtime) = test_factory("-s planning", "body");
        for name in [
            "CodeExecutor",
            "MasterPlannerAgent",
            "TaskPlannerAgent",
            "TaskCodingAgent",
            "CodeDebuggerAgent",
            "TaskSummaryAgent",
            "TaskReasoningAgent",
            "TaskVerifyAgent",
            "RequestAboveUserSupplyAgent",
            "RequestBelowUserSupplyAgent",
            "OutputTaskResult",
            "PrepareNextCell",
        ] {
            let agent = factory.create(name).unwrap();
            assert_eq!(agent.name(), name);
        }
    }

    #[test]
    fn test_factory_rejects_unknown_agent() {
        let (factory, _runtime) = test_factory("-s planning", "body");
        let err = match factory.create("NoSuchAgent") {
            Err(e) => e,
            Ok(_) => panic!("expected AgentError::UnknownAgent"),
        };
        assert!(matches!(err, AgentError::UnknownAgent(_)));
    }

    #[test]
    fn test_factory_model_fallback_to_default() {
        let (mut factory, _runtime) = test_factory("-s planning", "body");
        factory.config_model(
            ModelType::Default,
            ModelConfig {
                api_url: "http://localhost/v1".to_string(),
                api_key: "key".to_string(),
                model_name: "base-model".to_string(),
            },
        );
        // Planner not configured: falls back to the default model.
        let chat = factory.chat_for_model(ModelType::Planner);
        assert_eq!(chat.model_name, "base-model");
        factory.config_model(
            ModelType::Planner,
            ModelConfig {
                api_url: "http://localhost/v1".to_string(),
                api_key: "key".to_string(),
                model_name: "planner-model".to_string(),
            },
        );
        assert_eq!(
            factory.chat_for_model(ModelType::Planner).model_name,
            "planner-model"
        );
    }
}
