//! # jupyter-agent
//!
//! An agentic notebook orchestrator. Given a notebook whose cells may be
//! annotated as agent cells, it plans a chain of subtasks, generates code
//! for each, executes it through the surrounding interactive runtime,
//! summarises the outcome, optionally asks the human for missing
//! information, and writes structured state back into the notebook so that
//! re-execution resumes where it left off.
//!
//! The core is the task flow engine in [`flows`]: a deterministic state
//! machine coordinating pluggable agents under a retry/failure policy.
//! Around it sit the notebook context model ([`contexts`]), the chat
//! client and prompt composer ([`chat`]), the stage-partitioned output sink
//! ([`outputs`]), the HTTP action dispatcher ([`actions`]), and the
//! evaluation records plus batch runner ([`evaluation`]).

pub mod actions;
pub mod agents;
pub mod chat;
pub mod contexts;
pub mod evaluation;
pub mod evaluators;
pub mod flows;
pub mod magic;
pub mod outputs;
pub mod utils;

pub use actions::{Action, ActionDispatcher, ActionPayload};
pub use agents::{Agent, AgentContext, AgentFactory, AgentState, ModelConfig, ModelType};
pub use chat::{BotChat, ChatError, ChatMessages, ReplySegment, SegmentKind};
pub use contexts::{AgentCellContext, AgentData, NotebookContext, NotebookFile, NotebookRuntime};
pub use evaluation::{EvalType, EvaluationRecord, NotebookRunner, RunnerOptions};
pub use flows::{create_flow, ConfirmInput, TaskAction, TaskFlow};
pub use magic::{BotMagic, BotMagicConfig};
pub use utils::{get_env_capabilities, set_env_capabilities, EnvironmentCapabilities};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
