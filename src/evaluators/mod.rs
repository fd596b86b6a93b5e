//! Evaluators: same shape as LLM-backed agents, but they consume a finished
//! stage or flow and emit a scored record instead of mutating the task.

pub mod base;
pub mod dummy;
pub mod flow_global_planning;
pub mod flow_task_executor;

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::agents::{AgentContext, AgentError, AgentFactory, ModelType};
use crate::chat::BotChat;
use crate::evaluation::EvaluationRecord;

pub use dummy::{DummyFlowEvaluator, DummyGlobalEvaluator, DummyTaskEvaluator};
pub use flow_global_planning::FlowGlobalPlanningEvaluator;
pub use flow_task_executor::FlowTaskExecutorEvaluator;

/// Scores a finished stage or flow.
#[async_trait]
pub trait Evaluator: Send {
    fn name(&self) -> &'static str;
    async fn evaluate(&mut self) -> anyhow::Result<EvaluationRecord>;
}

enum EvaluatorBuilder {
    Plain(fn(AgentContext) -> Box<dyn Evaluator>),
    Chat(fn(AgentContext, BotChat) -> Box<dyn Evaluator>),
}

/// The registered evaluator table, keyed by record-facing name.
static EVALUATOR_REGISTRY: Lazy<HashMap<&'static str, EvaluatorBuilder>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, EvaluatorBuilder> = HashMap::new();
    table.insert(
        "dummy_task",
        EvaluatorBuilder::Plain(|ctx| Box::new(DummyTaskEvaluator::new(ctx))),
    );
    table.insert(
        "dummy_flow",
        EvaluatorBuilder::Plain(|ctx| Box::new(DummyFlowEvaluator::new(ctx))),
    );
    table.insert(
        "dummy_global",
        EvaluatorBuilder::Plain(|ctx| Box::new(DummyGlobalEvaluator::new(ctx))),
    );
    table.insert(
        "flow_global_planning",
        EvaluatorBuilder::Chat(|ctx, chat| Box::new(FlowGlobalPlanningEvaluator::new(ctx, chat))),
    );
    table.insert(
        "flow_task_executor",
        EvaluatorBuilder::Chat(|ctx, chat| Box::new(FlowTaskExecutorEvaluator::new(ctx, chat))),
    );
    table
});

/// Instantiate an evaluator by name using the factory's evaluating model.
pub fn create_evaluator(
    factory: &AgentFactory,
    name: &str,
) -> Result<Box<dyn Evaluator>, AgentError> {
    match EVALUATOR_REGISTRY.get(name) {
        Some(EvaluatorBuilder::Plain(build)) => Ok(build(factory.context.clone())),
        Some(EvaluatorBuilder::Chat(build)) => Ok(build(
            factory.context.clone(),
            factory.chat_for_model(ModelType::Evaluating),
        )),
        None => Err(AgentError::UnknownAgent(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;

    #[test]
    fn test_registry_creates_all_evaluators() {
        let (factory, _runtime) = test_factory("-s planning", "body");
        for name in [
            "dummy_task",
            "dummy_flow",
            "dummy_global",
            "flow_global_planning",
            "flow_task_executor",
        ] {
            let evaluator = create_evaluator(&factory, name).unwrap();
            assert_eq!(evaluator.name(), name);
        }
        assert!(create_evaluator(&factory, "nope").is_err());
    }
}
