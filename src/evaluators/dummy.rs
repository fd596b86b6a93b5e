//! Deterministic evaluators used when no evaluating model is configured.

use async_trait::async_trait;

use crate::agents::AgentContext;
use crate::evaluation::{EvalType, EvaluationRecord};

use super::Evaluator;

macro_rules! dummy_evaluator {
    ($name:ident, $registered:literal, $eval_type:expr) => {
        #[derive(Debug)]
        pub struct $name {
            context: AgentContext,
        }

        impl $name {
            pub fn new(context: AgentContext) -> $name {
                $name { context }
            }
        }

        #[async_trait]
        impl Evaluator for $name {
            fn name(&self) -> &'static str {
                $registered
            }

            async fn evaluate(&mut self) -> anyhow::Result<EvaluationRecord> {
                let cell_index = self
                    .context
                    .with_task(|task| task.cell_idx.map(|idx| idx as i64).unwrap_or(-1));
                Ok(EvaluationRecord {
                    eval_type: $eval_type,
                    evaluator: $registered.to_string(),
                    cell_index,
                    is_success: true,
                    correct_score: 1.0,
                    ..Default::default()
                })
            }
        }
    };
}

dummy_evaluator!(DummyTaskEvaluator, "dummy_task", EvalType::Stage);
dummy_evaluator!(DummyFlowEvaluator, "dummy_flow", EvalType::Flow);
dummy_evaluator!(DummyGlobalEvaluator, "dummy_global", EvalType::Notebook);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;

    #[tokio::test]
    async fn test_dummy_records_succeed() {
        let (factory, _runtime) = test_factory("-s planning", "body");
        let mut task = DummyTaskEvaluator::new(factory.context.clone());
        let record = task.evaluate().await.unwrap();
        assert_eq!(record.eval_type, EvalType::Stage);
        assert!(record.is_success);

        let mut flow = DummyFlowEvaluator::new(factory.context.clone());
        assert_eq!(flow.evaluate().await.unwrap().eval_type, EvalType::Flow);

        let mut global = DummyGlobalEvaluator::new(factory.context.clone());
        assert_eq!(global.evaluate().await.unwrap().eval_type, EvalType::Notebook);
    }
}
