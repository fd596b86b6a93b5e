//! Task flows: deterministic state machines of stage nodes driving one
//! agent cell.

pub mod base;
pub mod master_planner;
pub mod task_executor;


pub use base::{
    match_action, AutoConfirm, ConfirmInput, FlowDefinition, FlowError, NextSpec, StageNext,
    StageTransition, StdinConfirm, TaskAction, TaskFlow, STAGE_COMPLETED, STAGE_GLOBAL_FINISHED,
    STAGE_START,
};
pub use master_planner::master_planner_flow;
pub use task_executor::task_executor_flow;

use crate::agents::AgentFactory;

/// Resolve a flow by its invocation name.
pub fn create_flow(name: &str, factory: AgentFactory) -> Result<TaskFlow, FlowError> {
    match name {
        "planning" | "master_planner" => master_planner_flow(factory),
        "" | "v3" | "task_executor" => task_executor_flow(factory),
        other => Err(FlowError::UnknownFlow(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;

    #[test]
    fn test_create_flow_by_name() {
        let (factory, _runtime) = test_factory("-s planning", "body");
        assert_eq!(
            create_flow("planning", factory.clone()).unwrap().name,
            "master_planner"
        );
        assert_eq!(create_flow("v3", factory.clone()).unwrap().name, "task_executor");
        assert_eq!(create_flow("", factory.clone()).unwrap().name, "task_executor");
        assert!(matches!(
            create_flow("v9", factory),
            Err(FlowError::UnknownFlow(_))
        ));
    }
}
