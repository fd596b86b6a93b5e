//! Global planning flow: one planner pass, then done.

use crate::agents::AgentFactory;

use super::base::{
    FlowDefinition, FlowError, NextSpec, StageTransition, TaskFlow, STAGE_COMPLETED, STAGE_START,
};

/// Build the master planning flow: `start` runs the global planner, and a
/// re-run at `completed` re-renders the stored plan.
pub fn master_planner_flow(factory: AgentFactory) -> Result<TaskFlow, FlowError> {
    TaskFlow::new(
        FlowDefinition {
            name: "master_planner",
            start_stage: STAGE_START,
            stop_stages: vec![STAGE_COMPLETED],
            transitions: vec![
                StageTransition::new(STAGE_START, vec!["MasterPlannerAgent"])
                    .next(NextSpec::Stage(STAGE_COMPLETED)),
                StageTransition::new(STAGE_COMPLETED, vec!["OutputTaskResult"])
                    .next(NextSpec::Stage(STAGE_COMPLETED)),
            ],
            flow_evaluator: Some("flow_global_planning"),
            global_evaluator: None,
        },
        factory,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;
    use crate::flows::TaskAction;

    #[test]
    fn test_start_leads_to_completed() {
        let (factory, _runtime) = test_factory("-P", "Analyse monthly sales.");
        let flow = master_planner_flow(factory).unwrap();
        assert_eq!(flow.start_stage, STAGE_START);
        assert!(flow.is_stop_stage(STAGE_COMPLETED));
        assert_eq!(
            flow.get_next_stage(STAGE_START, "finished", TaskAction::Continue)
                .unwrap(),
            STAGE_COMPLETED
        );
    }
}
