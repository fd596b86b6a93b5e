//! Subtask executor flow: plan, code, execute, debug on failure, summarise,
//! prepare the next cell.

use crate::agents::AgentFactory;

use super::base::{
    FlowDefinition, FlowError, NextSpec, StageNext, StageTransition, TaskAction, TaskFlow,
    STAGE_COMPLETED, STAGE_GLOBAL_FINISHED,
};

pub const STAGE_PLANNING: &str = "planning";
pub const STAGE_PLANNING_PAUSED: &str = "planning_paused";
pub const STAGE_REQUEST_INFO: &str = "request_info";
pub const STAGE_CODING: &str = "coding";
pub const STAGE_EXECUTING: &str = "executing";
pub const STAGE_DEBUGGING: &str = "debugging";
pub const STAGE_REASONING: &str = "reasoning";
pub const STAGE_SUMMARY: &str = "summary";
pub const STAGE_CONFIRM_INFO: &str = "confirm_info";
pub const STAGE_PREPARE_NEXT: &str = "prepare_next";
pub const STAGE_OUTPUT_RESULT: &str = "output_result";

fn planner_states(transition: StageTransition) -> StageTransition {
    transition
        .state("coding_planned", NextSpec::Stage(STAGE_CODING))
        .state("reasoning_planned", NextSpec::Stage(STAGE_REASONING))
        .state("request_info", NextSpec::Stage(STAGE_REQUEST_INFO))
        .state("global_finished", NextSpec::Stage(STAGE_GLOBAL_FINISHED))
}

/// Build the subtask executor flow.
///
/// Happy path: planning -> coding -> executing -> summary -> prepare_next ->
/// completed. Executor failures detour through debugging; reasoning subtasks
/// skip coding/executing; request-info outcomes pause the flow after asking
/// the user.
pub fn task_executor_flow(factory: AgentFactory) -> Result<TaskFlow, FlowError> {
    TaskFlow::new(
        FlowDefinition {
            name: "task_executor",
            start_stage: STAGE_PLANNING,
            stop_stages: vec![STAGE_COMPLETED, STAGE_PLANNING_PAUSED, STAGE_GLOBAL_FINISHED],
            transitions: vec![
                planner_states(StageTransition::new(STAGE_PLANNING, vec!["TaskPlannerAgent"])),
                // Resuming at the paused stage replans with the supplied info.
                planner_states(StageTransition::new(
                    STAGE_PLANNING_PAUSED,
                    vec!["TaskPlannerAgent"],
                )),
                StageTransition::new(STAGE_REQUEST_INFO, vec!["RequestAboveUserSupplyAgent"])
                    .next(NextSpec::Stage(STAGE_PLANNING_PAUSED)),
                StageTransition::new(STAGE_CODING, vec!["TaskCodingAgent"])
                    .next(NextSpec::Stage(STAGE_EXECUTING)),
                StageTransition::new(STAGE_EXECUTING, vec!["CodeExecutor"])
                    .state("true", NextSpec::Stage(STAGE_SUMMARY))
                    .state("false", NextSpec::Stage(STAGE_DEBUGGING)),
                StageTransition::new(STAGE_DEBUGGING, vec!["CodeDebuggerAgent"])
                    .next(NextSpec::Stage(STAGE_EXECUTING)),
                StageTransition::new(STAGE_REASONING, vec!["TaskReasoningAgent"])
                    .state("done", NextSpec::Stage(STAGE_PREPARE_NEXT))
                    .state("request_info", NextSpec::Stage(STAGE_CONFIRM_INFO)),
                StageTransition::new(STAGE_SUMMARY, vec!["TaskSummaryAgent"])
                    .state(
                        "done",
                        NextSpec::List(vec![
                            StageNext::stage(STAGE_PREPARE_NEXT),
                            StageNext::on(TaskAction::Stop, STAGE_EXECUTING),
                        ]),
                    )
                    .state("request_info", NextSpec::Stage(STAGE_CONFIRM_INFO)),
                StageTransition::new(STAGE_CONFIRM_INFO, vec!["RequestBelowUserSupplyAgent"])
                    .next(NextSpec::Stage(STAGE_PREPARE_NEXT)),
                StageTransition::new(STAGE_PREPARE_NEXT, vec!["PrepareNextCell"])
                    .next(NextSpec::Stage(STAGE_COMPLETED)),
                // Re-running a finished cell re-executes the code, then
                // re-renders the stored result.
                StageTransition::new(STAGE_COMPLETED, vec!["CodeExecutor"])
                    .state("true", NextSpec::Stage(STAGE_OUTPUT_RESULT))
                    .state("false", NextSpec::Stage(STAGE_DEBUGGING)),
                StageTransition::new(STAGE_OUTPUT_RESULT, vec!["OutputTaskResult"])
                    .next(NextSpec::Stage(STAGE_COMPLETED)),
                StageTransition::new(STAGE_GLOBAL_FINISHED, vec!["OutputTaskResult"])
                    .next(NextSpec::Stage(STAGE_GLOBAL_FINISHED)),
            ],
            flow_evaluator: Some("flow_task_executor"),
            global_evaluator: None,
        },
        factory,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;

    #[test]
    fn test_graph_shape() {
        let (factory, _runtime) = test_factory("-s planning", "body");
        let flow = task_executor_flow(factory).unwrap();
        assert_eq!(flow.start_stage, STAGE_PLANNING);
        for stop in [STAGE_COMPLETED, STAGE_PLANNING_PAUSED, STAGE_GLOBAL_FINISHED] {
            assert!(flow.is_stop_stage(stop));
        }
        let continue_to = |stage, state| {
            flow.get_next_stage(stage, state, TaskAction::Continue).unwrap()
        };
        assert_eq!(continue_to(STAGE_PLANNING, "coding_planned"), STAGE_CODING);
        assert_eq!(continue_to(STAGE_PLANNING, "reasoning_planned"), STAGE_REASONING);
        assert_eq!(continue_to(STAGE_PLANNING, "request_info"), STAGE_REQUEST_INFO);
        assert_eq!(continue_to(STAGE_PLANNING, "global_finished"), STAGE_GLOBAL_FINISHED);
        assert_eq!(continue_to(STAGE_CODING, "finished"), STAGE_EXECUTING);
        assert_eq!(continue_to(STAGE_EXECUTING, "true"), STAGE_SUMMARY);
        assert_eq!(continue_to(STAGE_EXECUTING, "false"), STAGE_DEBUGGING);
        assert_eq!(continue_to(STAGE_DEBUGGING, "finished"), STAGE_EXECUTING);
        assert_eq!(continue_to(STAGE_SUMMARY, "done"), STAGE_PREPARE_NEXT);
        assert_eq!(continue_to(STAGE_SUMMARY, "request_info"), STAGE_CONFIRM_INFO);
        assert_eq!(continue_to(STAGE_PREPARE_NEXT, "finished"), STAGE_COMPLETED);
        assert_eq!(continue_to(STAGE_COMPLETED, "true"), STAGE_OUTPUT_RESULT);
        // Stopping at summary re-runs the executor instead.
        assert_eq!(
            flow.get_next_stage(STAGE_SUMMARY, "done", TaskAction::Stop).unwrap(),
            STAGE_EXECUTING
        );
    }
}
