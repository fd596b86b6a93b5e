//! The task flow engine.
//!
//! A flow is a directed graph of stage nodes held in an arena keyed by stage
//! id. Each node owns its agents, evaluators and a transition map from
//! `(agent state, action)` to the next stage. Node declarations accept
//! several sugar forms; `TaskFlow::new` canonicalises them into the full
//! nested map and normalises the default actions.

use std::collections::HashMap;
use std::io::Write;
use std::time::Instant;

use thiserror::Error;

use crate::agents::{AgentFactory, AgentState, AGENT_STATE_ERROR};
use crate::evaluation::{EvalType, EvaluationRecord};
use crate::evaluators::create_evaluator;
use crate::outputs;

/// Conventional stage names.
pub const STAGE_START: &str = "start";
pub const STAGE_COMPLETED: &str = "completed";
pub const STAGE_GLOBAL_FINISHED: &str = "global_finished";

/// Wildcard key matching any state or action.
pub const MATCH_ANY: &str = "*";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("unknown flow: {0}")]
    UnknownFlow(String),
    #[error("unknown stage: {0}")]
    UnknownStage(String),
    #[error("no agent for stage `{0}`")]
    NoAgent(String),
    #[error("no next stage for stage `{stage}`, state `{state}`, action `{action}`")]
    NoTransition {
        stage: String,
        state: String,
        action: String,
    },
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("stage `{0}` declares both next_stage and states")]
    AmbiguousTransition(String),
}

/// Action chosen at a stage boundary, by policy or by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskAction {
    Default,
    Continue,
    Retry,
    Skip,
    Stop,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Default => MATCH_ANY,
            TaskAction::Continue => "continue",
            TaskAction::Retry => "retry",
            TaskAction::Skip => "skip",
            TaskAction::Stop => "stop",
        }
    }
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map user input to an action: `c`/empty continue, `r` retry, `k` skip,
/// `s` stop; longer inputs may prefix the action word. Anything else fails
/// fast.
pub fn match_action(input: &str) -> Result<TaskAction, FlowError> {
    let input = input.trim().to_lowercase();
    if input.is_empty() || input == "c" || (input.len() > 1 && "continue".starts_with(&input)) {
        Ok(TaskAction::Continue)
    } else if input == "r" || (input.len() > 1 && "retry".starts_with(&input)) {
        Ok(TaskAction::Retry)
    } else if input == "k" || (input.len() > 1 && "skip".starts_with(&input)) {
        Ok(TaskAction::Skip)
    } else if input == "s" || (input.len() > 1 && "stop".starts_with(&input)) {
        Ok(TaskAction::Stop)
    } else {
        Err(FlowError::UnknownAction(input))
    }
}

/// Target of one transition edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageNext {
    pub action: Option<TaskAction>,
    pub stage: String,
    pub message: String,
}

impl StageNext {
    pub fn stage(stage: &str) -> StageNext {
        StageNext {
            action: None,
            stage: stage.to_string(),
            message: String::new(),
        }
    }

    pub fn on(action: TaskAction, stage: &str) -> StageNext {
        StageNext {
            action: Some(action),
            stage: stage.to_string(),
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: &str) -> StageNext {
        self.message = message.to_string();
        self
    }
}

/// Sugar forms accepted where a transition target is declared.
#[derive(Debug, Clone)]
pub enum NextSpec {
    /// A bare stage name.
    Stage(&'static str),
    /// A single target, optionally bound to an action.
    Next(StageNext),
    /// Several targets, each bound to its action.
    List(Vec<StageNext>),
}

/// Declarative form of one stage node.
#[derive(Debug, Clone)]
pub struct StageTransition {
    pub stage: &'static str,
    pub agents: Vec<&'static str>,
    pub evaluators: Vec<&'static str>,
    /// Transition targets keyed by agent-state key.
    pub states: Vec<(&'static str, NextSpec)>,
    /// Unconditional target; mutually exclusive with `states`.
    pub next_stage: Option<NextSpec>,
}

impl StageTransition {
    pub fn new(stage: &'static str, agents: Vec<&'static str>) -> StageTransition {
        StageTransition {
            stage,
            agents,
            evaluators: Vec::new(),
            states: Vec::new(),
            next_stage: None,
        }
    }

    pub fn next(mut self, next: NextSpec) -> StageTransition {
        self.next_stage = Some(next);
        self
    }

    pub fn state(mut self, state: &'static str, next: NextSpec) -> StageTransition {
        self.states.push((state, next));
        self
    }

    pub fn evaluators(mut self, evaluators: Vec<&'static str>) -> StageTransition {
        self.evaluators = evaluators;
        self
    }
}

/// Canonicalised stage node.
#[derive(Debug, Clone)]
struct StageNode {
    stage: String,
    agents: Vec<String>,
    evaluators: Vec<String>,
    /// state key -> action -> target. `MATCH_ANY` keys catch the rest.
    states: HashMap<String, HashMap<TaskAction, StageNext>>,
}

/// Declarative form of a whole flow.
#[derive(Debug, Clone)]
pub struct FlowDefinition {
    pub name: &'static str,
    pub start_stage: &'static str,
    pub stop_stages: Vec<&'static str>,
    pub transitions: Vec<StageTransition>,
    pub flow_evaluator: Option<&'static str>,
    pub global_evaluator: Option<&'static str>,
}

// ---------------------------------------------------------------------------
// Confirm input
// ---------------------------------------------------------------------------

/// Source of the user's stage-confirm answers. `read_action` returning an
/// error cancels the flow immediately.
pub trait ConfirmInput: Send + Sync {
    fn read_action(&mut self, prompt: &str) -> anyhow::Result<String>;
}

/// Reads confirm answers from stdin.
#[derive(Debug, Default)]
pub struct StdinConfirm;

impl ConfirmInput for StdinConfirm {
    fn read_action(&mut self, prompt: &str) -> anyhow::Result<String> {
        print!("{prompt} ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        let read = std::io::stdin().read_line(&mut line)?;
        if read == 0 {
            anyhow::bail!("confirm input closed");
        }
        Ok(line)
    }
}

/// Replays canned confirm answers; used by tests and non-interactive runs.
#[derive(Debug, Default)]
pub struct AutoConfirm {
    pub answers: std::collections::VecDeque<String>,
}

impl AutoConfirm {
    pub fn replying(answers: &[&str]) -> AutoConfirm {
        AutoConfirm {
            answers: answers.iter().map(|answer| answer.to_string()).collect(),
        }
    }
}

impl ConfirmInput for AutoConfirm {
    fn read_action(&mut self, _prompt: &str) -> anyhow::Result<String> {
        self.answers
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no confirm answer scripted"))
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

fn canonicalize(spec: NextSpec) -> HashMap<TaskAction, StageNext> {
    let mut map = HashMap::new();
    match spec {
        NextSpec::Stage(stage) => {
            map.insert(TaskAction::Default, StageNext::stage(stage));
        }
        NextSpec::Next(next) => {
            map.insert(next.action.unwrap_or(TaskAction::Default), next);
        }
        NextSpec::List(nexts) => {
            for next in nexts {
                map.insert(next.action.unwrap_or(TaskAction::Default), next);
            }
        }
    }
    map
}

/// A runnable flow: an arena of stage nodes plus the execution policy.
pub struct TaskFlow {
    pub name: String,
    pub start_stage: String,
    stop_stages: Vec<String>,
    nodes: Vec<StageNode>,
    index: HashMap<String, usize>,
    flow_evaluator: Option<String>,
    global_evaluator: Option<String>,
    factory: AgentFactory,
    confirm: Box<dyn ConfirmInput>,
}

impl std::fmt::Debug for TaskFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFlow")
            .field("name", &self.name)
            .field("start_stage", &self.start_stage)
            .field("stages", &self.nodes.len())
            .finish()
    }
}

impl TaskFlow {
    /// Canonicalise and normalise a flow definition.
    ///
    /// Every state map ends up with `CONTINUE` (falling back to the default
    /// target), `RETRY` (self), `STOP` (self) and `SKIP` (same as continue)
    /// defined, and the synthetic error state transitions back to the node
    /// itself under any action.
    pub fn new(definition: FlowDefinition, factory: AgentFactory) -> Result<TaskFlow, FlowError> {
        let mut nodes = Vec::new();
        let mut index = HashMap::new();
        for transition in definition.transitions {
            if transition.next_stage.is_some() && !transition.states.is_empty() {
                return Err(FlowError::AmbiguousTransition(transition.stage.to_string()));
            }
            let mut states: HashMap<String, HashMap<TaskAction, StageNext>> = HashMap::new();
            if let Some(next) = transition.next_stage {
                states.insert(MATCH_ANY.to_string(), canonicalize(next));
            }
            for (state, next) in transition.states {
                states.insert(state.to_string(), canonicalize(next));
            }
            for actions in states.values_mut() {
                if !actions.contains_key(&TaskAction::Continue) {
                    if let Some(default) = actions.get(&TaskAction::Default).cloned() {
                        actions.insert(TaskAction::Continue, default);
                    }
                }
                actions
                    .entry(TaskAction::Retry)
                    .or_insert_with(|| StageNext::stage(transition.stage));
                actions
                    .entry(TaskAction::Stop)
                    .or_insert_with(|| StageNext::stage(transition.stage));
                if !actions.contains_key(&TaskAction::Skip) {
                    if let Some(cont) = actions.get(&TaskAction::Continue).cloned() {
                        actions.insert(TaskAction::Skip, cont);
                    }
                }
            }
            states.entry(AGENT_STATE_ERROR.to_string()).or_insert_with(|| {
                let mut actions = HashMap::new();
                actions.insert(TaskAction::Default, StageNext::stage(transition.stage));
                actions
            });
            index.insert(transition.stage.to_string(), nodes.len());
            nodes.push(StageNode {
                stage: transition.stage.to_string(),
                agents: transition.agents.iter().map(|name| name.to_string()).collect(),
                evaluators: transition
                    .evaluators
                    .iter()
                    .map(|name| name.to_string())
                    .collect(),
                states,
            });
        }
        Ok(TaskFlow {
            name: definition.name.to_string(),
            start_stage: definition.start_stage.to_string(),
            stop_stages: definition
                .stop_stages
                .iter()
                .map(|stage| stage.to_string())
                .collect(),
            nodes,
            index,
            flow_evaluator: definition.flow_evaluator.map(str::to_string),
            global_evaluator: definition.global_evaluator.map(str::to_string),
            factory,
            confirm: Box::new(StdinConfirm),
        })
    }

    /// Replace the confirm-input source.
    pub fn set_confirm(&mut self, confirm: Box<dyn ConfirmInput>) {
        self.confirm = confirm;
    }

    pub fn is_stop_stage(&self, stage: &str) -> bool {
        self.stop_stages.iter().any(|stop| stop == stage)
    }

    fn node(&self, stage: &str) -> Result<&StageNode, FlowError> {
        self.index
            .get(stage)
            .map(|&idx| &self.nodes[idx])
            .ok_or_else(|| FlowError::UnknownStage(stage.to_string()))
    }

    fn next_transition(
        &self,
        stage: &str,
        state: &str,
        action: TaskAction,
    ) -> Result<&StageNext, FlowError> {
        let node = self.node(stage)?;
        let actions = node
            .states
            .get(state)
            .or_else(|| node.states.get(MATCH_ANY))
            .ok_or_else(|| FlowError::NoTransition {
                stage: stage.to_string(),
                state: state.to_string(),
                action: action.to_string(),
            })?;
        actions
            .get(&action)
            .or_else(|| actions.get(&TaskAction::Default))
            .ok_or_else(|| FlowError::NoTransition {
                stage: stage.to_string(),
                state: state.to_string(),
                action: action.to_string(),
            })
    }

    /// Resolve the next stage for `(stage, state, action)`.
    pub fn get_next_stage(
        &self,
        stage: &str,
        state: &str,
        action: TaskAction,
    ) -> Result<String, FlowError> {
        Ok(self.next_transition(stage, state, action)?.stage.clone())
    }

    fn confirm_prompt(&self, stage: &str, state: &str, failed: bool) -> String {
        let (next, message) = match self.next_transition(stage, state, TaskAction::Continue) {
            Ok(next) => (next.stage.clone(), next.message.clone()),
            Err(_) => (stage.to_string(), String::new()),
        };
        if failed {
            let message = if message.is_empty() {
                format!("Stage `{stage}` FAILED!")
            } else {
                message
            };
            format!(
                "{message}\n Continue from stage `{next}`? \n\
                 (C)ontinue, (R)etry, s(K)ip, (S)top, default `continue`"
            )
        } else {
            format!(
                "{message}\n Continue to stage `{next}`? \n\
                 (C)ontinue, (R)etry, s(K)ip, (S)top, default `continue`"
            )
        }
    }

    fn persist_stage(&self, stage: &str) {
        self.factory
            .context
            .with_task(|task| task.stage = Some(stage.to_string()));
        if let Err(err) = self.factory.context.update_cell() {
            outputs::warn(format!("failed to persist stage `{stage}`: {err}"));
        }
    }

    fn cell_index(&self) -> i64 {
        self.factory
            .context
            .with_task(|task| task.cell_idx.map(|idx| idx as i64).unwrap_or(-1))
    }

    fn stamp_record(
        &self,
        mut record: EvaluationRecord,
        stage: &str,
        agent: &str,
        duration: f64,
        stage_count: i64,
    ) -> EvaluationRecord {
        if record.flow.is_empty() {
            record.flow = self.name.clone();
        }
        if record.stage.is_empty() {
            record.stage = stage.to_string();
        }
        if record.agent.is_empty() {
            record.agent = agent.to_string();
        }
        if record.cell_index < 0 {
            record.cell_index = self.cell_index();
        }
        if record.execution_duration == 0.0 {
            record.execution_duration = duration;
        }
        record.stage_count = stage_count;
        record
    }

    async fn evaluate_stage(
        &self,
        node: &StageNode,
        stage: &str,
        agent: &str,
        duration: f64,
        stage_count: i64,
        failed: bool,
    ) {
        if node.evaluators.is_empty() {
            let record = EvaluationRecord {
                eval_type: EvalType::Stage,
                is_success: !failed,
                correct_score: if failed { 0.0 } else { 1.0 },
                ..Default::default()
            };
            outputs::output_evaluation(self.stamp_record(record, stage, agent, duration, stage_count));
            return;
        }
        for name in &node.evaluators {
            match create_evaluator(&self.factory, name) {
                Ok(mut evaluator) => match evaluator.evaluate().await {
                    Ok(record) => outputs::output_evaluation(
                        self.stamp_record(record, stage, agent, duration, stage_count),
                    ),
                    Err(err) => outputs::warn(format!("evaluator `{name}` failed: {err}")),
                },
                Err(err) => outputs::warn(format!("evaluator `{name}` unavailable: {err}")),
            }
        }
    }

    /// Emit the terminal flow/notebook record for a cleanly finished run.
    async fn evaluate_termination(&self, stage: &str, duration: f64, stage_count: i64) {
        if stage == STAGE_GLOBAL_FINISHED {
            let record = match &self.global_evaluator {
                Some(name) => match create_evaluator(&self.factory, name) {
                    Ok(mut evaluator) => evaluator.evaluate().await.ok(),
                    Err(_) => None,
                },
                None => None,
            }
            .unwrap_or_else(|| EvaluationRecord {
                eval_type: EvalType::Notebook,
                evaluator: "bot".to_string(),
                is_success: true,
                correct_score: 1.0,
                ..Default::default()
            });
            outputs::output_evaluation(self.stamp_record(record, stage, "", duration, stage_count));
        } else if stage == STAGE_COMPLETED {
            let record = match &self.flow_evaluator {
                Some(name) => match create_evaluator(&self.factory, name) {
                    Ok(mut evaluator) => evaluator.evaluate().await.ok(),
                    Err(_) => None,
                },
                None => None,
            }
            .unwrap_or_else(|| EvaluationRecord {
                eval_type: EvalType::Flow,
                evaluator: "bot".to_string(),
                is_success: true,
                correct_score: 1.0,
                ..Default::default()
            });
            outputs::output_evaluation(self.stamp_record(record, stage, "", duration, stage_count));
        }
    }

    /// Execute the flow from `start` (or its declared start stage).
    ///
    /// `max_tries` bounds the failed stage attempts, `stage_continue=false`
    /// stops after one iteration, and `stage_confirm` routes every stage
    /// boundary through the confirm input.
    pub async fn run(
        &mut self,
        start: Option<&str>,
        max_tries: u32,
        stage_continue: bool,
        stage_confirm: bool,
    ) -> anyhow::Result<String> {
        let mut stage = match start {
            Some(stage) if !stage.is_empty() => stage.to_string(),
            _ => self.start_stage.clone(),
        };
        let flow_started = Instant::now();
        let mut n_tries: u32 = 0;
        let mut stage_count: i64 = 0;
        let mut finished_cleanly = false;

        loop {
            outputs::set_stage(&stage);
            stage_count += 1;
            let node = self.node(&stage)?.clone();
            if node.agents.is_empty() {
                return Err(FlowError::NoAgent(stage.clone()).into());
            }

            // Run the node's agents in declared order; the last agent's
            // return is the stage outcome.
            let stage_started = Instant::now();
            let mut outcome = (false, AgentState::Finished);
            for agent_name in &node.agents {
                let mut agent = self.factory.create(agent_name)?;
                outputs::output_markdown(&format!(
                    "**Executing** stage `{stage}` with agent `{}` ...",
                    agent.name()
                ));
                match agent.call().await {
                    Ok(result) => outcome = result,
                    Err(err) => {
                        outputs::error(format!(
                            "error during stage `{stage}` agent `{agent_name}`: {err}"
                        ));
                        outcome = (true, AgentState::Error);
                        break;
                    }
                }
            }
            let (failed, state) = outcome;
            let duration = stage_started.elapsed().as_secs_f64();
            let last_agent = node.agents.last().cloned().unwrap_or_default();
            self.evaluate_stage(&node, &stage, &last_agent, duration, stage_count, failed)
                .await;

            // A non-error outcome advances the resumable stage marker even
            // before any confirm round.
            let mut next_stage: Option<String> = None;
            if state != AgentState::Error {
                let next = self.get_next_stage(&stage, state.key(), TaskAction::Continue)?;
                self.persist_stage(&next);
                if self.is_stop_stage(&next) {
                    outputs::output_markdown(&format!(
                        "Task execution **stopped** at stage `{next}`"
                    ));
                    stage = next;
                    finished_cleanly = true;
                    break;
                }
                next_stage = Some(next);
            }

            if failed {
                n_tries += 1;
                if n_tries > max_tries {
                    outputs::output_markdown(&format!(
                        "**Max tries reached** during stage `{stage}`, stopping"
                    ));
                    break;
                }
            }

            if stage_confirm {
                let prompt = self.confirm_prompt(&stage, state.key(), failed);
                outputs::output_markdown(&format!("**Confirm**: {prompt}"));
                let input = self.confirm.read_action(&prompt)?;
                let action = match_action(&input)?;
                let next = self.get_next_stage(&stage, state.key(), action)?;
                self.persist_stage(&next);
                if action == TaskAction::Stop {
                    outputs::output_markdown(&format!(
                        "Task execution **stopped**, next stage set to `{next}`"
                    ));
                    stage = next;
                    break;
                }
                outputs::output_markdown(&format!("**Action** `{action}` transits stage to `{next}`"));
                stage = next;
            } else if let Some(next) = next_stage {
                outputs::output_markdown(&format!("**Transits** stage to `{next}`"));
                stage = next;
            }

            if !stage_continue {
                break;
            }
        }

        self.persist_stage(&stage);
        if finished_cleanly {
            self.evaluate_termination(&stage, flow_started.elapsed().as_secs_f64(), stage_count)
                .await;
        }
        outputs::flush_output(true);
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::test_factory;

    fn simple_definition() -> FlowDefinition {
        FlowDefinition {
            name: "test_flow",
            start_stage: "executing",
            stop_stages: vec![STAGE_COMPLETED],
            transitions: vec![
                StageTransition::new("executing", vec!["CodeExecutor"])
                    .state("true", NextSpec::Stage("summary"))
                    .state("false", NextSpec::Stage("debugging")),
                StageTransition::new("summary", vec!["TaskSummaryAgent"])
                    .next(NextSpec::Stage(STAGE_COMPLETED)),
                StageTransition::new("debugging", vec!["CodeDebuggerAgent"])
                    .next(NextSpec::Stage("executing")),
            ],
            flow_evaluator: None,
            global_evaluator: None,
        }
    }

    fn flow() -> TaskFlow {
        let (factory, _runtime) = test_factory("-s executing", "print(1)");
        TaskFlow::new(simple_definition(), factory).unwrap()
    }

    #[test]
    fn test_match_action_table() {
        assert_eq!(match_action("").unwrap(), TaskAction::Continue);
        assert_eq!(match_action("c").unwrap(), TaskAction::Continue);
        assert_eq!(match_action("cont").unwrap(), TaskAction::Continue);
        assert_eq!(match_action("r").unwrap(), TaskAction::Retry);
        assert_eq!(match_action("re").unwrap(), TaskAction::Retry);
        assert_eq!(match_action("k").unwrap(), TaskAction::Skip);
        assert_eq!(match_action("sk").unwrap(), TaskAction::Skip);
        assert_eq!(match_action("s").unwrap(), TaskAction::Stop);
        assert_eq!(match_action("st").unwrap(), TaskAction::Stop);
        assert_eq!(match_action(" C \n").unwrap(), TaskAction::Continue);
        assert!(match_action("x").is_err());
        assert!(match_action("continueplease").is_err());
    }

    #[test]
    fn test_normalisation_fills_all_actions() {
        let flow = flow();
        let node = flow.node("executing").unwrap();
        let actions = &node.states["true"];
        assert!(actions.contains_key(&TaskAction::Continue));
        assert!(actions.contains_key(&TaskAction::Retry));
        assert!(actions.contains_key(&TaskAction::Stop));
        assert!(actions.contains_key(&TaskAction::Skip));
        // RETRY and STOP default to the node itself.
        assert_eq!(actions[&TaskAction::Retry].stage, "executing");
        assert_eq!(actions[&TaskAction::Stop].stage, "executing");
        // SKIP defaults to CONTINUE.
        assert_eq!(actions[&TaskAction::Skip].stage, actions[&TaskAction::Continue].stage);
        // Synthetic error state transitions back to the node itself.
        let error_actions = &node.states[AGENT_STATE_ERROR];
        assert_eq!(error_actions[&TaskAction::Default].stage, "executing");
    }

    #[test]
    fn test_transitions_resolve() {
        let flow = flow();
        assert_eq!(
            flow.get_next_stage("executing", "true", TaskAction::Continue).unwrap(),
            "summary"
        );
        assert_eq!(
            flow.get_next_stage("executing", "false", TaskAction::Continue).unwrap(),
            "debugging"
        );
        // A state with no entry falls back to the wildcard.
        assert_eq!(
            flow.get_next_stage("summary", "finished", TaskAction::Continue).unwrap(),
            STAGE_COMPLETED
        );
        assert_eq!(
            flow.get_next_stage("executing", AGENT_STATE_ERROR, TaskAction::Continue)
                .unwrap(),
            "executing"
        );
        assert!(matches!(
            flow.get_next_stage("nowhere", "true", TaskAction::Continue),
            Err(FlowError::UnknownStage(_))
        ));
    }

    #[test]
    fn test_ambiguous_transition_rejected() {
        let (factory, _runtime) = test_factory("-s executing", "print(1)");
        let definition = FlowDefinition {
            name: "bad",
            start_stage: "stage_a",
            stop_stages: vec![],
            transitions: vec![StageTransition::new("stage_a", vec!["CodeExecutor"])
                .next(NextSpec::Stage("stage_b"))
                .state("true", NextSpec::Stage("stage_c"))],
            flow_evaluator: None,
            global_evaluator: None,
        };
        assert!(matches!(
            TaskFlow::new(definition, factory),
            Err(FlowError::AmbiguousTransition(_))
        ));
    }

    #[test]
    fn test_stage_next_list_sugar() {
        let (factory, _runtime) = test_factory("-s executing", "print(1)");
        let definition = FlowDefinition {
            name: "sugar",
            start_stage: "stage_a",
            stop_stages: vec![STAGE_COMPLETED],
            transitions: vec![StageTransition::new("stage_a", vec!["CodeExecutor"]).next(
                NextSpec::List(vec![
                    StageNext::stage(STAGE_COMPLETED),
                    StageNext::on(TaskAction::Stop, "stage_b"),
                ]),
            )],
            flow_evaluator: None,
            global_evaluator: None,
        };
        let flow = TaskFlow::new(definition, factory).unwrap();
        assert_eq!(
            flow.get_next_stage("stage_a", "finished", TaskAction::Continue).unwrap(),
            STAGE_COMPLETED
        );
        assert_eq!(
            flow.get_next_stage("stage_a", "finished", TaskAction::Stop).unwrap(),
            "stage_b"
        );
    }
}
