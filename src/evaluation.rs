//! Evaluation records and the batch notebook runner.
//!
//! Stage, flow and notebook records are emitted by the flow engine through
//! the output sink and harvested from the saved notebook by the runner,
//! which appends them to a JSONL file while replaying editor-side actions
//! between cell executions.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actions::{Action, ActionPayload, SetCellContentParams};
use crate::contexts::{CellRunResult, ContextError, NotebookCell, NotebookFile, NotebookRuntime};
use crate::outputs::{META_ACTION_RECORDS, META_DATA, META_DATA_STORE, META_DATA_TIMESTAMP,
    META_EVALUATION_RECORDS};

/// Metadata key storing the newest applied action timestamp on a cell.
pub const META_ACTION_TIMESTAMP: &str = "jupyter-agent-action-timestamp";

/// Preamble marker of an evaluation output notebook.
const EVALUATION_PREAMBLE: &str = "# -*- Jupyter Agent Evaluation Notebook -*-";

fn now_unix() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Discriminator of an evaluation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvalType {
    Base,
    Stage,
    Flow,
    Notebook,
}

impl EvalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalType::Base => "BASE",
            EvalType::Stage => "STAGE",
            EvalType::Flow => "FLOW",
            EvalType::Notebook => "NOTEBOOK",
        }
    }
}

impl Default for EvalType {
    fn default() -> Self {
        EvalType::Base
    }
}

/// One scored evaluation, one JSON object per JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub notebook_name: String,
    #[serde(default)]
    pub evaluator: String,
    #[serde(default)]
    pub eval_type: EvalType,
    #[serde(default = "default_cell_index")]
    pub cell_index: i64,
    #[serde(default)]
    pub flow: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub flow_count: i64,
    #[serde(default)]
    pub stage_count: i64,
    #[serde(default)]
    pub execution_duration: f64,
    #[serde(default)]
    pub is_stopped: bool,
    #[serde(default)]
    pub is_success: bool,
    #[serde(default)]
    pub correct_score: f64,
    #[serde(default)]
    pub planning_score: f64,
    #[serde(default)]
    pub reasoning_score: f64,
    #[serde(default)]
    pub coding_score: f64,
    #[serde(default)]
    pub important_score: f64,
    #[serde(default)]
    pub user_supply_score: f64,
}

fn default_cell_index() -> i64 {
    -1
}

impl Default for EvaluationRecord {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            notebook_name: String::new(),
            evaluator: String::new(),
            eval_type: EvalType::Base,
            cell_index: -1,
            flow: String::new(),
            stage: String::new(),
            agent: String::new(),
            flow_count: 0,
            stage_count: 0,
            execution_duration: 0.0,
            is_stopped: false,
            is_success: false,
            correct_score: 0.0,
            planning_score: 0.0,
            reasoning_score: 0.0,
            coding_score: 0.0,
            important_score: 0.0,
            user_supply_score: 0.0,
        }
    }
}

impl EvaluationRecord {
    pub fn stage(flow: &str, stage: &str, agent: &str) -> Self {
        Self {
            eval_type: EvalType::Stage,
            flow: flow.to_string(),
            stage: stage.to_string(),
            agent: agent.to_string(),
            ..Default::default()
        }
    }

    pub fn flow(flow: &str, evaluator: &str) -> Self {
        Self {
            eval_type: EvalType::Flow,
            flow: flow.to_string(),
            evaluator: evaluator.to_string(),
            ..Default::default()
        }
    }

    pub fn notebook(evaluator: &str) -> Self {
        Self {
            eval_type: EvalType::Notebook,
            evaluator: evaluator.to_string(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Batch runner
// ---------------------------------------------------------------------------

/// Options for one batch run.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub output_path: Option<PathBuf>,
    pub evaluate_path: Option<PathBuf>,
    pub reset_output: bool,
    pub max_cells: usize,
    pub skip_cells_with_tag: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            output_path: None,
            evaluate_path: None,
            reset_output: false,
            max_cells: 20,
            skip_cells_with_tag: "skip-execution".to_string(),
        }
    }
}

/// Executes a notebook file end-to-end through the interactive runtime,
/// replaying editor-side actions between executions and collecting
/// evaluation records into a JSONL file.
#[derive(Debug)]
pub struct NotebookRunner {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub evaluate_path: PathBuf,
    options: RunnerOptions,
    notebook: NotebookFile,
    start_time: f64,
    is_global_finished: bool,
}

impl NotebookRunner {
    pub fn new(input_path: &Path, options: RunnerOptions) -> Result<NotebookRunner, ContextError> {
        let input_path = input_path.with_extension("ipynb");
        let suffix = Utc::now().timestamp().to_string();
        let stem = input_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("notebook");
        let parent = input_path.parent().unwrap_or_else(|| Path::new("."));
        let output_path = options
            .output_path
            .clone()
            .unwrap_or_else(|| parent.join(format!("{stem}_{suffix}.ipynb")));
        let evaluate_path = options
            .evaluate_path
            .clone()
            .unwrap_or_else(|| parent.join(format!("{stem}_{suffix}.jsonl")));

        if options.reset_output {
            let _ = std::fs::remove_file(&output_path);
            let _ = std::fs::remove_file(&evaluate_path);
        }

        let notebook = NotebookFile::read(&input_path)?;
        Ok(NotebookRunner {
            input_path,
            output_path,
            evaluate_path,
            options,
            notebook,
            start_time: 0.0,
            is_global_finished: false,
        })
    }

    fn save_evaluation_record(&self, record: &EvaluationRecord) -> std::io::Result<()> {
        let eval_source = match record.eval_type {
            EvalType::Flow => format!("{}-{}", record.flow, record.evaluator),
            EvalType::Stage => format!(
                "{}-{}-{}-{}",
                record.flow, record.stage, record.agent, record.evaluator
            ),
            _ => record.evaluator.clone(),
        };
        log::info!(
            "CELL[{}] Evaluation: {}[{eval_source}] {} duration: {:.2}s correct: {:.2}",
            record.cell_index,
            record.eval_type.as_str(),
            if record.is_success { "SUCCESS" } else { "FAILURE" },
            record.execution_duration,
            record.correct_score,
        );
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.evaluate_path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    fn handle_cell_payloads(&mut self, cell_index: usize, payloads: &[Value]) {
        for payload in payloads {
            if payload.get("source").and_then(Value::as_str) == Some("set_next_input")
                && payload.get("replace").and_then(Value::as_bool) == Some(true)
            {
                let text = payload.get("text").and_then(Value::as_str).unwrap_or_default();
                self.notebook.cells[cell_index].source = text.into();
                log::info!("CELL[{cell_index}] Replacing cell source from set_next_input payload");
            }
        }
    }

    /// Promote the most recent agent-data display metadata into the cell's
    /// persistent metadata, keeping only monotonically increasing timestamps.
    fn handle_agent_data(&mut self, cell_index: usize, output_metas: &[serde_json::Map<String, Value>]) {
        let cell = &mut self.notebook.cells[cell_index];
        let stored_ts = cell
            .metadata
            .get(META_DATA_TIMESTAMP)
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let mut newest_ts = stored_ts;
        for meta in output_metas {
            let has_store = meta
                .get(META_DATA_STORE)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let ts = meta.get(META_DATA_TIMESTAMP).and_then(Value::as_f64).unwrap_or(0.0);
            let data = meta.get(META_DATA).and_then(Value::as_object);
            if has_store && ts > stored_ts {
                if let Some(data) = data.filter(|data| !data.is_empty()) {
                    newest_ts = newest_ts.max(ts);
                    cell.metadata.insert(META_DATA_STORE.to_string(), json!(true));
                    cell.metadata
                        .insert(META_DATA_TIMESTAMP.to_string(), json!(newest_ts));
                    let store = cell
                        .metadata
                        .entry(META_DATA.to_string())
                        .or_insert_with(|| json!({}));
                    if let Some(store) = store.as_object_mut() {
                        for (key, value) in data {
                            store.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }
    }

    fn handle_evaluation_records(
        &mut self,
        cell_index: usize,
        output_metas: &[serde_json::Map<String, Value>],
    ) -> std::io::Result<()> {
        let mut is_bot_cell = false;
        let mut is_flow_completed = false;
        let mut records: Vec<EvaluationRecord> = Vec::new();
        for meta in output_metas {
            let Some(raw_records) = meta.get(META_EVALUATION_RECORDS).and_then(Value::as_array)
            else {
                continue;
            };
            for raw in raw_records {
                let Ok(mut record) = serde_json::from_value::<EvaluationRecord>(raw.clone()) else {
                    log::warn!("CELL[{cell_index}] skipping unparseable evaluation record");
                    continue;
                };
                is_bot_cell = true;
                if record.timestamp == 0.0 {
                    record.timestamp = now_unix();
                }
                record.notebook_name = self.output_path.display().to_string();
                match record.eval_type {
                    EvalType::Notebook => {
                        record.execution_duration = now_unix() - self.start_time;
                        self.is_global_finished = true;
                        is_flow_completed = true;
                        self.notebook.cells.truncate(cell_index + 1);
                    }
                    EvalType::Flow => is_flow_completed = true,
                    _ => {}
                }
                records.push(record);
            }
        }
        for record in &records {
            self.save_evaluation_record(record)?;
        }
        if is_bot_cell && !is_flow_completed {
            self.save_evaluation_record(&EvaluationRecord {
                timestamp: now_unix(),
                notebook_name: self.output_path.display().to_string(),
                evaluator: "bot".to_string(),
                eval_type: EvalType::Flow,
                cell_index: cell_index as i64,
                is_success: false,
                ..Default::default()
            })?;
        }
        Ok(())
    }

    /// Apply one `set_cell_content` action; returns the index the current
    /// cell ends up at.
    fn handle_set_cell_content(
        &mut self,
        cell_index: usize,
        params: &SetCellContentParams,
    ) -> anyhow::Result<usize> {
        let mut metadata = params.metadata.clone();
        metadata.insert("tags".to_string(), json!(params.tags));
        let cell_type = match params.cell_type.as_str() {
            "code" | "markdown" | "raw" => params.cell_type.as_str(),
            other => anyhow::bail!("unsupported cell type: {other}"),
        };
        let new_cell = NotebookCell::new(cell_type, &params.source, metadata);
        if params.index == 0 {
            let current = &mut self.notebook.cells[cell_index];
            current.cell_type = new_cell.cell_type;
            current.source = new_cell.source;
            current.metadata = new_cell.metadata;
            log::info!("CELL[{cell_index}] Updated cell from set_cell_content action");
            Ok(cell_index)
        } else if params.index > 0 {
            let insert_idx =
                (cell_index + params.index as usize).min(self.notebook.cells.len());
            self.notebook.cells.insert(insert_idx, new_cell);
            log::info!("CELL[{cell_index}] Inserted cell at [{insert_idx}] from set_cell_content action");
            Ok(cell_index)
        } else if params.index == -1 {
            let current = self.notebook.cells[cell_index].clone();
            let displaced = NotebookCell::new(
                &current.cell_type,
                current.source_text(),
                current.metadata.clone(),
            );
            let slot = &mut self.notebook.cells[cell_index];
            slot.cell_type = new_cell.cell_type;
            slot.source = new_cell.source;
            slot.metadata = new_cell.metadata;
            let ret_idx = cell_index + 1;
            self.notebook.cells.insert(ret_idx, displaced);
            log::info!("CELL[{cell_index}] Inserted cell before current, focus moves to [{ret_idx}]");
            Ok(ret_idx)
        } else {
            anyhow::bail!("unsupported set_cell_content index: {}", params.index)
        }
    }

    /// Apply action records strictly newer than the cell's stored action
    /// timestamp; a re-emitted action is skipped by the timestamp compare.
    fn handle_actions(
        &mut self,
        cell_index: usize,
        output_metas: &[serde_json::Map<String, Value>],
    ) -> anyhow::Result<usize> {
        let stored_ts = self.notebook.cells[cell_index]
            .metadata
            .get(META_ACTION_TIMESTAMP)
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let mut newest_ts = stored_ts;
        let mut current_idx = cell_index;
        for meta in output_metas {
            let Some(raw_actions) = meta.get(META_ACTION_RECORDS).and_then(Value::as_array) else {
                continue;
            };
            for raw in raw_actions {
                let Ok(action) = serde_json::from_value::<Action>(raw.clone()) else {
                    log::warn!("CELL[{cell_index}] skipping unparseable action record");
                    continue;
                };
                if action.timestamp <= stored_ts {
                    continue;
                }
                newest_ts = newest_ts.max(action.timestamp);
                if let ActionPayload::SetCellContent(params) = &action.payload {
                    log::info!(
                        "CELL[{current_idx}] Action: {} - {} - {}",
                        action.action_name(),
                        action.source,
                        action.timestamp,
                    );
                    current_idx = self.handle_set_cell_content(current_idx, params)?;
                }
            }
        }
        self.notebook.cells[current_idx]
            .metadata
            .insert(META_ACTION_TIMESTAMP.to_string(), json!(newest_ts));
        Ok(current_idx)
    }

    fn on_notebook_start(&mut self) {
        self.start_time = now_unix();
        let has_preamble = self
            .notebook
            .cells
            .first()
            .map(|cell| cell.source_text().starts_with(EVALUATION_PREAMBLE))
            .unwrap_or(false);
        if !has_preamble {
            let mut metadata = serde_json::Map::new();
            metadata.insert("tags".to_string(), json!(["CTX_EXCLUDE"]));
            let source = format!(
                "{EVALUATION_PREAMBLE}\n# Executed notebook: {}\n# Output saved to: {}\n\n__evaluation_ipynb_file__ = '{}'\n",
                self.input_path.display(),
                self.output_path.display(),
                self.output_path.display(),
            );
            self.notebook
                .cells
                .insert(0, NotebookCell::new("code", &source, metadata));
        }
    }

    fn on_notebook_complete(&mut self) -> anyhow::Result<()> {
        if !self.is_global_finished {
            self.save_evaluation_record(&EvaluationRecord {
                timestamp: now_unix(),
                notebook_name: self.output_path.display().to_string(),
                evaluator: "bot".to_string(),
                eval_type: EvalType::Notebook,
                execution_duration: now_unix() - self.start_time,
                is_success: false,
                ..Default::default()
            })?;
        }
        self.notebook.write(&self.output_path)?;
        Ok(())
    }

    /// Harvest and apply everything one executed cell produced; returns the
    /// index the current cell ends up at.
    fn on_cell_executed(
        &mut self,
        cell_index: usize,
        run_result: &CellRunResult,
    ) -> anyhow::Result<usize> {
        self.notebook.cells[cell_index].outputs = run_result.outputs.clone();
        let output_metas: Vec<serde_json::Map<String, Value>> = run_result
            .outputs
            .iter()
            .filter(|output| output.output_type == "display_data")
            .filter(|output| !output.metadata.is_empty())
            .map(|output| output.metadata.clone())
            .collect();
        self.handle_cell_payloads(cell_index, &run_result.payloads);
        self.handle_agent_data(cell_index, &output_metas);
        self.handle_evaluation_records(cell_index, &output_metas)?;
        let current_idx = self.handle_actions(cell_index, &output_metas)?;
        if current_idx > self.options.max_cells {
            log::info!(
                "CELL[{current_idx}] Reached max cells: {}, removing the rest",
                self.options.max_cells
            );
            self.notebook.cells.truncate(current_idx + 1);
        }
        self.notebook.write(&self.output_path)?;
        Ok(current_idx)
    }

    /// Execute the notebook cell-by-cell.
    pub fn run(&mut self, runtime: &mut dyn NotebookRuntime) -> anyhow::Result<()> {
        self.on_notebook_start();
        let mut idx = 0;
        while idx < self.notebook.cells.len() {
            let cell = &self.notebook.cells[idx];
            if cell.cell_type != "code"
                || cell
                    .tags()
                    .iter()
                    .any(|tag| tag == &self.options.skip_cells_with_tag)
            {
                idx += 1;
                continue;
            }
            let source = cell.source_text().to_string();
            let run_result = runtime.run_cell(&source)?;
            idx = self.on_cell_executed(idx, &run_result)? + 1;
            if self.is_global_finished {
                break;
            }
        }
        self.on_notebook_complete()
    }
}

/// A runtime stub replaying scripted results, for offline runs and tests.
/// Clones share state, so a handle kept outside the engine can keep
/// scripting results and inspecting what ran.
#[derive(Debug, Default, Clone)]
pub struct ScriptedRuntime {
    results: std::sync::Arc<parking_lot::Mutex<VecDeque<CellRunResult>>>,
    executed: std::sync::Arc<parking_lot::Mutex<Vec<String>>>,
    next_inputs: std::sync::Arc<parking_lot::Mutex<Vec<(String, bool)>>>,
}

impl ScriptedRuntime {
    pub fn push_result(&self, result: CellRunResult) {
        self.results.lock().push_back(result);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn next_inputs(&self) -> Vec<(String, bool)> {
        self.next_inputs.lock().clone()
    }
}

impl NotebookRuntime for ScriptedRuntime {
    fn run_cell(&mut self, source: &str) -> anyhow::Result<CellRunResult> {
        self.executed.lock().push(source.to_string());
        Ok(self.results.lock().pop_front().unwrap_or(CellRunResult {
            success: true,
            ..Default::default()
        }))
    }

    fn set_next_input(&mut self, source: &str, replace: bool) -> anyhow::Result<()> {
        self.next_inputs.lock().push((source.to_string(), replace));
        Ok(())
    }
}
