//! Notebook context model.
//!
//! Parses the notebook file on disk into an ordered list of typed cell
//! views, identifies the current agent cell, and serialises agent state back
//! into the cell source (YAML-in-comments options block) or the cell
//! metadata, depending on which persistence channel the host supports.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::actions::{RequestUserSupplyInfo, UserSupplyInfoReply};
use crate::outputs::{META_DATA, META_DATA_STORE};
use crate::utils::{get_env_capabilities, truncate_middle};

/// First-line marker promoting a code cell into an agent cell.
pub const AGENT_MAGIC: &str = "%%bot";
/// First-line marker of a raw user-supply cell.
pub const USER_SUPPLY_PREFIX: &str = "### USER_SUPPLY_INFO:";
/// Leading directive promoting a plain cell into the task/code context.
pub const CONTEXT_DIRECTIVE: &str = "# BOT_CONTEXT:";

pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 24 * 1024;
pub const DEFAULT_MAX_RESULT_SIZE: usize = 24 * 1024;
pub const DEFAULT_MAX_ERROR_SIZE: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("notebook io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("notebook parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cell options parse error: {0}")]
    Options(#[from] serde_yaml::Error),
    #[error("no notebook path configured")]
    MissingPath,
}

// ---------------------------------------------------------------------------
// .ipynb file model
// ---------------------------------------------------------------------------

/// Cell source as stored on disk: either a plain string or a list of lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceText(pub String);

impl SourceText {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceText {
    fn from(value: &str) -> Self {
        SourceText(value.to_string())
    }
}

impl Serialize for SourceText {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SourceText {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Lines(Vec<String>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => SourceText(text),
            Repr::Lines(lines) => SourceText(lines.concat()),
        })
    }
}

/// One captured output of a notebook cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellOutput {
    pub output_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<SourceText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evalue: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl CellOutput {
    /// Preferred text payload of a rich output: markdown first, plain next.
    pub fn display_text(&self) -> Option<String> {
        for key in ["text/markdown", "text/plain"] {
            match self.data.get(key) {
                Some(Value::String(text)) => return Some(text.clone()),
                Some(Value::Array(lines)) => {
                    return Some(
                        lines
                            .iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .concat(),
                    )
                }
                _ => {}
            }
        }
        None
    }
}

/// One notebook cell as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookCell {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub cell_type: String,
    #[serde(default)]
    pub source: SourceText,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<CellOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<Value>,
}

impl NotebookCell {
    pub fn new(cell_type: &str, source: &str, metadata: serde_json::Map<String, Value>) -> Self {
        Self {
            id: Some(uuid::Uuid::new_v4().to_string()),
            cell_type: cell_type.to_string(),
            source: SourceText(source.to_string()),
            metadata,
            outputs: Vec::new(),
            execution_count: None,
        }
    }

    pub fn source_text(&self) -> &str {
        self.source.as_str()
    }

    /// Tags from the cell metadata.
    pub fn tags(&self) -> Vec<String> {
        self.metadata
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The notebook file as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookFile {
    #[serde(default)]
    pub cells: Vec<NotebookCell>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default = "default_nbformat")]
    pub nbformat: i64,
    #[serde(default)]
    pub nbformat_minor: i64,
}

fn default_nbformat() -> i64 {
    4
}

impl NotebookFile {
    pub fn read(path: &Path) -> Result<NotebookFile, ContextError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Full-file replace; readers tolerate a torn file by retrying.
    pub fn write(&self, path: &Path) -> Result<(), ContextError> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notebook runtime seam
// ---------------------------------------------------------------------------

/// Result of running one cell through the interactive runtime.
#[derive(Debug, Clone, Default)]
pub struct CellRunResult {
    pub success: bool,
    /// Text of the execute result, if any.
    pub result: String,
    /// Formatted error (exception name, value, traceback), empty on success.
    pub error: String,
    pub stdout: String,
    pub stderr: String,
    /// Full captured outputs, display metadata included.
    pub outputs: Vec<CellOutput>,
    /// Execute-reply payloads (e.g. `set_next_input`).
    pub payloads: Vec<Value>,
}

impl CellRunResult {
    /// Text of the captured display outputs, context-excluded ones skipped.
    pub fn display_texts(&self) -> Vec<String> {
        self.outputs
            .iter()
            .filter(|output| output.output_type == "display_data")
            .filter(|output| {
                !output
                    .metadata
                    .get("exclude_from_context")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            })
            .filter_map(CellOutput::display_text)
            .collect()
    }
}

/// The interactive runtime surrounding the engine. Cell execution and
/// source rewriting are delegated to the host; the engine never runs
/// notebook code itself.
pub trait NotebookRuntime: Send {
    fn run_cell(&mut self, source: &str) -> anyhow::Result<CellRunResult>;
    fn set_next_input(&mut self, source: &str, replace: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Agent data
// ---------------------------------------------------------------------------

/// Structured per-task state persisted with an agent cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub coding_prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub verify_prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary_prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issue: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub important_infos: Option<serde_json::Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_above_supply_infos: Option<Vec<RequestUserSupplyInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_below_supply_infos: Option<Vec<RequestUserSupplyInfo>>,
}

/// The options block persisted inside the cell source. Field order is the
/// serialisation order, so the block is reproducible byte-for-byte.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CellOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(flatten)]
    agent_data: AgentData,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    update_time: String,
}

// ---------------------------------------------------------------------------
// Magic line parsing
// ---------------------------------------------------------------------------

/// Flags parsed from the agent magic line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MagicLineArgs {
    pub planning: bool,
    pub flow: Option<String>,
    pub stage: Option<String>,
    pub remain_args: Vec<String>,
}

/// Split a magic line into shell-style words, honouring single and double
/// quotes.
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(char::is_whitespace) {
        format!("'{arg}'")
    } else {
        arg.to_string()
    }
}

impl MagicLineArgs {
    /// Parse `-P|--planning`, `-f|--flow <name>`, `-s|--stage <name>`;
    /// everything else is kept verbatim as passthrough arguments.
    pub fn parse(line: &str) -> MagicLineArgs {
        let mut parsed = MagicLineArgs::default();
        let mut words = split_args(line).into_iter();
        while let Some(word) = words.next() {
            match word.as_str() {
                "-P" | "--planning" => parsed.planning = true,
                "-f" | "--flow" => parsed.flow = words.next(),
                "-s" | "--stage" => parsed.stage = words.next(),
                _ => parsed.remain_args.push(word),
            }
        }
        parsed
    }

    /// Rebuild the magic line, magic marker included.
    pub fn render(&self) -> String {
        let mut words = vec![AGENT_MAGIC.to_string()];
        if self.planning {
            words.push("-P".to_string());
        }
        if let Some(flow) = &self.flow {
            words.push("-f".to_string());
            words.push(quote_arg(flow));
        }
        if let Some(stage) = &self.stage {
            words.push("-s".to_string());
            words.push(quote_arg(stage));
        }
        words.extend(self.remain_args.iter().map(|arg| quote_arg(arg)));
        words.join(" ")
    }
}

// ---------------------------------------------------------------------------
// Options block formatting
// ---------------------------------------------------------------------------

const OPTIONS_HEADER: &str = "## Task Options:";
const OPTIONS_FOOTER: &str = "## ---";

fn format_options(options: &CellOptions) -> Result<String, ContextError> {
    let yaml = serde_yaml::to_string(options)?;
    let mut block = String::new();
    block.push('\n');
    block.push_str(OPTIONS_HEADER);
    block.push('\n');
    for line in yaml.trim_end_matches('\n').split('\n') {
        if line.is_empty() {
            block.push('#');
        } else {
            block.push_str("# ");
            block.push_str(line);
        }
        block.push('\n');
    }
    block.push_str(OPTIONS_FOOTER);
    block.push('\n');
    Ok(block)
}

/// Split an agent cell body into its options block and the generated code.
fn parse_options_block(content: &str) -> (Option<String>, String) {
    let mut yaml = String::new();
    let mut code = String::new();
    let mut in_options = false;
    let mut saw_options = false;
    for line in content.split('\n') {
        let trimmed = line.trim();
        if trimmed == OPTIONS_HEADER {
            in_options = true;
            saw_options = true;
            continue;
        }
        if trimmed == OPTIONS_FOOTER {
            in_options = false;
            continue;
        }
        if in_options {
            if let Some(stripped) = line.strip_prefix("# ") {
                yaml.push_str(stripped);
                yaml.push('\n');
            } else if line == "#" {
                yaml.push('\n');
            } else {
                in_options = false;
                code.push_str(line);
                code.push('\n');
            }
        } else {
            code.push_str(line);
            code.push('\n');
        }
    }
    let yaml = saw_options.then_some(yaml);
    (yaml, code.trim().to_string())
}

// ---------------------------------------------------------------------------
// Cell views
// ---------------------------------------------------------------------------

/// Typed view of a cell preceding the current agent cell.
#[derive(Debug, Clone)]
pub enum CellView {
    Code(PlainCellView),
    Markdown(PlainCellView),
    Planning(PlanCellView),
    Task(TaskCellView),
    UserSupplyInfo(UserSupplyCellView),
}

#[derive(Debug, Clone)]
pub struct PlainCellView {
    pub cell_idx: usize,
    pub source: String,
    pub outputs: Vec<String>,
    pub is_code_context: bool,
    pub is_task_context: bool,
}

#[derive(Debug, Clone)]
pub struct PlanCellView {
    pub cell_idx: usize,
    pub source: String,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TaskCellView {
    pub cell_idx: usize,
    pub task_id: String,
    pub subject: String,
    pub source: String,
    pub result: String,
    pub outputs: Vec<String>,
    pub important_infos: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct UserSupplyCellView {
    pub cell_idx: usize,
    pub infos: Vec<UserSupplyInfoReply>,
}

impl CellView {
    /// Template-facing representation. Every variant carries the same key
    /// set (with neutral defaults) so templates can test any field on any
    /// cell.
    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "type": "",
            "cell_idx": 0,
            "source": "",
            "outputs": [],
            "result": "",
            "task_id": "",
            "subject": "",
            "important_infos": Value::Null,
            "user_supply_infos": [],
            "is_code_context": false,
            "is_task_context": false,
        });
        let map = value.as_object_mut().expect("object literal");
        match self {
            CellView::Code(view) | CellView::Markdown(view) => {
                let kind = if matches!(self, CellView::Code(_)) {
                    "code"
                } else {
                    "markdown"
                };
                map.insert("type".to_string(), json!(kind));
                map.insert("cell_idx".to_string(), json!(view.cell_idx));
                map.insert("source".to_string(), json!(view.source));
                map.insert("outputs".to_string(), json!(view.outputs));
                map.insert("is_code_context".to_string(), json!(view.is_code_context));
                map.insert("is_task_context".to_string(), json!(view.is_task_context));
            }
            CellView::Planning(view) => {
                map.insert("type".to_string(), json!("planning"));
                map.insert("cell_idx".to_string(), json!(view.cell_idx));
                map.insert("source".to_string(), json!(view.source));
                map.insert("result".to_string(), json!(view.outputs.join("\n")));
            }
            CellView::Task(view) => {
                map.insert("type".to_string(), json!("task"));
                map.insert("cell_idx".to_string(), json!(view.cell_idx));
                map.insert("task_id".to_string(), json!(view.task_id));
                map.insert("subject".to_string(), json!(view.subject));
                map.insert("source".to_string(), json!(view.source));
                map.insert("result".to_string(), json!(view.result));
                map.insert("outputs".to_string(), json!(view.outputs));
                map.insert(
                    "important_infos".to_string(),
                    view.important_infos
                        .clone()
                        .map(Value::Object)
                        .unwrap_or(Value::Null),
                );
            }
            CellView::UserSupplyInfo(view) => {
                map.insert("type".to_string(), json!("user_supply_info"));
                map.insert("cell_idx".to_string(), json!(view.cell_idx));
                map.insert("user_supply_infos".to_string(), json!(view.infos));
            }
        }
        value
    }
}

/// Context tags a plain cell can carry.
fn directive_tags(source: &str) -> Option<(Vec<String>, String)> {
    let (first, rest) = match source.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (source, ""),
    };
    let tags = first.strip_prefix(CONTEXT_DIRECTIVE)?;
    let tags = tags
        .split(',')
        .map(|tag| tag.trim().to_uppercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    Some((tags, rest.trim().to_string()))
}

// ---------------------------------------------------------------------------
// Agent cell context
// ---------------------------------------------------------------------------

/// Parsed state of the agent cell currently being executed.
#[derive(Debug, Clone)]
pub struct AgentCellContext {
    pub cur_line: String,
    pub cur_content: String,
    pub magic: MagicLineArgs,
    pub cell_idx: Option<usize>,
    pub stage: Option<String>,
    pub agent_data: AgentData,
    pub cell_code: String,
    max_output_size: usize,
    max_result_size: usize,
    max_error_size: usize,
    cell_output: String,
    cell_result: String,
    cell_error: String,
}

impl AgentCellContext {
    /// Parse the invocation line and body of the current agent cell.
    pub fn parse(cur_line: &str, cur_content: &str) -> Result<AgentCellContext, ContextError> {
        let mut cur_line = cur_line.trim().to_string();
        let mut cur_content = cur_content.trim().to_string();
        if cur_line.is_empty() && cur_content.starts_with(AGENT_MAGIC) {
            let full = std::mem::take(&mut cur_content);
            let (line, content) = full.split_once('\n').unwrap_or((full.as_str(), ""));
            cur_line = line.trim_start_matches(AGENT_MAGIC).trim().to_string();
            cur_content = content.trim().to_string();
        }
        let magic = MagicLineArgs::parse(&cur_line);
        let (yaml, cell_code) = parse_options_block(&cur_content);
        let mut stage = magic.stage.clone();
        let mut agent_data = AgentData::default();
        if let Some(yaml) = yaml {
            let options: CellOptions = serde_yaml::from_str(&yaml)?;
            stage = stage.or(options.stage);
            agent_data = options.agent_data;
        }
        Ok(AgentCellContext {
            cur_line,
            cur_content,
            magic,
            cell_idx: None,
            stage,
            agent_data,
            cell_code,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            max_result_size: DEFAULT_MAX_RESULT_SIZE,
            max_error_size: DEFAULT_MAX_ERROR_SIZE,
            cell_output: String::new(),
            cell_result: String::new(),
            cell_error: String::new(),
        })
    }

    pub fn cell_output(&self) -> &str {
        &self.cell_output
    }

    pub fn set_cell_output(&mut self, output: &str) {
        self.cell_output = truncate_middle(output, self.max_output_size);
    }

    pub fn cell_result(&self) -> &str {
        &self.cell_result
    }

    pub fn set_cell_result(&mut self, result: &str) {
        self.cell_result = truncate_middle(result, self.max_result_size);
    }

    pub fn cell_error(&self) -> &str {
        &self.cell_error
    }

    pub fn set_cell_error(&mut self, error: &str) {
        self.cell_error = truncate_middle(error, self.max_error_size);
    }

    /// Combined execution output shown to summarising agents.
    pub fn combined_output(&self) -> String {
        let mut combined = String::new();
        if !self.cell_output.is_empty() {
            combined.push_str(&self.cell_output);
            combined.push('\n');
        }
        if !self.cell_result.is_empty() {
            combined.push_str("Result:\n");
            combined.push_str(&self.cell_result);
            combined.push('\n');
        }
        if !self.cell_error.is_empty() {
            combined.push_str("Error:\n");
            combined.push_str(&self.cell_error);
            combined.push('\n');
        }
        combined
    }

    /// Template-facing representation of the current task.
    pub fn to_value(&self) -> Value {
        json!({
            "cell_idx": self.cell_idx.map(|idx| idx as i64).unwrap_or(-1),
            "stage": self.stage.clone().unwrap_or_default(),
            "task_id": self.agent_data.task_id,
            "subject": self.agent_data.subject,
            "coding_prompt": self.agent_data.coding_prompt,
            "verify_prompt": self.agent_data.verify_prompt,
            "summary_prompt": self.agent_data.summary_prompt,
            "issue": self.agent_data.issue,
            "result": self.agent_data.result,
            "important_infos": self.agent_data.important_infos.clone()
                .map(Value::Object).unwrap_or(Value::Null),
            "source": self.cell_code,
            "output": self.combined_output(),
            "cell_error": self.cell_error,
        })
    }

    /// Whether this cell matches the invocation that is currently running.
    fn matches_invocation(&self, cell_source: &str) -> bool {
        cell_source.starts_with(AGENT_MAGIC)
            && cell_source.contains(&self.cur_line)
            && cell_source.ends_with(&self.cur_content)
    }

    /// Harvest the current cell's captured outputs (and, when metadata is
    /// the authoritative channel, its persisted agent data) from disk.
    pub fn load_from_notebook(&mut self, notebook: &NotebookFile) {
        for (idx, cell) in notebook.cells.iter().enumerate() {
            if cell.cell_type != "code" {
                continue;
            }
            let source = cell.source_text().trim();
            if !self.matches_invocation(source) {
                continue;
            }
            self.cell_idx = Some(idx);
            let mut output = String::new();
            let mut result = String::new();
            let mut error = String::new();
            for cell_output in &cell.outputs {
                match cell_output.output_type.as_str() {
                    "stream" => {
                        let name = cell_output.name.as_deref().unwrap_or("stdout");
                        let text = cell_output
                            .text
                            .as_ref()
                            .map(SourceText::as_str)
                            .unwrap_or_default();
                        output.push_str(&format!("{name}:\n{text}\n"));
                    }
                    "error" => {
                        error.push_str(&format!(
                            "{}: {}\n",
                            cell_output.ename.as_deref().unwrap_or_default(),
                            cell_output.evalue.as_deref().unwrap_or_default(),
                        ));
                        if !cell_output.traceback.is_empty() {
                            error.push_str("Traceback:\n");
                            error.push_str(&cell_output.traceback.join("\n"));
                            error.push('\n');
                        }
                    }
                    "execute_result" => {
                        if let Some(text) = cell_output.display_text() {
                            result.push_str(&text);
                            result.push('\n');
                        }
                    }
                    "display_data" => {
                        if cell_output
                            .metadata
                            .get("exclude_from_context")
                            .and_then(Value::as_bool)
                            .unwrap_or(false)
                        {
                            continue;
                        }
                        if let Some(text) = cell_output.display_text() {
                            let reply_type =
                                cell_output.metadata.get("reply_type").and_then(Value::as_str);
                            if reply_type == Some("cell_error") {
                                error.push_str(&text);
                                error.push('\n');
                            } else {
                                output.push_str(&text);
                                output.push('\n');
                            }
                        }
                    }
                    _ => {}
                }
            }
            self.set_cell_output(&output);
            self.set_cell_result(&result);
            self.set_cell_error(&error);
            if get_env_capabilities().save_metadata {
                self.load_agent_data_from_metadata(&cell.metadata);
            }
            break;
        }
    }

    /// Re-seed agent data from the cell metadata store.
    fn load_agent_data_from_metadata(&mut self, metadata: &serde_json::Map<String, Value>) {
        if !metadata
            .get(META_DATA_STORE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return;
        }
        let Some(stored) = metadata.get(META_DATA) else {
            return;
        };
        if let Ok(data) = serde_json::from_value::<AgentData>(stored.clone()) {
            if let Some(stage) = stored.get("agent_stage").and_then(Value::as_str) {
                self.stage = Some(stage.to_string());
            }
            self.agent_data = data;
        }
    }

    /// Rebuild the full cell source: magic line, options block, code.
    pub fn render_source(&self, with_options: bool) -> Result<String, ContextError> {
        let mut magic = self.magic.clone();
        magic.stage = self.stage.clone();
        let mut source = magic.render();
        source.push('\n');
        if with_options {
            let options = CellOptions {
                stage: self.stage.clone(),
                agent_data: self.agent_data.clone(),
                update_time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            };
            source.push_str(&format_options(&options)?);
        }
        source.push('\n');
        source.push_str(&self.cell_code);
        Ok(source)
    }

    /// Persist the stage marker and agent data back into the cell, through
    /// exactly one channel: the metadata dictionary when the host saves
    /// metadata, else the rebuilt source via the runtime.
    pub fn update_cell(&self, runtime: &mut dyn NotebookRuntime) -> Result<(), ContextError> {
        if get_env_capabilities().save_metadata {
            let mut fields = match serde_json::to_value(&self.agent_data) {
                Ok(Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            if let Some(stage) = &self.stage {
                fields.insert("agent_stage".to_string(), json!(stage));
            }
            crate::outputs::output_agent_data(fields);
            let source = self.render_source(false)?;
            if let Err(err) = runtime.set_next_input(&source, true) {
                log::warn!("set_next_input failed: {err}");
            }
        } else {
            let source = self.render_source(true)?;
            if let Err(err) = runtime.set_next_input(&source, true) {
                log::warn!("set_next_input failed: {err}");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notebook context
// ---------------------------------------------------------------------------

/// Notebook-wide context threaded through every stage of a run: the typed
/// views of all cells preceding the current agent cell, plus the current
/// cell's own parsed state.
#[derive(Debug)]
pub struct NotebookContext {
    pub cur_line: String,
    pub cur_content: String,
    pub notebook_path: Option<PathBuf>,
    pub cur_task: AgentCellContext,
    state_mtime: Option<SystemTime>,
    cells_cache: Vec<CellView>,
}

impl NotebookContext {
    pub fn new(
        cur_line: &str,
        cur_content: &str,
        notebook_path: Option<PathBuf>,
    ) -> Result<NotebookContext, ContextError> {
        let mut cur_task = AgentCellContext::parse(cur_line, cur_content)?;
        if let Some(path) = &notebook_path {
            if let Ok(notebook) = NotebookFile::read(path) {
                cur_task.load_from_notebook(&notebook);
            }
        }
        Ok(NotebookContext {
            cur_line: cur_line.trim().to_string(),
            cur_content: cur_content.trim().to_string(),
            notebook_path,
            cur_task,
            state_mtime: None,
            cells_cache: Vec::new(),
        })
    }

    /// Typed views of every cell before the current agent cell. The parse is
    /// cached and refreshed when the file mtime changes; a torn or missing
    /// file keeps the previous parse.
    pub fn cells(&mut self) -> &[CellView] {
        let Some(path) = self.notebook_path.clone() else {
            return &self.cells_cache;
        };
        let mtime = std::fs::metadata(&path).and_then(|meta| meta.modified()).ok();
        if !self.cells_cache.is_empty() && mtime.is_some() && self.state_mtime == mtime {
            return &self.cells_cache;
        }
        match NotebookFile::read(&path) {
            Ok(notebook) => {
                self.cells_cache = self.parse_cells(&notebook);
                self.state_mtime = mtime;
            }
            Err(err) => {
                log::debug!("failed to load notebook cells: {err}");
            }
        }
        &self.cells_cache
    }

    fn parse_cells(&self, notebook: &NotebookFile) -> Vec<CellView> {
        let mut views = Vec::new();
        for (idx, cell) in notebook.cells.iter().enumerate() {
            let source = cell.source_text().trim().to_string();
            let tags = cell.tags();
            if tags.iter().any(|tag| tag == "CTX_EXCLUDE") {
                continue;
            }
            match cell.cell_type.as_str() {
                "raw" => {
                    if let Some(view) = parse_user_supply_cell(idx, &source) {
                        views.push(CellView::UserSupplyInfo(view));
                    }
                }
                "code" if source.starts_with(AGENT_MAGIC) => {
                    if self.cur_task.matches_invocation(&source) {
                        break;
                    }
                    let (line, body) = source.split_once('\n').unwrap_or((source.as_str(), ""));
                    let line = line.trim_start_matches(AGENT_MAGIC).trim();
                    let magic = MagicLineArgs::parse(line);
                    if magic.planning {
                        views.push(CellView::Planning(PlanCellView {
                            cell_idx: idx,
                            source: body.trim().to_string(),
                            outputs: harvest_task_results(cell),
                        }));
                    } else {
                        match AgentCellContext::parse(line, body) {
                            Ok(task) => {
                                let outputs = if task.agent_data.result.is_empty() {
                                    harvest_task_results(cell)
                                } else {
                                    vec![task.agent_data.result.clone()]
                                };
                                views.push(CellView::Task(TaskCellView {
                                    cell_idx: idx,
                                    task_id: task.agent_data.task_id.clone(),
                                    subject: task.agent_data.subject.clone(),
                                    source: task.cell_code.clone(),
                                    result: task.agent_data.result.clone(),
                                    outputs,
                                    important_infos: task.agent_data.important_infos.clone(),
                                }));
                            }
                            Err(err) => log::debug!("skipping unparseable agent cell {idx}: {err}"),
                        }
                    }
                }
                "code" | "markdown" => {
                    let (directive, source) = match directive_tags(&source) {
                        Some((tags, rest)) => (Some(tags), rest),
                        None => (None, source),
                    };
                    let mut context_tags: Vec<String> = directive.unwrap_or_else(|| {
                        if cell.cell_type == "markdown" {
                            vec!["TASK".to_string()]
                        } else {
                            vec!["CODE".to_string()]
                        }
                    });
                    context_tags.extend(tags.iter().map(|tag| tag.to_uppercase()));
                    if context_tags.iter().any(|tag| tag == "CTX_EXCLUDE" || tag == "EXCLUDE") {
                        continue;
                    }
                    let view = PlainCellView {
                        cell_idx: idx,
                        source,
                        outputs: harvest_task_results(cell),
                        is_code_context: context_tags.iter().any(|tag| tag == "CODE"),
                        is_task_context: context_tags.iter().any(|tag| tag == "TASK"),
                    };
                    if cell.cell_type == "markdown" {
                        views.push(CellView::Markdown(view));
                    } else {
                        views.push(CellView::Code(view));
                    }
                }
                _ => {}
            }
        }
        views
    }

    /// Template-facing list of cell views.
    pub fn cells_value(&mut self) -> Vec<Value> {
        self.cells().iter().map(CellView::to_value).collect()
    }
}

fn harvest_task_results(cell: &NotebookCell) -> Vec<String> {
    cell.outputs
        .iter()
        .filter(|output| output.output_type == "display_data")
        .filter(|output| {
            output.metadata.get("reply_type").and_then(Value::as_str) == Some("task_result")
        })
        .filter_map(CellOutput::display_text)
        .collect()
}

fn parse_user_supply_cell(idx: usize, source: &str) -> Option<UserSupplyCellView> {
    let rest = source.strip_prefix(USER_SUPPLY_PREFIX)?;
    #[derive(Deserialize)]
    struct Pair {
        #[serde(default)]
        user: String,
        #[serde(default)]
        assistant: String,
    }
    let pairs: Vec<Pair> = serde_yaml::from_str(rest).ok()?;
    Some(UserSupplyCellView {
        cell_idx: idx,
        infos: pairs
            .into_iter()
            .map(|pair| UserSupplyInfoReply {
                question: pair.user,
                answer: pair.assistant,
            })
            .collect(),
    })
}

/// Render answered user-supply questions as a raw user-supply cell source.
pub fn render_user_supply_cell(replies: &[UserSupplyInfoReply]) -> String {
    #[derive(Serialize)]
    struct Pair<'a> {
        user: &'a str,
        assistant: &'a str,
    }
    let pairs: Vec<Pair<'_>> = replies
        .iter()
        .map(|reply| Pair {
            user: &reply.question,
            assistant: &reply.answer,
        })
        .collect();
    format!(
        "{USER_SUPPLY_PREFIX}\n{}",
        serde_yaml::to_string(&pairs).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cell(cell_type: &str, source: &str) -> NotebookCell {
        NotebookCell::new(cell_type, source, serde_json::Map::new())
    }

    fn notebook(cells: Vec<NotebookCell>) -> NotebookFile {
        NotebookFile {
            cells,
            metadata: serde_json::Map::new(),
            nbformat: 4,
            nbformat_minor: 5,
        }
    }

    #[test]
    fn test_split_args_honours_quotes() {
        assert_eq!(
            split_args("-s 'my stage' -f flow"),
            vec!["-s", "my stage", "-f", "flow"]
        );
    }

    #[test]
    fn test_magic_line_parse_and_render() {
        let args = MagicLineArgs::parse("-P -f planning -s start --keep this");
        assert!(args.planning);
        assert_eq!(args.flow.as_deref(), Some("planning"));
        assert_eq!(args.stage.as_deref(), Some("start"));
        assert_eq!(args.remain_args, vec!["--keep", "this"]);
        assert_eq!(args.render(), "%%bot -P -f planning -s start --keep this");
    }

    #[test]
    fn test_agent_cell_parse_without_options() {
        let ctx = AgentCellContext::parse("-s coding", "print('hi')").unwrap();
        assert_eq!(ctx.stage.as_deref(), Some("coding"));
        assert_eq!(ctx.cell_code, "print('hi')");
        assert_eq!(ctx.agent_data, AgentData::default());
    }

    #[test]
    fn test_agent_cell_parse_inline_magic() {
        let ctx = AgentCellContext::parse("", "%%bot -s summary\n\nprint('x')").unwrap();
        assert_eq!(ctx.stage.as_deref(), Some("summary"));
        assert_eq!(ctx.cell_code, "print('x')");
    }

    #[test]
    fn test_options_round_trip_is_lossless() {
        let mut ctx = AgentCellContext::parse("-s summary", "print('x')").unwrap();
        ctx.agent_data.task_id = "t1".to_string();
        ctx.agent_data.subject = "load csv".to_string();
        ctx.agent_data.coding_prompt = "Read data.csv into df\nwith pandas".to_string();
        ctx.agent_data.result = "100 rows: loaded".to_string();
        let mut infos = serde_json::Map::new();
        infos.insert("row_count".to_string(), json!(100));
        ctx.agent_data.important_infos = Some(infos);

        let source = ctx.render_source(true).unwrap();
        let reparsed = AgentCellContext::parse("-s summary", &source).unwrap();
        assert_eq!(reparsed.agent_data, ctx.agent_data);
        assert_eq!(reparsed.stage.as_deref(), Some("summary"));
        assert_eq!(reparsed.cell_code, "print('x')");

        // Re-rendering reproduces the source byte-for-byte modulo the
        // update_time stamp.
        let rerendered = reparsed.render_source(true).unwrap();
        let strip = |text: &str| {
            text.lines()
                .filter(|line| !line.contains("update_time"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        assert_eq!(strip(&rerendered), strip(&source));
    }

    #[test]
    fn test_load_outputs_from_notebook() {
        let mut cell = make_cell("code", "%%bot -s executing\n\nprint(len(df))");
        cell.outputs.push(CellOutput {
            output_type: "stream".to_string(),
            name: Some("stdout".to_string()),
            text: Some(SourceText("100\n".to_string())),
            ..Default::default()
        });
        let mut data = serde_json::Map::new();
        data.insert("text/plain".to_string(), json!("100"));
        cell.outputs.push(CellOutput {
            output_type: "execute_result".to_string(),
            data,
            ..Default::default()
        });
        let nb = notebook(vec![cell]);

        let mut ctx = AgentCellContext::parse("-s executing", "print(len(df))").unwrap();
        ctx.load_from_notebook(&nb);
        assert_eq!(ctx.cell_idx, Some(0));
        assert!(ctx.cell_output().contains("stdout:\n100"));
        assert_eq!(ctx.cell_result().trim(), "100");
    }

    #[test]
    fn test_error_outputs_capture_traceback() {
        let mut cell = make_cell("code", "%%bot -s executing\n\nboom()");
        cell.outputs.push(CellOutput {
            output_type: "error".to_string(),
            ename: Some("NameError".to_string()),
            evalue: Some("name 'boom' is not defined".to_string()),
            traceback: vec!["Traceback line".to_string()],
            ..Default::default()
        });
        let nb = notebook(vec![cell]);
        let mut ctx = AgentCellContext::parse("-s executing", "boom()").unwrap();
        ctx.load_from_notebook(&nb);
        assert!(ctx.cell_error().contains("NameError"));
        assert!(ctx.cell_error().contains("Traceback line"));
    }

    #[test]
    fn test_cells_stop_before_current_cell() {
        let cells = vec![
            make_cell("markdown", "# Analysis notebook"),
            make_cell("code", "import pandas as pd"),
            make_cell("code", "%%bot -s planning\n\ncurrent body"),
            make_cell("code", "never_seen()"),
        ];
        let nb = notebook(cells);
        let ctx = NotebookContext::new("-s planning", "current body", None).unwrap();
        let views = ctx.parse_cells(&nb);
        assert_eq!(views.len(), 2);
        assert!(matches!(views[0], CellView::Markdown(_)));
        assert!(matches!(views[1], CellView::Code(_)));
    }

    #[test]
    fn test_context_directive_promotes_and_excludes() {
        let cells = vec![
            make_cell("code", "# BOT_CONTEXT: TASK\nnotes = 1"),
            make_cell("code", "# BOT_CONTEXT: CTX_EXCLUDE\nsecret = 2"),
            make_cell("code", "plain = 3"),
        ];
        let nb = notebook(cells);
        let ctx = NotebookContext::new("-s planning", "body", None).unwrap();
        let views = ctx.parse_cells(&nb);
        assert_eq!(views.len(), 2);
        match &views[0] {
            CellView::Code(view) => {
                assert!(view.is_task_context);
                assert!(!view.is_code_context);
                assert_eq!(view.source, "notes = 1");
            }
            other => panic!("unexpected view: {other:?}"),
        }
        match &views[1] {
            CellView::Code(view) => assert!(view.is_code_context),
            other => panic!("unexpected view: {other:?}"),
        }
    }

    #[test]
    fn test_metadata_tag_excludes_cell() {
        let mut cell = make_cell("code", "preamble = 1");
        cell.metadata
            .insert("tags".to_string(), json!(["CTX_EXCLUDE"]));
        let nb = notebook(vec![cell]);
        let ctx = NotebookContext::new("-s planning", "body", None).unwrap();
        assert!(ctx.parse_cells(&nb).is_empty());
    }

    #[test]
    fn test_prior_task_cell_view() {
        let mut prior = AgentCellContext::parse("", "df = 1").unwrap();
        prior.agent_data.task_id = "t1".to_string();
        prior.agent_data.subject = "load csv".to_string();
        prior.agent_data.result = "100 rows loaded".to_string();
        let source = prior.render_source(true).unwrap();
        let cells = vec![make_cell("code", &source)];
        let nb = notebook(cells);
        let ctx = NotebookContext::new("-s planning", "current body", None).unwrap();
        let views = ctx.parse_cells(&nb);
        match &views[0] {
            CellView::Task(view) => {
                assert_eq!(view.task_id, "t1");
                assert_eq!(view.subject, "load csv");
                assert_eq!(view.outputs, vec!["100 rows loaded".to_string()]);
            }
            other => panic!("unexpected view: {other:?}"),
        }
    }

    #[test]
    fn test_user_supply_cell_round_trip() {
        let replies = vec![UserSupplyInfoReply {
            question: "CSV path?".to_string(),
            answer: "/tmp/x.csv".to_string(),
        }];
        let source = render_user_supply_cell(&replies);
        let view = parse_user_supply_cell(0, &source).unwrap();
        assert_eq!(view.infos.len(), 1);
        assert_eq!(view.infos[0].question, "CSV path?");
        assert_eq!(view.infos[0].answer, "/tmp/x.csv");
    }

    #[test]
    fn test_truncating_setters_are_idempotent() {
        let mut ctx = AgentCellContext::parse("", "x").unwrap();
        ctx.max_output_size = 64;
        let big = "y".repeat(10_000);
        ctx.set_cell_output(&big);
        let once = ctx.cell_output().to_string();
        ctx.set_cell_output(&once);
        assert_eq!(ctx.cell_output(), once);
        assert!(once.len() <= 64 + crate::utils::TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_torn_file_keeps_previous_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.ipynb");
        let nb = notebook(vec![make_cell("markdown", "# Title")]);
        nb.write(&path).unwrap();

        let mut ctx =
            NotebookContext::new("-s planning", "body", Some(path.clone())).unwrap();
        assert_eq!(ctx.cells().len(), 1);

        // Corrupt the file; the cached parse must survive.
        std::fs::write(&path, "{ not json").unwrap();
        ctx.state_mtime = None;
        assert_eq!(ctx.cells().len(), 1);
    }
}
