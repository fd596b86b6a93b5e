//! Buffered, stage-partitioned output sink.
//!
//! One live display slot exists per cell execution. Content is grouped by
//! stage name and rendered through a tera template with a stage switcher, so
//! a reader can inspect any stage after the run. Durable records (agent
//! data, action records, evaluation records) are never rendered inline; they
//! ride on the display metadata where the batch runner harvests them from
//! the saved notebook file.

use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tera::Tera;

use crate::actions::Action;
use crate::evaluation::EvaluationRecord;
use crate::utils::no_indent;

/// Metadata key marking an output as an agent-data store.
pub const META_DATA_STORE: &str = "jupyter-agent-data-store";
/// Metadata key carrying the agent-data timestamp.
pub const META_DATA_TIMESTAMP: &str = "jupyter-agent-data-timestamp";
/// Metadata key carrying the agent-data map itself.
pub const META_DATA: &str = "jupyter-agent-data";
/// Metadata key carrying evaluation records.
pub const META_EVALUATION_RECORDS: &str = "jupyter-agent-evaluation-records";
/// Metadata key carrying action records.
pub const META_ACTION_RECORDS: &str = "jupyter-agent-action-records";

/// Reply types attached to display outputs so that later parses can tell
/// generated artifacts apart from ordinary cell output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyType {
    CellCode,
    CellOutput,
    CellResult,
    CellError,
    TaskPrompt,
    TaskResult,
    TaskIssue,
    Think,
    Code,
    Fence,
    Text,
}

impl ReplyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyType::CellCode => "cell_code",
            ReplyType::CellOutput => "cell_output",
            ReplyType::CellResult => "cell_result",
            ReplyType::CellError => "cell_error",
            ReplyType::TaskPrompt => "task_prompt",
            ReplyType::TaskResult => "task_result",
            ReplyType::TaskIssue => "task_issue",
            ReplyType::Think => "think",
            ReplyType::Code => "code",
            ReplyType::Fence => "fence",
            ReplyType::Text => "text",
        }
    }
}

// ---------------------------------------------------------------------------
// Logging levels
// ---------------------------------------------------------------------------

/// Severity for sink log records. Records below the configured level stay in
/// memory but are elided from the rendered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 10,
    Info = 20,
    Warn = 30,
    Error = 40,
    Fatal = 50,
}

impl LogLevel {
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// Parse a level name. Unknown names are a programmer error and panic.
    pub fn from_name(name: &str) -> LogLevel {
        match name.to_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "INFO" => LogLevel::Info,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            "FATAL" => LogLevel::Fatal,
            other => panic!("unknown logging level: {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Display hook
// ---------------------------------------------------------------------------

/// Host-side rendering target for the sink's single live display slot.
///
/// The first call creates the slot; subsequent calls update it in place.
/// Implementations own the slot identity.
pub trait DisplayHook: Send {
    fn publish(&mut self, content: &str, metadata: &Value) -> anyhow::Result<()>;

    /// Emit a standalone display output, separate from the live slot.
    fn display_new(&mut self, _content: &str, _metadata: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hook that discards everything. Used when no host display is attached.
#[derive(Debug, Default)]
pub struct NullDisplay;

impl DisplayHook for NullDisplay {
    fn publish(&mut self, _content: &str, _metadata: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hook that writes the rendered panel to stdout. Used by the batch binary.
#[derive(Debug, Default)]
pub struct StdoutDisplay;

impl DisplayHook for StdoutDisplay {
    fn publish(&mut self, content: &str, _metadata: &Value) -> anyhow::Result<()> {
        println!("{content}");
        Ok(())
    }

    fn display_new(&mut self, content: &str, _metadata: &Value) -> anyhow::Result<()> {
        println!("{content}");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Panel template
// ---------------------------------------------------------------------------

static PANEL_TEMPLATE: Lazy<String> = Lazy::new(|| {
    no_indent(
        r#"
        <div class="agent-output-panel">
        <div class="agent-output-title {% if collapsed %}collapsed{% endif %}" onclick="this.classList.toggle('collapsed')">
        {% if title %}{{ title }}{% else %}Agent Output{% endif %} - {{ active_stage }}
        </div>
        <div class="agent-output-content">
        <div class="agent-stage-switcher">
        {% for bucket in buckets %}
        <span class="agent-stage-title agent-stage-{{ bucket.stage }} {% if bucket.stage == active_stage %}active{% endif %}">{{ bucket.stage }}</span>
        {% endfor %}
        </div>
        {% for bucket in buckets %}
        <div class="agent-stage-output-panel agent-stage-{{ bucket.stage }} {% if bucket.stage == active_stage %}active{% endif %}">
        {% if bucket.stage == "Logging" %}
        ```log
        {% for item in bucket.items %}{{ item.content }}
        {% endfor %}```
        {% else %}
        {% for item in bucket.items %}
        {% if item.type == "block" %}
        <div class="agent-output-block">
        <div class="agent-output-block-title {% if item.collapsed %}collapsed{% endif %}">{{ item.title }}</div>
        <div class="agent-output-block-content">
        {% if item.format == "markdown" %}{{ item.content }}{% else %}```{{ item.code_language }}
        {{ item.content }}
        ```{% endif %}
        </div>
        </div>
        {% elif item.type == "markdown" %}
        {{ item.content }}
        {% else %}
        ```{{ item.code_language }}
        {{ item.content }}
        ```
        {% endif %}
        {% endfor %}
        {% endif %}
        </div>
        {% endfor %}
        </div>
        </div>
        "#,
    )
});

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum StageItem {
    Block {
        title: String,
        content: String,
        collapsed: bool,
        format: String,
        code_language: String,
    },
    Markdown {
        content: String,
    },
    Text {
        content: String,
        code_language: String,
    },
}

impl StageItem {
    fn to_value(&self) -> Value {
        match self {
            StageItem::Block {
                title,
                content,
                collapsed,
                format,
                code_language,
            } => json!({
                "type": "block",
                "title": title,
                "content": content,
                "collapsed": collapsed,
                "format": format,
                "code_language": code_language,
            }),
            StageItem::Markdown { content } => json!({"type": "markdown", "content": content}),
            StageItem::Text {
                content,
                code_language,
            } => json!({"type": "text", "content": content, "code_language": code_language}),
        }
    }
}

#[derive(Debug, Clone)]
struct LogRecord {
    level: LogLevel,
    content: String,
}

/// The stage-partitioned output sink for one cell execution.
pub struct AgentOutput {
    pub title: Option<String>,
    pub collapsed: bool,
    pub logging_level: LogLevel,
    hook: Box<dyn DisplayHook>,
    tera: Tera,
    is_dirty: bool,
    latest_display: Option<Instant>,
    buckets: Vec<(String, Vec<StageItem>)>,
    active_stage: Option<String>,
    agent_data: serde_json::Map<String, Value>,
    agent_data_timestamp: Option<f64>,
    logging_records: Vec<LogRecord>,
    evaluation_records: Vec<EvaluationRecord>,
    action_records: Vec<Action>,
}

impl std::fmt::Debug for AgentOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOutput")
            .field("title", &self.title)
            .field("active_stage", &self.active_stage)
            .field("buckets", &self.buckets.len())
            .field("logging_records", &self.logging_records.len())
            .finish()
    }
}

fn now_unix() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl AgentOutput {
    pub fn new(title: Option<String>, collapsed: bool, logging_level: LogLevel) -> Self {
        let mut tera = Tera::default();
        tera.add_raw_template("agent_output_panel", &PANEL_TEMPLATE)
            .expect("panel template parses");
        Self {
            title,
            collapsed,
            logging_level,
            hook: Box::new(NullDisplay),
            tera,
            is_dirty: true,
            latest_display: None,
            buckets: Vec::new(),
            active_stage: None,
            agent_data: serde_json::Map::new(),
            agent_data_timestamp: None,
            logging_records: Vec::new(),
            evaluation_records: Vec::new(),
            action_records: Vec::new(),
        }
    }

    /// Attach a host display hook, replacing the previous one.
    pub fn set_hook(&mut self, hook: Box<dyn DisplayHook>) {
        self.hook = hook;
    }

    fn bucket_mut(&mut self, stage: &str) -> &mut Vec<StageItem> {
        if let Some(pos) = self.buckets.iter().position(|(name, _)| name == stage) {
            return &mut self.buckets[pos].1;
        }
        self.buckets.push((stage.to_string(), Vec::new()));
        let last = self.buckets.len() - 1;
        &mut self.buckets[last].1
    }

    fn resolve_stage(&self, stage: Option<&str>) -> String {
        stage
            .map(str::to_string)
            .or_else(|| self.active_stage.clone())
            .unwrap_or_else(|| "Logging".to_string())
    }

    /// Render the panel content for the current state.
    pub fn content(&self) -> String {
        let mut buckets: Vec<Value> = self
            .buckets
            .iter()
            .map(|(stage, items)| {
                json!({
                    "stage": stage,
                    "items": items.iter().map(StageItem::to_value).collect::<Vec<_>>(),
                })
            })
            .collect();
        if !self.agent_data.is_empty() {
            buckets.push(json!({
                "stage": "Metadata",
                "items": [{
                    "type": "text",
                    "content": serde_json::to_string_pretty(&self.agent_data).unwrap_or_default(),
                    "code_language": "json",
                }],
            }));
        }
        let visible_logs: Vec<Value> = self
            .logging_records
            .iter()
            .filter(|rec| rec.level >= self.logging_level)
            .map(|rec| json!({"content": rec.content}))
            .collect();
        if !visible_logs.is_empty() {
            buckets.push(json!({"stage": "Logging", "items": visible_logs}));
        }
        let mut ctx = tera::Context::new();
        ctx.insert("title", &self.title);
        ctx.insert("collapsed", &self.collapsed);
        ctx.insert(
            "active_stage",
            &self.active_stage.clone().unwrap_or_default(),
        );
        ctx.insert("buckets", &buckets);
        match self.tera.render("agent_output_panel", &ctx) {
            Ok(rendered) => rendered,
            Err(err) => {
                log::warn!("agent output panel render failed: {err}");
                String::new()
            }
        }
    }

    /// Durable metadata carried on the display output.
    pub fn metadata(&self) -> Value {
        let mut metadata = json!({
            "reply_type": "AgentOutput",
            "exclude_from_context": true,
        });
        let map = metadata.as_object_mut().expect("object literal");
        if !self.agent_data.is_empty() {
            map.insert(META_DATA_STORE.to_string(), Value::Bool(true));
            map.insert(
                META_DATA_TIMESTAMP.to_string(),
                json!(self.agent_data_timestamp),
            );
            map.insert(META_DATA.to_string(), Value::Object(self.agent_data.clone()));
        }
        if !self.evaluation_records.is_empty() {
            map.insert(
                META_EVALUATION_RECORDS.to_string(),
                serde_json::to_value(&self.evaluation_records).unwrap_or(Value::Null),
            );
        }
        if !self.action_records.is_empty() {
            map.insert(
                META_ACTION_RECORDS.to_string(),
                serde_json::to_value(&self.action_records).unwrap_or(Value::Null),
            );
        }
        metadata
    }

    /// Refresh the live display. At most one refresh per second is emitted:
    /// with `wait` the call sleeps out the remaining interval, without it the
    /// refresh is skipped silently. `force` bypasses both checks.
    pub fn display(&mut self, stage: Option<&str>, force: bool, wait: bool) {
        if let Some(stage) = stage {
            if self.active_stage.as_deref() != Some(stage) {
                self.active_stage = Some(stage.to_string());
                self.is_dirty = true;
            }
        }
        if !self.is_dirty && !force {
            return;
        }
        if !force {
            if let Some(last) = self.latest_display {
                let elapsed = last.elapsed();
                if elapsed < Duration::from_secs(1) {
                    if wait {
                        std::thread::sleep(Duration::from_secs(1) - elapsed);
                    } else {
                        return;
                    }
                }
            }
        }
        let content = self.content();
        let metadata = self.metadata();
        if let Err(err) = self.hook.publish(&content, &metadata) {
            log::warn!("display publish failed: {err}");
        }

        self.latest_display = Some(Instant::now());
        self.is_dirty = false;
    }

    /// Drop buffered content, for one stage or for all of them.
    pub fn clear(&mut self, stage: Option<&str>, clear_metadata: bool) {
        match stage {
            Some(stage) => {
                self.bucket_mut(stage).clear();
            }
            None => self.buckets.clear(),
        }
        if clear_metadata {
            self.agent_data.clear();
        }
        self.is_dirty = true;
        self.display(None, false, false);
    }

    pub fn output_block(
        &mut self,
        content: &str,
        title: &str,
        collapsed: bool,
        stage: Option<&str>,
        format: &str,
        code_language: &str,
    ) {
        let stage = self.resolve_stage(stage);
        self.bucket_mut(&stage).push(StageItem::Block {
            title: title.to_string(),
            content: content.to_string(),
            collapsed,
            format: format.to_string(),
            code_language: code_language.to_string(),
        });
        self.is_dirty = true;
        self.display(Some(&stage), false, false);
    }

    /// Append raw text. Consecutive text items in the same language coalesce
    /// into one rendered block.
    pub fn output_text(&mut self, content: &str, stage: Option<&str>, code_language: &str) {
        let stage = self.resolve_stage(stage);
        let bucket = self.bucket_mut(&stage);
        match bucket.last_mut() {
            Some(StageItem::Text {
                content: existing,
                code_language: existing_lang,
            }) if existing_lang == code_language => {
                existing.push('\n');
                existing.push_str(content);
            }
            _ => bucket.push(StageItem::Text {
                content: content.to_string(),
                code_language: code_language.to_string(),
            }),
        }
        self.is_dirty = true;
        self.display(Some(&stage), false, false);
    }

    pub fn output_markdown(&mut self, content: &str, stage: Option<&str>) {
        let stage = self.resolve_stage(stage);
        self.bucket_mut(&stage).push(StageItem::Markdown {
            content: content.to_string(),
        });
        self.is_dirty = true;
        self.display(Some(&stage), false, false);
    }

    /// Merge fields into the durable agent-data map and stamp it.
    pub fn output_agent_data(&mut self, fields: serde_json::Map<String, Value>) {
        self.log(&format!("output agent data {fields:?}"), LogLevel::Debug);
        for (key, value) in fields {
            self.agent_data.insert(key, value);
        }
        self.agent_data_timestamp = Some(now_unix());
        self.is_dirty = true;
        self.display(None, false, false);
    }

    pub fn log(&mut self, msg: &str, level: LogLevel) {
        let tm = Local::now().format("%Y-%m-%d %H:%M:%S%.6f");
        let content = format!("[{tm}] {}: {msg}", level.name());
        match self.logging_records.last_mut() {
            Some(last) if last.level == level => {
                last.content.push('\n');
                last.content.push_str(&content);
            }
            _ => self.logging_records.push(LogRecord { level, content }),
        }
        self.is_dirty = true;
        self.display(None, false, false);
    }

    /// Record an evaluation, stamping its timestamp when unset.
    pub fn log_evaluation(&mut self, mut record: EvaluationRecord) {
        if record.timestamp == 0.0 {
            record.timestamp = now_unix();
        }
        self.log(
            &format!(
                "Evaluation: {}[{}] duration: {:.2}s success: {} correct: {:.2}",
                record.eval_type.as_str(),
                record.cell_index,
                record.execution_duration,
                record.is_success,
                record.correct_score,
            ),
            LogLevel::Info,
        );
        self.evaluation_records.push(record);
        self.is_dirty = true;
        self.display(None, false, false);
    }

    /// Emit a standalone display output with reply-type metadata so that
    /// later parses can classify it.
    pub fn display_object(
        &mut self,
        content: &str,
        reply_type: Option<ReplyType>,
        exclude_from_context: bool,
    ) {
        let metadata = json!({
            "reply_type": reply_type.map(|reply_type| reply_type.as_str()),
            "exclude_from_context": exclude_from_context,
        });
        if let Err(err) = self.hook.display_new(content, &metadata) {
            log::warn!("display_new failed: {err}");
        }
    }

    /// Record an outbound action, stamping its timestamp when unset.
    pub fn log_action(&mut self, mut record: Action) {
        if record.timestamp == 0.0 {
            record.timestamp = now_unix();
        }
        self.log(
            &format!("Action: {} from {}", record.action_name(), record.source),
            LogLevel::Info,
        );
        self.action_records.push(record);
        self.is_dirty = true;
        self.display(None, false, false);
    }
}

// ---------------------------------------------------------------------------
// Process-wide sink
// ---------------------------------------------------------------------------

static AGENT_OUTPUT: Lazy<Mutex<AgentOutput>> =
    Lazy::new(|| Mutex::new(AgentOutput::new(None, false, LogLevel::Info)));

/// Run `f` against the process-wide sink.
pub fn with_output<R>(f: impl FnOnce(&mut AgentOutput) -> R) -> R {
    f(&mut AGENT_OUTPUT.lock())
}

/// Replace the process-wide sink for a fresh cell execution.
pub fn reset_output(
    title: Option<String>,
    collapsed: bool,
    stage: Option<&str>,
    logging_level: LogLevel,
) {
    let mut guard = AGENT_OUTPUT.lock();
    *guard = AgentOutput::new(title, collapsed, logging_level);
    if let Some(stage) = stage {
        guard.display(Some(stage), false, false);
    }
}

/// Attach a display hook to the process-wide sink.
pub fn set_display_hook(hook: Box<dyn DisplayHook>) {
    with_output(|out| out.set_hook(hook));
}

pub fn set_stage(stage: &str) {
    with_output(|out| out.display(Some(stage), false, false));
}

pub fn log(msg: &str, level: LogLevel) {
    with_output(|out| out.log(msg, level));
}

pub fn debug(msg: impl AsRef<str>) {
    log(msg.as_ref(), LogLevel::Debug);
}

pub fn info(msg: impl AsRef<str>) {
    log(msg.as_ref(), LogLevel::Info);
}

pub fn warn(msg: impl AsRef<str>) {
    log(msg.as_ref(), LogLevel::Warn);
}

pub fn error(msg: impl AsRef<str>) {
    log(msg.as_ref(), LogLevel::Error);
}

pub fn fatal(msg: impl AsRef<str>) {
    log(msg.as_ref(), LogLevel::Fatal);
}

pub fn output_block(content: &str, title: &str, collapsed: bool, format: &str, lang: &str) {
    with_output(|out| out.output_block(content, title, collapsed, None, format, lang));
}

pub fn output_text(content: &str, lang: &str) {
    with_output(|out| out.output_text(content, None, lang));
}

pub fn output_markdown(content: &str) {
    with_output(|out| out.output_markdown(content, None));
}

pub fn output_agent_data(fields: serde_json::Map<String, Value>) {
    with_output(|out| out.output_agent_data(fields));
}

pub fn output_evaluation(record: EvaluationRecord) {
    with_output(|out| out.log_evaluation(record));
}

pub fn output_action(record: Action) {
    with_output(|out| out.log_action(record));
}

/// Display `content` as a standalone output carried into the notebook
/// context (use `exclude_from_context` to keep it out of later prompts).
pub fn agent_display(content: &str, reply_type: Option<ReplyType>, exclude_from_context: bool) {
    with_output(|out| out.display_object(content, reply_type, exclude_from_context));
}

pub fn clear_output(stage: Option<&str>, clear_metadata: bool) {
    with_output(|out| out.clear(stage, clear_metadata));
}

pub fn flush_output(force: bool) {
    with_output(|out| out.display(None, force, true));
}

pub fn set_title(title: Option<String>) {
    with_output(|out| out.title = title);
}

pub fn set_collapsed(collapsed: bool) {
    with_output(|out| out.collapsed = collapsed);
}

/// Set the rendered logging level by name. Unknown names panic.
pub fn set_logging_level(level: &str) {
    let level = LogLevel::from_name(level);
    with_output(|out| out.logging_level = level);
}

/// A collapsible markdown block, for one-off display payloads.
pub fn markdown_block(block: &str, title: &str, collapsed: bool) -> String {
    let state = if collapsed { "collapsed" } else { "" };
    format!(
        "<div class=\"block-panel\">\
         <div class=\"block-title {state}\" onclick=\"this.classList.toggle('collapsed')\">\
         {title} (click to expand)</div>\
         <div class=\"block-content\">\n\n{block}\n\n</div></div>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Capture {
        published: Arc<Mutex<Vec<(String, Value)>>>,
    }

    impl DisplayHook for Capture {
        fn publish(&mut self, content: &str, metadata: &Value) -> anyhow::Result<()> {
            self.published
                .lock()
                .push((content.to_string(), metadata.clone()));
            Ok(())
        }
    }

    fn fresh() -> AgentOutput {
        AgentOutput::new(Some("Test".into()), false, LogLevel::Info)
    }

    #[test]
    fn test_missing_stage_auto_creates_bucket() {
        let mut out = fresh();
        out.output_markdown("hello", Some("coding"));
        assert!(out.content().contains("coding"));
        assert!(out.content().contains("hello"));
    }

    #[test]
    fn test_text_output_coalesces_same_language() {
        let mut out = fresh();
        out.output_text("line1", Some("s"), "python");
        out.output_text("line2", Some("s"), "python");
        out.output_text("other", Some("s"), "json");
        let bucket = &out.buckets[0].1;
        assert_eq!(bucket.len(), 2);
        match &bucket[0] {
            StageItem::Text { content, .. } => assert_eq!(content, "line1\nline2"),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn test_logging_below_level_elided_from_view() {
        let mut out = fresh();
        out.log("hidden detail", LogLevel::Debug);
        out.log("shown", LogLevel::Warn);
        let content = out.content();
        assert!(!content.contains("hidden detail"));
        assert!(content.contains("shown"));
        // Both records remain buffered.
        assert_eq!(out.logging_records.len(), 2);
    }

    #[test]
    fn test_consecutive_same_level_logs_merge() {
        let mut out = fresh();
        out.log("one", LogLevel::Info);
        out.log("two", LogLevel::Info);
        out.log("three", LogLevel::Warn);
        assert_eq!(out.logging_records.len(), 2);
        assert!(out.logging_records[0].content.contains("one"));
        assert!(out.logging_records[0].content.contains("two"));
    }

    #[test]
    fn test_agent_data_rides_on_metadata() {
        let mut out = fresh();
        let mut fields = serde_json::Map::new();
        fields.insert("subject".to_string(), json!("load csv"));
        out.output_agent_data(fields);
        let meta = out.metadata();
        assert_eq!(meta[META_DATA_STORE], json!(true));
        assert_eq!(meta[META_DATA]["subject"], json!("load csv"));
        assert!(meta[META_DATA_TIMESTAMP].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_agent_data_timestamp_is_monotonic() {
        let mut out = fresh();
        let mut fields = serde_json::Map::new();
        fields.insert("a".to_string(), json!(1));
        out.output_agent_data(fields.clone());
        let first = out.agent_data_timestamp.unwrap();
        out.output_agent_data(fields);
        let second = out.agent_data_timestamp.unwrap();
        assert!(second >= first);
    }

    #[test]
    fn test_records_not_rendered_inline() {
        let mut out = fresh();
        out.log_action(Action::set_cell_content(
            "tester",
            crate::actions::SetCellContentParams {
                index: 1,
                cell_type: "code".to_string(),
                source: "print('next')".to_string(),
                tags: vec![],
                metadata: serde_json::Map::new(),
            },
        ));
        let content = out.content();
        assert!(!content.contains("print('next')"));
        let meta = out.metadata();
        assert_eq!(meta[META_ACTION_RECORDS][0]["action"], json!("set_cell_content"));
    }

    #[test]
    fn test_display_coalesced_to_one_per_second() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let mut out = fresh();
        out.set_hook(Box::new(Capture {
            published: published.clone(),
        }));
        out.output_markdown("a", Some("s"));
        out.output_markdown("b", Some("s"));
        out.output_markdown("c", Some("s"));
        // First refresh publishes; follow-ups inside the interval are skipped.
        assert_eq!(published.lock().len(), 1);
        out.display(None, true, false);
        assert_eq!(published.lock().len(), 2);
    }

    #[test]
    fn test_clear_single_stage() {
        let mut out = fresh();
        out.output_markdown("a", Some("one"));
        out.output_markdown("b", Some("two"));
        out.clear(Some("one"), false);
        let content = out.content();
        assert!(!content.contains(">a<") && !content.contains("\na\n"));
        assert!(content.contains("b"));
    }

    #[test]
    #[should_panic(expected = "unknown logging level")]
    fn test_unknown_level_name_fails_fast() {
        LogLevel::from_name("verbose");
    }
}
