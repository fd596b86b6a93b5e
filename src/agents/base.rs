//! LLM-backed agent plumbing: prompt blocks, reply combination, and the
//! shared call driver.
//!
//! A chat agent declares its role/rules/trigger strings, output format,
//! optional JSON schema and combine policy; the driver renders the prompt,
//! performs the chat round-trip, combines and validates the reply, and hands
//! the combined value to the agent's `on_reply`.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde_json::{json, Value};

use crate::chat::{BotChat, ReplySegment, SegmentKind};
use crate::outputs;
use crate::utils::no_indent;

use super::{Agent, AgentContext, AgentError, AgentState};

// ---------------------------------------------------------------------------
// Prompt blocks
// ---------------------------------------------------------------------------

/// Task-narrative context: the global plan and the completed subtasks.
pub const TASK_CONTEXTS: &str = r#"**Global plan and subtask progress**:

{% for cell in cells %}
{% if cell.type == "planning" and cell.source %}
{{ cell.source }}

{{ cell.result }}
{% elif cell.type == "task" and cell.subject %}
## Subtask[{{ cell.task_id }}] - {% if cell.result %}completed{% else %}pending{% endif %}

### Goal

{{ cell.subject }}

### Result

{{ cell.result }}

{% if cell.important_infos %}
### Important infos recorded by this subtask

```json
{{ cell.important_infos | json }}
```
{% endif %}
{% elif cell.type == "user_supply_info" and cell.user_supply_infos %}
## Information supplied by the user

```json
{{ cell.user_supply_infos | json }}
```
{% elif cell.is_task_context and cell.source %}
{{ cell.source }}
{% endif %}
{% endfor %}
"#;

/// Code context: sources of previously executed cells.
pub const CODE_CONTEXTS: &str = r#"**Previously executed code**:

```python
{% for cell in cells %}
{% if cell.type == "task" and cell.source %}
######## Cell[{{ cell.cell_idx }}] for Task[{{ cell.task_id }}] ########

{{ cell.source }}
{% elif cell.is_code_context and cell.source %}
######## Cell[{{ cell.cell_idx }}] ########

{{ cell.source }}
{% endif %}
{% endfor %}
```
"#;

/// Output-format instructions, switched on the agent's declared format.
pub const TASK_OUTPUT_FORMAT: &str = r#"{% if OUTPUT_FORMAT == "code" %}
**Output format**:

Output a {{ OUTPUT_CODE_LANG }} code block in Markdown, wrapped in ```{{ OUTPUT_CODE_LANG }} ... ```.
{% elif OUTPUT_FORMAT == "json" %}
**Output format**:

Output JSON data in Markdown, wrapped in ```json ... ```.

The data must conform to this JSON Schema:

```json
{{ OUTPUT_JSON_SCHEMA }}
```

Example:

```json
{{ OUTPUT_JSON_EXAMPLE }}
```
{% endif %}
"#;

/// The named blocks available to every agent prompt.
pub fn prompt_blocks() -> Vec<(&'static str, &'static str)> {
    vec![
        ("TASK_CONTEXTS", TASK_CONTEXTS),
        ("CODE_CONTEXTS", CODE_CONTEXTS),
        ("TASK_OUTPUT_FORMAT", TASK_OUTPUT_FORMAT),
    ]
}

/// Master prompt every chat agent renders unless it overrides `prompt()`.
pub const MASTER_PROMPT: &str = r#"**Role**:

{{ prompt_role }}

{% if prompt_rules %}
**Rules**:

{{ prompt_rules }}
{% endif %}

{% include "TASK_OUTPUT_FORMAT" %}

---

{% include "TASK_CONTEXTS" %}

---

{% include "CODE_CONTEXTS" %}

{% if task_data %}
---

**Current subtask info**:

```json
{{ task_data | json }}
```
{% endif %}

---

{{ prompt_trigger }}
"#;

// ---------------------------------------------------------------------------
// Output formats and combine policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Raw,
    Text,
    Code,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Raw => "raw",
            OutputFormat::Text => "text",
            OutputFormat::Code => "code",
            OutputFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineReply {
    First,
    Last,
    List,
    Merge,
}

impl CombineReply {
    fn as_str(&self) -> &'static str {
        match self {
            CombineReply::First => "first",
            CombineReply::Last => "last",
            CombineReply::List => "list",
            CombineReply::Merge => "merge",
        }
    }
}

/// The combined reply handed to `on_reply`.
#[derive(Debug, Clone, PartialEq)]
pub enum CombinedReply {
    Raw(String),
    Text(String),
    Code(String),
    Json(Value),
    JsonList(Vec<Value>),
}

impl CombinedReply {
    pub fn is_empty(&self) -> bool {
        match self {
            CombinedReply::Raw(text)
            | CombinedReply::Text(text)
            | CombinedReply::Code(text) => text.trim().is_empty(),
            CombinedReply::Json(value) => value.is_null(),
            CombinedReply::JsonList(values) => values.is_empty(),
        }
    }

    /// The combined code/text payload, for agents that emit a single block.
    pub fn as_text(&self) -> &str {
        match self {
            CombinedReply::Raw(text)
            | CombinedReply::Text(text)
            | CombinedReply::Code(text) => text,
            _ => "",
        }
    }
}

fn pick<'a>(items: &'a [&str], policy: CombineReply) -> Option<&'a str> {
    match policy {
        CombineReply::First => items.first().copied(),
        CombineReply::Last => items.last().copied(),
        _ => None,
    }
}

fn combine_raw(segments: &[ReplySegment], policy: CombineReply) -> Result<Option<String>, AgentError> {
    let raws: Vec<&str> = segments.iter().map(|segment| segment.raw.as_str()).collect();
    match policy {
        CombineReply::Merge => Ok(Some(raws.concat())),
        CombineReply::First | CombineReply::Last => Ok(pick(&raws, policy).map(str::to_string)),
        CombineReply::List => Err(AgentError::Combine {
            policy: policy.as_str().to_string(),
            format: "raw".to_string(),
        }),
    }
}

fn combine_text(segments: &[ReplySegment], policy: CombineReply) -> Result<Option<String>, AgentError> {
    let texts: Vec<&str> = segments
        .iter()
        .filter(|segment| segment.kind == SegmentKind::Text)
        .map(|segment| segment.content.as_str())
        .collect();
    match policy {
        CombineReply::Merge => Ok(Some(texts.concat())),
        CombineReply::First | CombineReply::Last => Ok(pick(&texts, policy).map(str::to_string)),
        CombineReply::List => Err(AgentError::Combine {
            policy: policy.as_str().to_string(),
            format: "text".to_string(),
        }),
    }
}

fn combine_code(
    segments: &[ReplySegment],
    policy: CombineReply,
    lang: &str,
) -> Result<Option<String>, AgentError> {
    let codes: Vec<&str> = segments
        .iter()
        .filter(|segment| {
            segment.kind == SegmentKind::Code && segment.lang.as_deref() == Some(lang)
        })
        .map(|segment| segment.content.as_str())
        .collect();
    match policy {
        CombineReply::Merge => {
            if codes.is_empty() {
                Ok(None)
            } else {
                Ok(Some(codes.join("\n")))
            }
        }
        CombineReply::First | CombineReply::Last => Ok(pick(&codes, policy).map(str::to_string)),
        CombineReply::List => Err(AgentError::Combine {
            policy: policy.as_str().to_string(),
            format: "code".to_string(),
        }),
    }
}

fn combine_json(segments: &[ReplySegment], policy: CombineReply) -> Option<CombinedReply> {
    let candidates: Vec<&ReplySegment> = segments
        .iter()
        .filter(|segment| {
            segment.kind == SegmentKind::Code && segment.lang.as_deref() == Some("json")
        })
        .collect();
    let parse = |segment: &ReplySegment| serde_json::from_str::<Value>(&segment.content).ok();
    match policy {
        CombineReply::First => candidates.first().and_then(|s| parse(s)).map(CombinedReply::Json),
        CombineReply::Last => candidates.last().and_then(|s| parse(s)).map(CombinedReply::Json),
        CombineReply::List => {
            let mut values = Vec::new();
            for segment in &candidates {
                values.push(parse(segment)?);
            }
            if values.is_empty() {
                None
            } else {
                Some(CombinedReply::JsonList(values))
            }
        }
        CombineReply::Merge => {
            if candidates.is_empty() {
                return None;
            }
            let mut merged = serde_json::Map::new();
            for segment in &candidates {
                match parse(segment)? {
                    Value::Object(map) => merged.extend(map),
                    // Shallow map union is only defined over objects.
                    _ => return None,
                }
            }
            Some(CombinedReply::Json(Value::Object(merged)))
        }
    }
}

// ---------------------------------------------------------------------------
// Chat agent trait + driver
// ---------------------------------------------------------------------------

/// JSON schema rendered into the prompt of a structured agent.
#[derive(Debug, Clone)]
pub struct SchemaSpec {
    pub schema: String,
    pub example: String,
}

/// Export the schema of a reply type for prompt generation.
pub fn schema_string<T: JsonSchema>() -> String {
    let schema = schemars::schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// An LLM-backed agent. Implementations declare their prompt pieces and
/// consume the combined reply; the provided driver does the rest.
#[async_trait]
pub trait ChatAgent: Send {
    fn name(&self) -> &'static str;
    fn context(&self) -> &AgentContext;
    fn chat_client(&self) -> &BotChat;

    fn prompt(&self) -> String {
        no_indent(MASTER_PROMPT)
    }
    fn prompt_role(&self) -> String;
    fn prompt_rules(&self) -> String {
        String::new()
    }
    fn prompt_trigger(&self) -> String {
        "Please answer:".to_string()
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Raw
    }
    fn output_code_lang(&self) -> &'static str {
        "python"
    }
    fn output_json_schema(&self) -> Option<SchemaSpec> {
        None
    }
    fn combine_reply(&self) -> CombineReply {
        CombineReply::Merge
    }
    fn accept_empty_reply(&self) -> bool {
        false
    }
    fn reply_error_retries(&self) -> u32 {
        1
    }
    fn display_reply(&self) -> bool {
        true
    }

    /// Per-agent view of the task data rendered into the prompt; `Null`
    /// renders nothing.
    fn task_data(&self) -> Value {
        Value::Null
    }

    /// Extra template variables specific to one agent.
    fn extra_context(&self) -> serde_json::Map<String, Value> {
        serde_json::Map::new()
    }

    /// Validate one decoded JSON object against the agent's schema.
    fn validate_reply(&self, _value: &Value) -> bool {
        true
    }

    /// Consume the combined (and, for JSON, validated) reply.
    async fn on_reply(&mut self, reply: CombinedReply) -> anyhow::Result<(bool, AgentState)>;
}

fn prepare_contexts<A: ChatAgent + ?Sized>(agent: &A) -> serde_json::Map<String, Value> {
    let mut contexts = serde_json::Map::new();
    contexts.insert("cells".to_string(), Value::Array(agent.context().cells_value()));
    contexts.insert("task".to_string(), agent.context().task_value());
    contexts.insert("prompt_role".to_string(), json!(agent.prompt_role()));
    contexts.insert("prompt_rules".to_string(), json!(agent.prompt_rules()));
    contexts.insert("prompt_trigger".to_string(), json!(agent.prompt_trigger()));
    contexts.insert("task_data".to_string(), agent.task_data());
    contexts.insert(
        "OUTPUT_FORMAT".to_string(),
        json!(agent.output_format().as_str()),
    );
    contexts.insert(
        "OUTPUT_CODE_LANG".to_string(),
        json!(agent.output_code_lang()),
    );
    let (schema, example) = match agent.output_json_schema() {
        Some(spec) => (spec.schema, spec.example),
        None => (String::new(), String::new()),
    };
    contexts.insert("OUTPUT_JSON_SCHEMA".to_string(), json!(schema));
    contexts.insert("OUTPUT_JSON_EXAMPLE".to_string(), json!(example));
    for (key, value) in agent.extra_context() {
        contexts.insert(key, value);
    }
    contexts
}

fn combine_replies<A: ChatAgent + ?Sized>(
    agent: &A,
    segments: &[ReplySegment],
) -> Result<Option<CombinedReply>, AgentError> {
    let policy = agent.combine_reply();
    let combined = match agent.output_format() {
        OutputFormat::Raw => combine_raw(segments, policy)?
            .map(|text| CombinedReply::Raw(text.trim().to_string())),
        OutputFormat::Text => combine_text(segments, policy)?
            .map(|text| CombinedReply::Text(text.trim().to_string())),
        OutputFormat::Code => combine_code(segments, policy, agent.output_code_lang())?
            .map(|text| CombinedReply::Code(text.trim().to_string())),
        OutputFormat::Json => combine_json(segments, policy),
    };
    // Schema validation failures count like combine failures: the caller
    // retries within the agent's reply budget.
    let combined = match combined {
        Some(CombinedReply::Json(value)) => agent
            .validate_reply(&value)
            .then_some(CombinedReply::Json(value)),
        Some(CombinedReply::JsonList(values)) => values
            .iter()
            .all(|value| agent.validate_reply(value))
            .then_some(CombinedReply::JsonList(values)),
        other => other,
    };
    Ok(combined)
}

/// Drive one chat agent call: render, chat, combine, validate, retry, and
/// hand off to `on_reply`.
pub async fn run_chat_agent<A: ChatAgent + ?Sized>(
    agent: &mut A,
) -> anyhow::Result<(bool, AgentState)> {
    let contexts = prepare_contexts(agent);
    let mut messages = agent
        .chat_client()
        .create_messages(&contexts, &prompt_blocks())?;
    messages.add(&agent.prompt(), "user")?;

    let mut reply_retries = 0;
    let combined = loop {
        let segments = agent
            .chat_client()
            .chat(messages.get(), false, false, agent.display_reply())
            .await?;
        match combine_replies(agent, &segments)? {
            Some(reply) if agent.accept_empty_reply() || !reply.is_empty() => break reply,
            failed => {
                reply_retries += 1;
                if reply_retries > agent.reply_error_retries() {
                    return Err(AgentError::Reply(reply_retries).into());
                }
                if failed.is_none() {
                    outputs::warn("failed to extract a valid reply, retrying...");
                } else {
                    outputs::warn("reply is empty, retrying...");
                }
            }
        }
    };
    let result = agent.on_reply(combined).await;
    outputs::flush_output(false);
    result
}

/// Every chat agent is an [`Agent`] through the shared driver.
#[async_trait]
impl<T: ChatAgent> Agent for T {
    fn name(&self) -> &'static str {
        ChatAgent::name(self)
    }

    async fn call(&mut self) -> anyhow::Result<(bool, AgentState)> {
        run_chat_agent(self).await
    }
}
