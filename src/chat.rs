//! Chat client, reply decoder and prompt composer.
//!
//! The client speaks the OpenAI-compatible `/chat/completions` shape: one
//! POST, one reply. The reply is decoded into an ordered sequence of typed
//! segments (think / code / fence / text) by a small tokeniser; decoding is
//! total, and concatenating the `raw` fields of the decoded segments
//! reconstructs the reply byte-for-byte.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tera::Tera;
use thiserror::Error;

use crate::outputs;

/// Errors from the chat client and prompt composer.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat transport error: {0}")]
    Transport(String),
    #[error("chat reply contained no choices")]
    Empty,
    #[error("prompt template error: {0}")]
    Template(#[from] tera::Error),
}

// ---------------------------------------------------------------------------
// Reply decoding
// ---------------------------------------------------------------------------

/// Kind of one decoded reply segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Think,
    Code,
    Fence,
    Text,
}

/// One decoded segment of a chat reply, in reply order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplySegment {
    pub kind: SegmentKind,
    /// Code language; `Some` for code segments only.
    pub lang: Option<String>,
    pub content: String,
    /// The exact reply bytes this segment was decoded from.
    pub raw: String,
}

static REPLY_TOKENS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<think>|</think>|```[a-zA-Z_0-9]+|```").expect("static regex"));

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const FENCE: &str = "```";

fn tokenize(reply: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut last = 0;
    for found in REPLY_TOKENS.find_iter(reply) {
        if found.start() > last {
            tokens.push(&reply[last..found.start()]);
        }
        tokens.push(found.as_str());
        last = found.end();
    }
    if last < reply.len() {
        tokens.push(&reply[last..]);
    }
    tokens
}

fn is_lang_fence(token: &str) -> bool {
    token.len() > 3 && token.starts_with(FENCE)
}

/// Read until the closing token of a think block. Nested blocks are folded
/// into the content verbatim. Returns the content and whether the closing
/// token was actually consumed.
fn read_think_block<'a, I: Iterator<Item = &'a str>>(tokens: &mut I) -> (String, bool) {
    let mut text = String::new();
    loop {
        let Some(token) = tokens.next() else {
            return (text, false);
        };
        match token {
            THINK_CLOSE => return (text, true),
            THINK_OPEN => {
                let (inner, terminated) = read_think_block(tokens);
                text.push_str(THINK_OPEN);
                text.push_str(&inner);
                if terminated {
                    text.push_str(THINK_CLOSE);
                }
            }
            other => text.push_str(other),
        }
    }
}

/// Read until the closing fence of a code or fence block.
fn read_fenced_block<'a, I: Iterator<Item = &'a str>>(tokens: &mut I) -> (String, bool) {
    let mut text = String::new();
    loop {
        let Some(token) = tokens.next() else {
            return (text, false);
        };
        if token == FENCE {
            return (text, true);
        }
        if is_lang_fence(token) {
            let (inner, terminated) = read_fenced_block(tokens);
            text.push_str(token);
            text.push_str(&inner);
            if terminated {
                text.push_str(FENCE);
            }
        } else {
            text.push_str(token);
        }
    }
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

/// Decode a chat reply into typed segments.
///
/// Think segments are kept only with `ret_think_block`; whitespace-only
/// segments are kept only with `ret_empty_block`. An unfenced text segment
/// whose trimmed content parses as JSON is re-tagged as a `json` code
/// segment.
pub fn decode_reply(
    reply: &str,
    ret_think_block: bool,
    ret_empty_block: bool,
) -> Vec<ReplySegment> {
    let tokens = tokenize(reply);
    let mut iter = tokens.into_iter();
    let mut segments = Vec::new();
    while let Some(token) = iter.next() {
        if token == THINK_OPEN {
            let (content, terminated) = read_think_block(&mut iter);
            let mut raw = String::from(THINK_OPEN);
            raw.push_str(&content);
            if terminated {
                raw.push_str(THINK_CLOSE);
            }
            if ret_think_block && (ret_empty_block || !content.trim().is_empty()) {
                segments.push(ReplySegment {
                    kind: SegmentKind::Think,
                    lang: None,
                    content,
                    raw,
                });
            }
        } else if is_lang_fence(token) {
            let (content, terminated) = read_fenced_block(&mut iter);
            let mut raw = String::from(token);
            raw.push_str(&content);
            if terminated {
                raw.push_str(FENCE);
            }
            let lang = token[3..].to_lowercase();
            if ret_empty_block || !content.trim().is_empty() {
                segments.push(ReplySegment {
                    kind: SegmentKind::Code,
                    lang: Some(lang),
                    content,
                    raw,
                });
            }
        } else if token == FENCE {
            let (content, terminated) = read_fenced_block(&mut iter);
            let mut raw = String::from(FENCE);
            raw.push_str(&content);
            if terminated {
                raw.push_str(FENCE);
            }
            if ret_empty_block || !content.trim().is_empty() {
                segments.push(ReplySegment {
                    kind: SegmentKind::Fence,
                    lang: None,
                    content,
                    raw,
                });
            }
        } else {
            let is_json =
                looks_like_json(token) && serde_json::from_str::<Value>(token.trim()).is_ok();
            if is_json {
                segments.push(ReplySegment {
                    kind: SegmentKind::Code,
                    lang: Some("json".to_string()),
                    content: token.trim().to_string(),
                    raw: token.to_string(),
                });
            } else if ret_empty_block || !token.trim().is_empty() {
                segments.push(ReplySegment {
                    kind: SegmentKind::Text,
                    lang: None,
                    content: token.to_string(),
                    raw: token.to_string(),
                });
            }
        }
    }
    segments
}

/// Decode with every segment kept, for byte-exact reassembly.
pub fn decode_reply_lossless(reply: &str) -> Vec<ReplySegment> {
    let segments = decode_reply(reply, true, true);
    if segments.is_empty() {
        return vec![ReplySegment {
            kind: SegmentKind::Text,
            lang: None,
            content: reply.to_string(),
            raw: reply.to_string(),
        }];
    }
    segments
}

// ---------------------------------------------------------------------------
// Prompt composer
// ---------------------------------------------------------------------------

/// Tera `json` filter: pretty JSON with deterministic key order.
fn json_filter(
    value: &Value,
    _args: &std::collections::HashMap<String, Value>,
) -> tera::Result<Value> {
    let sorted = sort_json(value.clone());
    let text = serde_json::to_string_pretty(&sorted)
        .map_err(|e| tera::Error::msg(format!("json filter: {e}")))?;
    Ok(Value::String(text))
}

fn sort_json(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            // serde_json maps are already ordered by key; recurse for depth.
            let mut sorted = serde_json::Map::new();
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, value) in entries {
                sorted.insert(key, sort_json(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_json).collect()),
        other => other,
    }
}

const INLINE_TEMPLATE: &str = "__inline__";

/// Accumulates role-tagged messages, rendering each added body as a tera
/// template against the composer's context with the named blocks available
/// as includes.
pub struct ChatMessages {
    tera: Tera,
    context: tera::Context,
    messages: Vec<Value>,
    pub display_message: bool,
}

impl std::fmt::Debug for ChatMessages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatMessages")
            .field("messages", &self.messages.len())
            .finish()
    }
}

impl ChatMessages {
    /// Create a composer over a context map and a set of named template
    /// blocks. Unknown block names referenced later fail at render time.
    pub fn new(
        contexts: &serde_json::Map<String, Value>,
        templates: &[(&str, &str)],
    ) -> Result<ChatMessages, ChatError> {
        let mut tera = Tera::default();
        for (name, body) in templates {
            tera.add_raw_template(name, body)?;
        }
        tera.register_filter("json", json_filter);
        let context = tera::Context::from_value(Value::Object(contexts.clone()))
            .map_err(ChatError::Template)?;
        Ok(ChatMessages {
            tera,
            context,
            messages: Vec::new(),
            display_message: false,
        })
    }

    /// Render `content` and append it under `role`, merging with the
    /// previous message when the role repeats.
    pub fn add(&mut self, content: &str, role: &str) -> Result<(), ChatError> {
        self.tera.add_raw_template(INLINE_TEMPLATE, content)?;
        let rendered = self.tera.render(INLINE_TEMPLATE, &self.context)?;
        log::debug!("adding chat message: role={role}, {} chars", rendered.len());
        if self.display_message {
            outputs::output_block(
                &rendered,
                &format!("Chat Message {role}"),
                true,
                "markdown",
                "markdown",
            );
        }
        let part = json!({"type": "text", "text": rendered});
        match self.messages.last_mut() {
            Some(last) if last["role"] == json!(role) => {
                last["content"]
                    .as_array_mut()
                    .expect("content is an array")
                    .push(part);
            }
            _ => self.messages.push(json!({"role": role, "content": [part]})),
        }
        Ok(())
    }

    pub fn get(&self) -> &[Value] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

// ---------------------------------------------------------------------------
// Chat client
// ---------------------------------------------------------------------------

/// Request knobs for one chat call.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub max_tokens: u32,
    pub max_completion_tokens: u32,
    pub temperature: f64,
    pub n: u32,
    pub timeout: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 32 * 1024,
            max_completion_tokens: 4 * 1024,
            temperature: 0.8,
            n: 1,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Stateless chat client: endpoint URL, API key, model name.
#[derive(Debug, Clone)]
pub struct BotChat {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub display_think: bool,
    pub display_message: bool,
    pub display_response: bool,
    pub options: ChatOptions,
}

impl Default for BotChat {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            model_name: String::new(),
            display_think: true,
            display_message: false,
            display_response: false,
            options: ChatOptions::default(),
        }
    }
}

impl BotChat {
    pub fn new(base_url: &str, api_key: &str, model_name: &str) -> BotChat {
        BotChat {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            model_name: model_name.to_string(),
            ..Default::default()
        }
    }

    /// Build a composer wired to this client's display settings.
    pub fn create_messages(
        &self,
        contexts: &serde_json::Map<String, Value>,
        templates: &[(&str, &str)],
    ) -> Result<ChatMessages, ChatError> {
        let mut messages = ChatMessages::new(contexts, templates)?;
        messages.display_message = self.display_message;
        Ok(messages)
    }

    /// Send one chat request and decode the reply.
    pub async fn chat(
        &self,
        messages: &[Value],
        ret_think_block: bool,
        ret_empty_block: bool,
        display_reply: bool,
    ) -> Result<Vec<ReplySegment>, ChatError> {
        let total_size: usize = messages
            .iter()
            .flat_map(|message| message["content"].as_array().into_iter().flatten())
            .filter_map(|part| part["text"].as_str())
            .map(str::len)
            .sum();
        outputs::debug(format!("total message size: {total_size} chars"));
        outputs::info(format!("connecting to chat endpoint: {}", self.base_url));

        let client = reqwest::Client::builder()
            .timeout(self.options.timeout)
            .build()
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        let body = json!({
            "model": self.model_name,
            "messages": messages,
            "max_tokens": self.options.max_tokens,
            "max_completion_tokens": self.options.max_completion_tokens,
            "temperature": self.options.temperature,
            "n": self.options.n,
        });
        let response = client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let content = payload["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .and_then(|choice| choice["message"]["content"].as_str())
            .ok_or(ChatError::Empty)?;
        outputs::info("received chat response");
        if self.display_response {
            outputs::output_block(content, "Chat Response", true, "markdown", "markdown");
        }

        let segments = decode_reply(content, ret_think_block || self.display_think, ret_empty_block);
        if display_reply {
            self.display_segments(&segments);
        }
        // Strip think segments again when the caller did not ask for them;
        // they were decoded above so they could be displayed.
        let segments = if ret_think_block {
            segments
        } else {
            segments
                .into_iter()
                .filter(|segment| segment.kind != SegmentKind::Think)
                .collect()
        };
        Ok(segments)
    }

    fn display_segments(&self, segments: &[ReplySegment]) {
        for segment in segments {
            if segment.content.trim().is_empty() {
                continue;
            }
            match segment.kind {
                SegmentKind::Think => {
                    if self.display_think {
                        outputs::output_block(&segment.content, "Thought Block", true, "markdown", "markdown");
                    }
                }
                SegmentKind::Code => {
                    let lang = segment.lang.as_deref().unwrap_or("text");
                    outputs::output_block(&segment.content, "Code Block", true, "code", lang);
                }
                SegmentKind::Fence => {
                    outputs::output_block(&segment.content, "Fence Block", true, "code", "text");
                }
                SegmentKind::Text => outputs::output_markdown(&segment.content),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(segments: &[ReplySegment]) -> String {
        segments.iter().map(|segment| segment.raw.as_str()).collect()
    }

    #[test]
    fn test_decode_plain_text() {
        let segments = decode_reply("just text", false, false);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind, SegmentKind::Text);
        assert_eq!(segments[0].content, "just text");
    }

    #[test]
    fn test_decode_code_block_with_language() {
        let reply = "Here you go:\n```python\nprint(1)\n```\nDone.";
        let segments = decode_reply(reply, false, false);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].kind, SegmentKind::Code);
        assert_eq!(segments[1].lang.as_deref(), Some("python"));
        assert_eq!(segments[1].content, "\nprint(1)\n");
    }

    #[test]
    fn test_decode_think_block_kept_on_request() {
        let reply = "<think>hmm</think>answer";
        let with_think = decode_reply(reply, true, false);
        assert_eq!(with_think.len(), 2);
        assert_eq!(with_think[0].kind, SegmentKind::Think);
        assert_eq!(with_think[0].content, "hmm");
        let without = decode_reply(reply, false, false);
        assert_eq!(without.len(), 1);
        assert_eq!(without[0].content, "answer");
    }

    #[test]
    fn test_decode_bare_fence() {
        let reply = "```\nsome output\n```";
        let segments = decode_reply(reply, false, false);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind, SegmentKind::Fence);
    }

    #[test]
    fn test_unfenced_json_text_retagged() {
        let reply = "{\"state\": \"done\"}";
        let segments = decode_reply(reply, false, false);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind, SegmentKind::Code);
        assert_eq!(segments[0].lang.as_deref(), Some("json"));
        assert_eq!(segments[0].raw, reply);
    }

    #[test]
    fn test_non_json_braced_text_stays_text() {
        let reply = "{not actually json}";
        let segments = decode_reply(reply, false, false);
        assert_eq!(segments[0].kind, SegmentKind::Text);
    }

    #[test]
    fn test_raw_round_trip_well_formed() {
        let reply = "<think>a</think>text ```python\ncode\n``` tail ```\nfence\n``` end";
        let segments = decode_reply_lossless(reply);
        assert_eq!(reassemble(&segments), reply);
    }

    #[test]
    fn test_raw_round_trip_unterminated_blocks() {
        for reply in [
            "<think>never closed",
            "```python\nno closing fence",
            "```\nbare and open",
            "<think>outer<think>inner</think>still open",
            "",
            "   \n  ",
        ] {
            let segments = decode_reply_lossless(reply);
            assert_eq!(reassemble(&segments), reply, "failed for {reply:?}");
        }
    }

    #[test]
    fn test_nested_code_inside_code_folds_content() {
        let reply = "```markdown\nouter ```python\ninner\n``` after\n```";
        let segments = decode_reply_lossless(reply);
        assert_eq!(reassemble(&segments), reply);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].content.contains("```python"));
    }

    #[test]
    fn test_empty_segments_dropped_by_default() {
        let reply = "```python\n\n```   ";
        let segments = decode_reply(reply, false, false);
        assert!(segments.is_empty());
        let kept = decode_reply(reply, false, true);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_chat_messages_merge_same_role() {
        let ctx = serde_json::Map::new();
        let mut messages = ChatMessages::new(&ctx, &[]).unwrap();
        messages.add("first", "user").unwrap();
        messages.add("second", "user").unwrap();
        messages.add("reply", "assistant").unwrap();
        assert_eq!(messages.get().len(), 2);
        assert_eq!(messages.get()[0]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_chat_messages_render_with_includes_and_json_filter() {
        let mut ctx = serde_json::Map::new();
        ctx.insert("name".to_string(), json!("world"));
        ctx.insert("data".to_string(), json!({"b": 2, "a": 1}));
        let mut messages = ChatMessages::new(&ctx, &[("GREETING", "hello {{ name }}")]).unwrap();
        messages
            .add("{% include \"GREETING\" %}\n{{ data | json }}", "user")
            .unwrap();
        let text = messages.get()[0]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("hello world"));
        // Deterministic key order: "a" before "b".
        let a_pos = text.find("\"a\"").unwrap();
        let b_pos = text.find("\"b\"").unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn test_chat_messages_unknown_include_fails() {
        let ctx = serde_json::Map::new();
        let mut messages = ChatMessages::new(&ctx, &[]).unwrap();
        let err = messages.add("{% include \"MISSING\" %}", "user");
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_chat_transport_error_on_unreachable_endpoint() {
        let chat = BotChat::new("http://127.0.0.1:9", "key", "model");
        let messages = vec![json!({"role": "user", "content": [{"type": "text", "text": "hi"}]})];
        let err = chat.chat(&messages, false, false, false).await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
    }
}
