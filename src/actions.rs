//! Action records and the local HTTP callback dispatcher.
//!
//! Long-running agent runs request work from the surrounding editor (insert
//! a cell, ask the human a question) by enqueueing actions here. The editor
//! polls `GET /action_fetch`, performs the side effect, and posts any reply
//! back to `POST /action_reply`; replies are matched to their action by uuid.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::utils::get_env_capabilities;

/// Errors from action construction and dispatch.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("action `{0}` does not expect a reply")]
    ReplyNotExpected(String),
    #[error("dispatcher server failed to start: {0}")]
    Server(String),
}

fn now_unix() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Action payloads
// ---------------------------------------------------------------------------

/// Parameters of a `set_cell_content` action.
///
/// `index` addresses the target relative to the current cell: `0` replaces
/// it, `n > 0` inserts `n` positions after it, `-1` inserts before it and
/// returns focus to the shifted current cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SetCellContentParams {
    #[serde(default)]
    pub index: i64,
    #[serde(rename = "type", default = "default_cell_type")]
    pub cell_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

fn default_cell_type() -> String {
    "code".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ConfirmChoiceItem {
    #[serde(default)]
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RequestUserConfirmParams {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub choices: Vec<ConfirmChoiceItem>,
    #[serde(default)]
    pub default: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReceiveUserConfirmParams {
    #[serde(default)]
    pub result: String,
}

/// One question put to the human, with an optional worked example.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequestUserSupplyInfo {
    /// The question that needs an answer from the user.
    pub question: String,
    /// An example answer to guide the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

/// A question/answer pair contributed by the human.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UserSupplyInfoReply {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RequestUserSupplyInfoParams {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub issues: Vec<RequestUserSupplyInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReceiveUserSupplyInfoParams {
    #[serde(default)]
    pub replies: Vec<UserSupplyInfoReply>,
}

/// The action discriminant plus its typed parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum ActionPayload {
    SetCellContent(SetCellContentParams),
    RequestUserConfirm(RequestUserConfirmParams),
    ReceiveUserConfirm(ReceiveUserConfirmParams),
    RequestUserSupplyInfo(RequestUserSupplyInfoParams),
    ReceiveUserSupplyInfo(ReceiveUserSupplyInfoParams),
}

impl ActionPayload {
    pub fn name(&self) -> &'static str {
        match self {
            ActionPayload::SetCellContent(_) => "set_cell_content",
            ActionPayload::RequestUserConfirm(_) => "request_user_confirm",
            ActionPayload::ReceiveUserConfirm(_) => "receive_user_confirm",
            ActionPayload::RequestUserSupplyInfo(_) => "request_user_supply_info",
            ActionPayload::ReceiveUserSupplyInfo(_) => "receive_user_supply_info",
        }
    }

    /// Whether this action kind expects a reply from the editor.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            ActionPayload::RequestUserConfirm(_) | ActionPayload::RequestUserSupplyInfo(_)
        )
    }

    /// Rebuild a payload from its wire name and raw params.
    pub fn from_parts(action: &str, params: Value) -> Result<ActionPayload, ActionError> {
        serde_json::from_value(json!({"action": action, "params": params}))
            .map_err(|_| ActionError::UnknownAction(action.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Action envelope
// ---------------------------------------------------------------------------

/// Envelope shared by every action: unique uuid, timestamp, originating
/// component, and the typed payload. Reply-expecting actions additionally
/// carry the callback host/port once dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub source: String,
    #[serde(flatten)]
    pub payload: ActionPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_port: Option<u16>,
}

impl Action {
    pub fn new(source: &str, payload: ActionPayload) -> Self {
        Self {
            timestamp: now_unix(),
            uuid: Uuid::new_v4().to_string(),
            source: source.to_string(),
            payload,
            reply_host: None,
            reply_port: None,
        }
    }

    pub fn set_cell_content(source: &str, params: SetCellContentParams) -> Self {
        Self::new(source, ActionPayload::SetCellContent(params))
    }

    pub fn request_user_confirm(source: &str, params: RequestUserConfirmParams) -> Self {
        Self::new(source, ActionPayload::RequestUserConfirm(params))
    }

    pub fn request_user_supply_info(source: &str, params: RequestUserSupplyInfoParams) -> Self {
        Self::new(source, ActionPayload::RequestUserSupplyInfo(params))
    }

    /// The wire name of the action kind.
    pub fn action_name(&self) -> &'static str {
        self.payload.name()
    }
}

/// A stored reply, indexed by the uuid of the action it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReply {
    pub reply_timestamp: f64,
    #[serde(default)]
    pub retrieved_timestamp: f64,
    pub uuid: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub retrieved: bool,
    pub reply: Action,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DispatcherState {
    queue: Mutex<VecDeque<Action>>,
    replies: Mutex<HashMap<String, ActionReply>>,
    notify: Notify,
}

/// Process-wide dispatcher owning the outbound action queue and the inbound
/// reply map, optionally served over a small local HTTP server.
pub struct ActionDispatcher {
    host: String,
    port: u16,
    state: Arc<DispatcherState>,
    server: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl ActionDispatcher {
    /// Start a dispatcher. The HTTP server is bound to an ephemeral local
    /// port only when the host has declared a capability that needs it.
    pub async fn start() -> Result<Arc<Self>, ActionError> {
        let caps = get_env_capabilities();
        Self::with_server(caps.user_confirm || caps.user_supply_info).await
    }

    /// Start a dispatcher, explicitly choosing whether to serve HTTP.
    pub async fn with_server(serve: bool) -> Result<Arc<Self>, ActionError> {
        let state = Arc::new(DispatcherState::default());
        if !serve {
            return Ok(Arc::new(Self {
                host: "127.0.0.1".to_string(),
                port: 0,
                state,
                server: Mutex::new(None),
                shutdown: Mutex::new(None),
            }));
        }

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| ActionError::Server(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| ActionError::Server(e.to_string()))?
            .port();
        let app = action_router(state.clone());
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = server.await {
                log::error!("action dispatcher server error: {err}");
            }
        });

        Ok(Arc::new(Self {
            host: "127.0.0.1".to_string(),
            port,
            state,
            server: Mutex::new(Some(handle)),
            shutdown: Mutex::new(Some(shutdown_tx)),
        }))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Bound server port; 0 when no server is running.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the dispatcher is still usable. A dispatcher without a server
    /// has nothing to die; one with a server is alive while the server task
    /// runs.
    pub fn is_alive(&self) -> bool {
        match self.server.lock().as_ref() {
            Some(handle) => !handle.is_finished(),
            None => true,
        }
    }

    /// Shut the HTTP server down.
    pub fn close(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server.lock().take() {
            handle.abort();
        }
    }

    /// Enqueue an outbound action. A caller-supplied uuid is preserved; a
    /// fresh one is minted only when the field is empty. Reply-expecting
    /// sends stamp the callback host/port onto the action.
    pub fn send_action(&self, action: &mut Action, need_reply: bool) -> Result<(), ActionError> {
        if need_reply {
            if !action.payload.expects_reply() {
                return Err(ActionError::ReplyNotExpected(
                    action.action_name().to_string(),
                ));
            }
            action.reply_host = Some(self.host.clone());
            action.reply_port = Some(self.port);
        }
        if action.timestamp == 0.0 {
            action.timestamp = now_unix();
        }
        if action.uuid.is_empty() {
            action.uuid = Uuid::new_v4().to_string();
        }
        self.state.queue.lock().push_back(action.clone());
        crate::outputs::output_action(action.clone());
        Ok(())
    }

    /// Store a reply for the given uuid. Replies for uuids we have never
    /// seen are accepted and kept; a late reply is not an error.
    pub fn store_reply(&self, reply: ActionReply) {
        self.state.replies.lock().insert(reply.uuid.clone(), reply);
        self.state.notify.notify_waiters();
    }

    /// Retrieve the reply matching `action.uuid`. With `wait` the call
    /// suspends until the reply arrives; it has no internal deadline and is
    /// cancelled by dropping the future (e.g. under a caller timeout).
    pub async fn get_action_reply(&self, action: &Action, wait: bool) -> Option<Action> {
        loop {
            let notified = self.state.notify.notified();
            {
                let mut replies = self.state.replies.lock();
                if let Some(entry) = replies.get_mut(&action.uuid) {
                    entry.retrieved = true;
                    entry.retrieved_timestamp = now_unix();
                    return Some(entry.reply.clone());
                }
            }
            if !wait {
                return None;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

fn error_body(err: &dyn std::fmt::Display, traceback: String) -> Value {
    json!({
        "status": "ERROR",
        "error": format!("ActionError: {err}"),
        "traceback": traceback,
    })
}

/// Build the dispatcher router: `GET /echo`, `GET /action_fetch`,
/// `POST /action_reply`.
fn action_router(state: Arc<DispatcherState>) -> Router {
    Router::new()
        .route("/echo", get(echo_handler))
        .route("/action_fetch", get(action_fetch_handler))
        .route("/action_reply", post(action_reply_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn echo_handler() -> Json<Value> {
    Json(json!({"status": "OK"}))
}

async fn action_fetch_handler(State(state): State<Arc<DispatcherState>>) -> Json<Value> {
    match state.queue.lock().pop_front() {
        Some(action) => match serde_json::to_value(&action) {
            Ok(value) => Json(json!({"status": "OK", "action": value})),
            Err(err) => Json(error_body(&err, format!("{err:?}"))),
        },
        None => Json(json!({"status": "EMPTY"})),
    }
}

#[derive(Debug, Deserialize)]
struct ReplyQuery {
    uuid: String,
    #[serde(default)]
    a: Option<String>,
    #[serde(default)]
    s: Option<String>,
}

async fn action_reply_handler(
    State(state): State<Arc<DispatcherState>>,
    Query(query): Query<ReplyQuery>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let action_name = query
        .a
        .or_else(|| {
            body.get("action")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();
    let source = query
        .s
        .or_else(|| {
            body.get("source")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();
    let payload = match ActionPayload::from_parts(&action_name, body) {
        Ok(payload) => payload,
        Err(err) => return Json(error_body(&err, format!("{err:?}"))),
    };
    let reply = ActionReply {
        reply_timestamp: now_unix(),
        retrieved_timestamp: 0.0,
        uuid: query.uuid.clone(),
        source,
        action: action_name,
        retrieved: false,
        reply: Action {
            timestamp: now_unix(),
            uuid: query.uuid.clone(),
            source: String::new(),
            payload,
            reply_host: None,
            reply_port: None,
        },
    };
    state.replies.lock().insert(query.uuid, reply);
    state.notify.notify_waiters();
    Json(json!({"status": "OK"}))
}

// ---------------------------------------------------------------------------
// Process-wide instance
// ---------------------------------------------------------------------------

static DISPATCHER: Lazy<Mutex<Option<Arc<ActionDispatcher>>>> = Lazy::new(|| Mutex::new(None));

/// Get the process-wide dispatcher, lazily constructing it and replacing a
/// prior instance whose server died.
pub async fn get_action_dispatcher() -> Result<Arc<ActionDispatcher>, ActionError> {
    {
        let guard = DISPATCHER.lock();
        if let Some(existing) = guard.as_ref() {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
            existing.close();
        }
    }
    let fresh = ActionDispatcher::start().await?;
    let mut guard = DISPATCHER.lock();
    // Another caller may have raced us through the construction await;
    // keep the instance that won.
    if let Some(existing) = guard.as_ref() {
        if existing.is_alive() {
            fresh.close();
            return Ok(existing.clone());
        }
        existing.close();
    }
    *guard = Some(fresh.clone());
    Ok(fresh)
}

/// Shut the process-wide dispatcher down and drop it.
pub fn close_action_dispatcher() {
    if let Some(dispatcher) = DISPATCHER.lock().take() {
        dispatcher.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supply_action(uuid: &str) -> Action {
        let mut action = Action::request_user_supply_info(
            "tester",
            RequestUserSupplyInfoParams {
                title: "need info".to_string(),
                issues: vec![RequestUserSupplyInfo {
                    question: "CSV path?".to_string(),
                    example: Some("/data/x.csv".to_string()),
                }],
            },
        );
        action.uuid = uuid.to_string();
        action
    }

    fn supply_reply(uuid: &str, answer: &str) -> ActionReply {
        ActionReply {
            reply_timestamp: 1.0,
            retrieved_timestamp: 0.0,
            uuid: uuid.to_string(),
            source: "editor".to_string(),
            action: "receive_user_supply_info".to_string(),
            retrieved: false,
            reply: Action::new(
                "editor",
                ActionPayload::ReceiveUserSupplyInfo(ReceiveUserSupplyInfoParams {
                    replies: vec![UserSupplyInfoReply {
                        question: "CSV path?".to_string(),
                        answer: answer.to_string(),
                    }],
                }),
            ),
        }
    }

    #[test]
    fn test_action_serialization_round_trips() {
        let action = Action::set_cell_content(
            "tester",
            SetCellContentParams {
                index: 1,
                cell_type: "code".to_string(),
                source: "next".to_string(),
                tags: vec!["generated".to_string()],
                metadata: serde_json::Map::new(),
            },
        );
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["action"], json!("set_cell_content"));
        assert_eq!(value["params"]["type"], json!("code"));
        let back: Action = serde_json::from_value(value).unwrap();
        assert_eq!(back.uuid, action.uuid);
        match back.payload {
            ActionPayload::SetCellContent(params) => assert_eq!(params.source, "next"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_payload_from_parts_rejects_unknown_action() {
        let err = ActionPayload::from_parts("explode", json!({})).unwrap_err();
        assert!(matches!(err, ActionError::UnknownAction(_)));
    }

    #[tokio::test]
    async fn test_send_action_preserves_preset_uuid() {
        let dispatcher = ActionDispatcher::with_server(false).await.unwrap();
        let mut action = supply_action("preset-uuid");
        dispatcher.send_action(&mut action, true).unwrap();
        assert_eq!(action.uuid, "preset-uuid");
        assert_eq!(action.reply_host.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_send_action_mints_uuid_when_absent() {
        let dispatcher = ActionDispatcher::with_server(false).await.unwrap();
        let mut action = supply_action("");
        dispatcher.send_action(&mut action, false).unwrap();
        assert!(!action.uuid.is_empty());
    }

    #[tokio::test]
    async fn test_send_action_rejects_reply_on_oneway_kind() {
        let dispatcher = ActionDispatcher::with_server(false).await.unwrap();
        let mut action = Action::set_cell_content("tester", SetCellContentParams::default());
        let err = dispatcher.send_action(&mut action, true).unwrap_err();
        assert!(matches!(err, ActionError::ReplyNotExpected(_)));
    }

    #[tokio::test]
    async fn test_reply_matching_by_uuid() {
        let dispatcher = ActionDispatcher::with_server(false).await.unwrap();
        let mut action = supply_action("match-me");
        dispatcher.send_action(&mut action, true).unwrap();

        // A reply for some other uuid must never be returned.
        dispatcher.store_reply(supply_reply("someone-else", "nope"));
        assert!(dispatcher.get_action_reply(&action, false).await.is_none());

        dispatcher.store_reply(supply_reply("match-me", "/tmp/x.csv"));
        let reply = dispatcher.get_action_reply(&action, true).await.unwrap();
        match reply.payload {
            ActionPayload::ReceiveUserSupplyInfo(params) => {
                assert_eq!(params.replies[0].answer, "/tmp/x.csv");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(dispatcher.state.replies.lock()["match-me"].retrieved);
    }

    #[tokio::test]
    async fn test_blocking_reply_wakes_on_store() {
        let dispatcher = ActionDispatcher::with_server(false).await.unwrap();
        let mut action = supply_action("wake-up");
        dispatcher.send_action(&mut action, true).unwrap();

        let waiter = {
            let dispatcher = dispatcher.clone();
            let action = action.clone();
            tokio::spawn(async move { dispatcher.get_action_reply(&action, true).await })
        };
        tokio::task::yield_now().await;
        dispatcher.store_reply(supply_reply("wake-up", "yes"));
        let reply = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("waiter must wake")
            .unwrap();
        assert!(reply.is_some());
    }

    #[tokio::test]
    async fn test_http_round_trip() {
        let dispatcher = ActionDispatcher::with_server(true).await.unwrap();
        assert!(dispatcher.port() > 0);
        let base = format!("http://127.0.0.1:{}", dispatcher.port());
        let client = reqwest::Client::new();

        let echo: Value = client
            .get(format!("{base}/echo"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(echo["status"], json!("OK"));

        // Empty queue reports EMPTY.
        let empty: Value = client
            .get(format!("{base}/action_fetch"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(empty["status"], json!("EMPTY"));

        let mut action = supply_action("http-roundtrip");
        dispatcher.send_action(&mut action, true).unwrap();
        let fetched: Value = client
            .get(format!("{base}/action_fetch"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched["status"], json!("OK"));
        assert_eq!(fetched["action"]["uuid"], json!("http-roundtrip"));

        let posted: Value = client
            .post(format!(
                "{base}/action_reply?uuid=http-roundtrip&a=receive_user_supply_info&s=editor"
            ))
            .json(&json!({"replies": [{"question": "CSV path?", "answer": "/tmp/x.csv"}]}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(posted["status"], json!("OK"));

        let reply = dispatcher.get_action_reply(&action, true).await.unwrap();
        match reply.payload {
            ActionPayload::ReceiveUserSupplyInfo(params) => {
                assert_eq!(params.replies[0].answer, "/tmp/x.csv");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        dispatcher.close();
    }

    #[tokio::test]
    async fn test_http_reply_with_unknown_action_reports_error() {
        let dispatcher = ActionDispatcher::with_server(true).await.unwrap();
        let base = format!("http://127.0.0.1:{}", dispatcher.port());
        let posted: Value = reqwest::Client::new()
            .post(format!("{base}/action_reply?uuid=x&a=explode&s=editor"))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(posted["status"], json!("ERROR"));
        assert!(posted["error"].as_str().unwrap().contains("unknown action"));
        dispatcher.close();
    }
}
