//! RPC protocol between clients and the session server
//!
//! Messages are newline-delimited JSON documents over TCP. Clients send
//! [`RpcRequest`]s; the server answers each with an [`RpcResponse`] carrying
//! the same `id`, and pushes [`EventEnvelope`]s for subscribed sessions. Both
//! server-to-client shapes travel inside a [`ServerMessage`] tagged by `type`.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Raw request as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id chosen by the client
    pub id: Option<u64>,
    /// Method name, e.g. `session.exec`
    pub method: String,
    /// Method parameters (`null`/absent for parameterless methods)
    #[serde(default)]
    pub params: Value,
}

/// Response to a single request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Id of the request being answered (`None` if it could not be parsed)
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// Successful response
    pub fn ok(id: Option<u64>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response
    pub fn error(id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Push event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Event name, e.g. `session:output`
    pub event: String,
    /// Session the event belongs to; absent for global events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Event-specific payload
    pub payload: Value,
}

/// Anything the server writes to a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response(RpcResponse),
    Event(EventEnvelope),
}

impl ServerMessage {
    /// Serialize as a single JSON line (without the trailing newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<RpcResponse> for ServerMessage {
    fn from(resp: RpcResponse) -> Self {
        ServerMessage::Response(resp)
    }
}

impl From<EventEnvelope> for ServerMessage {
    fn from(event: EventEnvelope) -> Self {
        ServerMessage::Event(event)
    }
}

// ---------------------------------------------------------------------------
// Request parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionParams {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecParams {
    pub session_id: String,
    pub command: String,
    /// Overrides the server's command-completion window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputParams {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub session_id: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_lines: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillParams {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillAllParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputParams {
    pub session_id: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_newline: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalParams {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeParams {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

/// Parameters naming a single session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceParams {
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_patterns: Vec<String>,
}

/// Subscription targets: a single id, a list, or everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<String>,
    #[serde(default)]
    pub all: bool,
    /// Number of historical lines to replay per targeted session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<usize>,
}

impl SubscribeParams {
    /// All explicitly named session ids
    pub fn targets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.session_id.iter().cloned().collect();
        for id in &self.sessions {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<String>,
    #[serde(default)]
    pub all: bool,
}

impl UnsubscribeParams {
    /// All explicitly named session ids
    pub fn targets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.session_id.iter().cloned().collect();
        for id in &self.sessions {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

/// A validated request: method name resolved to typed parameters
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCall {
    CreateSession(CreateSessionParams),
    Exec(ExecParams),
    Output(OutputParams),
    Search(SearchParams),
    List,
    Kill(KillParams),
    KillAll(KillAllParams),
    Input(InputParams),
    Signal(SignalParams),
    Resize(ResizeParams),
    Env(SessionRef),
    Pwd(SessionRef),
    StartService(ServiceParams),
    Subscribe(SubscribeParams),
    Unsubscribe(UnsubscribeParams),
    Health,
    Ping,
}

fn decode_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, ProtocolError> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

impl RpcCall {
    /// Resolve a method name and its raw params into a typed call
    pub fn parse(method: &str, params: Value) -> Result<Self, ProtocolError> {
        let call = match method {
            "session.create" => RpcCall::CreateSession(decode_params(method, params)?),
            "session.exec" => RpcCall::Exec(decode_params(method, params)?),
            "session.output" => RpcCall::Output(decode_params(method, params)?),
            "session.search" => RpcCall::Search(decode_params(method, params)?),
            "session.list" => RpcCall::List,
            "session.kill" => RpcCall::Kill(decode_params(method, params)?),
            "session.killAll" => RpcCall::KillAll(decode_params(method, params)?),
            "session.input" => RpcCall::Input(decode_params(method, params)?),
            "session.signal" => RpcCall::Signal(decode_params(method, params)?),
            "session.resize" => RpcCall::Resize(decode_params(method, params)?),
            "session.env" => RpcCall::Env(decode_params(method, params)?),
            "session.pwd" => RpcCall::Pwd(decode_params(method, params)?),
            "service.start" => RpcCall::StartService(decode_params(method, params)?),
            "session.subscribe" => RpcCall::Subscribe(decode_params(method, params)?),
            "session.unsubscribe" => RpcCall::Unsubscribe(decode_params(method, params)?),
            "server.health" => RpcCall::Health,
            "server.ping" => RpcCall::Ping,
            other => return Err(ProtocolError::UnknownMethod(other.to_string())),
        };
        Ok(call)
    }

    /// Decode a raw request
    pub fn from_request(request: RpcRequest) -> Result<Self, ProtocolError> {
        Self::parse(&request.method, request.params)
    }

    /// Wire name of this call's method
    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::CreateSession(_) => "session.create",
            RpcCall::Exec(_) => "session.exec",
            RpcCall::Output(_) => "session.output",
            RpcCall::Search(_) => "session.search",
            RpcCall::List => "session.list",
            RpcCall::Kill(_) => "session.kill",
            RpcCall::KillAll(_) => "session.killAll",
            RpcCall::Input(_) => "session.input",
            RpcCall::Signal(_) => "session.signal",
            RpcCall::Resize(_) => "session.resize",
            RpcCall::Env(_) => "session.env",
            RpcCall::Pwd(_) => "session.pwd",
            RpcCall::StartService(_) => "service.start",
            RpcCall::Subscribe(_) => "session.subscribe",
            RpcCall::Unsubscribe(_) => "session.unsubscribe",
            RpcCall::Health => "server.health",
            RpcCall::Ping => "server.ping",
        }
    }

    /// Encode the parameters as a JSON value
    pub fn params(&self) -> Result<Value, serde_json::Error> {
        match self {
            RpcCall::CreateSession(p) => serde_json::to_value(p),
            RpcCall::Exec(p) => serde_json::to_value(p),
            RpcCall::Output(p) => serde_json::to_value(p),
            RpcCall::Search(p) => serde_json::to_value(p),
            RpcCall::Kill(p) => serde_json::to_value(p),
            RpcCall::KillAll(p) => serde_json::to_value(p),
            RpcCall::Input(p) => serde_json::to_value(p),
            RpcCall::Signal(p) => serde_json::to_value(p),
            RpcCall::Resize(p) => serde_json::to_value(p),
            RpcCall::Env(p) | RpcCall::Pwd(p) => serde_json::to_value(p),
            RpcCall::StartService(p) => serde_json::to_value(p),
            RpcCall::Subscribe(p) => serde_json::to_value(p),
            RpcCall::Unsubscribe(p) => serde_json::to_value(p),
            RpcCall::List | RpcCall::Health | RpcCall::Ping => Ok(Value::Null),
        }
    }

    /// Build the wire request for this call
    pub fn into_request(self, id: u64) -> Result<RpcRequest, serde_json::Error> {
        Ok(RpcRequest {
            id: Some(id),
            method: self.method().to_string(),
            params: self.params()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Public snapshot of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub shell: String,
    pub cwd: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub log_lines: usize,
    pub queued_commands: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_command: Option<String>,
}

/// Result of a heuristically completed command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command: String,
    /// Output captured during the completion window
    pub output: String,
    /// Always 0: control returned, not necessarily finished
    pub exit_code: i32,
    pub duration_ms: u64,
    pub started_at: u64,
    pub finished_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResult {
    pub session_id: String,
    pub lines: Vec<String>,
    pub total_lines: usize,
}

/// One line of a search hit's surrounding context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextLine {
    /// 1-based position in the log buffer
    pub line_number: usize,
    pub text: String,
    pub is_match: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    /// 1-based position in the log buffer
    pub line_number: usize,
    pub line: String,
    /// Context window including the matching line itself
    pub context: Vec<ContextLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub session_id: String,
    pub pattern: String,
    pub matches: Vec<SearchMatch>,
    /// More matches existed than the server's cap
    pub truncated: bool,
}

/// Classification of a started service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Ready,
    Error,
    Running,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Ready => write!(f, "ready"),
            ServiceStatus::Error => write!(f, "error"),
            ServiceStatus::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResult {
    pub name: String,
    pub status: ServiceStatus,
    pub logs: Vec<String>,
    pub session: SessionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    /// Explicit subscriptions held by the connection after the call
    pub sessions: Vec<String>,
    pub all: bool,
    /// Number of backfilled output events pushed before this ack
    pub replayed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillResult {
    pub session_id: String,
    /// The process had to be force-killed
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillAllResult {
    pub killed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvResult {
    pub session_id: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PwdResult {
    pub session_id: String,
    pub cwd: String,
}

/// Process-wide health report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: String,
    pub sessions: usize,
    pub uptime_secs: u64,
    pub version: String,
}
