//! Maps validated RPC calls onto session manager operations

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use sm_core::error::{ProtocolError, SessionError};
use sm_core::rpc::{RpcCall, RpcRequest, RpcResponse};

use super::router::{ConnectionId, RouterClosed};
use crate::session::SessionOptions;
use crate::state::ServerState;

/// Why a request produced an error response
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Router(#[from] RouterClosed),

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Handle one request line and produce its response
pub async fn handle_line(state: &ServerState, connection: ConnectionId, line: &str) -> RpcResponse {
    let request = match serde_json::from_str::<RpcRequest>(line) {
        Ok(request) => request,
        Err(e) => {
            let error = ProtocolError::InvalidRequest(e.to_string());
            tracing::debug!(connection, "{}", error);
            return RpcResponse::error(None, error.to_string());
        }
    };

    let id = request.id;
    let method = request.method.clone();
    tracing::debug!(connection, ?id, method = %method, "Request");

    let result = match RpcCall::from_request(request) {
        Ok(call) => dispatch(state, connection, call).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err(e) => {
            tracing::debug!(connection, ?id, method = %method, "Request failed: {}", e);
            RpcResponse::error(id, e.to_string())
        }
    }
}

/// Execute a validated call
pub async fn dispatch(
    state: &ServerState,
    connection: ConnectionId,
    call: RpcCall,
) -> Result<Value, DispatchError> {
    let sessions = &state.sessions;

    match call {
        RpcCall::CreateSession(params) => {
            let options = SessionOptions {
                cwd: params.cwd.map(PathBuf::from),
                env: params.env.unwrap_or_default(),
                shell: params.shell,
            };
            encode(sessions.create_session(&params.id, options).await?)
        }

        RpcCall::Exec(params) => {
            let timeout = params.timeout_ms.map(Duration::from_millis);
            encode(
                sessions
                    .exec_command(&params.session_id, &params.command, timeout)
                    .await?,
            )
        }

        RpcCall::Output(params) => encode(sessions.get_output(&params.session_id, params.lines)?),

        RpcCall::Search(params) => encode(sessions.search_logs(
            &params.session_id,
            &params.pattern,
            params.context_lines.unwrap_or(0),
        )?),

        RpcCall::List => encode(sessions.list_sessions()),

        RpcCall::Kill(params) => encode(
            sessions
                .kill_session(&params.session_id, params.graceful.unwrap_or(true))
                .await?,
        ),

        RpcCall::KillAll(params) => {
            encode(sessions.kill_all(params.graceful.unwrap_or(true)).await)
        }

        RpcCall::Input(params) => {
            sessions.send_input(
                &params.session_id,
                &params.input,
                params.append_newline.unwrap_or(true),
            )?;
            Ok(json!({ "success": true }))
        }

        RpcCall::Signal(params) => {
            let signal = params.signal.as_deref().unwrap_or("SIGINT");
            let delivered = sessions.send_signal(&params.session_id, signal)?;
            Ok(json!({ "success": true, "signal": delivered.name() }))
        }

        RpcCall::Resize(params) => {
            sessions.resize(&params.session_id, params.cols, params.rows)?;
            Ok(json!({ "success": true }))
        }

        RpcCall::Env(params) => encode(sessions.session_env(&params.session_id)?),

        RpcCall::Pwd(params) => encode(sessions.session_pwd(&params.session_id)?),

        RpcCall::StartService(params) => encode(sessions.start_service(params).await?),

        RpcCall::Subscribe(params) => encode(state.router.subscribe(connection, params).await?),

        RpcCall::Unsubscribe(params) => {
            encode(state.router.unsubscribe(connection, params).await?)
        }

        RpcCall::Health => encode(state.health()),

        RpcCall::Ping => Ok(json!("pong")),
    }
}

fn encode<T: Serialize>(value: T) -> Result<Value, DispatchError> {
    Ok(serde_json::to_value(value)?)
}
