//! Session lifecycle and output events
//!
//! The server emits [`SessionEvent`]s from the session manager; the transport
//! converts them to [`EventEnvelope`]s for the wire and clients convert them
//! back with [`SessionEvent::from_envelope`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::{EventEnvelope, SessionInfo};

pub const EVENT_CREATED: &str = "session:created";
pub const EVENT_OUTPUT: &str = "session:output";
pub const EVENT_EXIT: &str = "session:exit";
pub const EVENT_COMMAND_START: &str = "command:start";
pub const EVENT_COMMAND_FINISHED: &str = "command:finished";
pub const EVENT_INPUT: &str = "session:input";
pub const EVENT_SIGNAL: &str = "session:signal";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    /// Raw decoded chunk, control sequences preserved
    pub chunk: String,
    /// Lines completed by this chunk
    pub lines: Vec<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitPayload {
    pub exit_code: Option<i32>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStartPayload {
    pub command: String,
    pub started_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFinishedPayload {
    pub command: String,
    pub duration: u64,
    pub exit_code: i32,
    pub output: String,
    pub finished_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPayload {
    pub input: String,
    pub append_newline: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub signal: String,
    pub timestamp: u64,
}

/// Event emitted by the session manager
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session was created (global, not tied to a subscription)
    Created(SessionInfo),
    Output {
        session_id: String,
        payload: OutputPayload,
    },
    Exit {
        session_id: String,
        payload: ExitPayload,
    },
    CommandStart {
        session_id: String,
        payload: CommandStartPayload,
    },
    CommandFinished {
        session_id: String,
        payload: CommandFinishedPayload,
    },
    Input {
        session_id: String,
        payload: InputPayload,
    },
    Signal {
        session_id: String,
        payload: SignalPayload,
    },
}

impl SessionEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Created(_) => EVENT_CREATED,
            SessionEvent::Output { .. } => EVENT_OUTPUT,
            SessionEvent::Exit { .. } => EVENT_EXIT,
            SessionEvent::CommandStart { .. } => EVENT_COMMAND_START,
            SessionEvent::CommandFinished { .. } => EVENT_COMMAND_FINISHED,
            SessionEvent::Input { .. } => EVENT_INPUT,
            SessionEvent::Signal { .. } => EVENT_SIGNAL,
        }
    }

    /// Session this event is routed by; `None` means broadcast to everyone
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionEvent::Created(_) => None,
            SessionEvent::Output { session_id, .. }
            | SessionEvent::Exit { session_id, .. }
            | SessionEvent::CommandStart { session_id, .. }
            | SessionEvent::CommandFinished { session_id, .. }
            | SessionEvent::Input { session_id, .. }
            | SessionEvent::Signal { session_id, .. } => Some(session_id),
        }
    }

    /// Convert to the wire envelope
    pub fn to_envelope(&self) -> Result<EventEnvelope, serde_json::Error> {
        let payload = match self {
            SessionEvent::Created(info) => serde_json::to_value(info)?,
            SessionEvent::Output { payload, .. } => serde_json::to_value(payload)?,
            SessionEvent::Exit { payload, .. } => serde_json::to_value(payload)?,
            SessionEvent::CommandStart { payload, .. } => serde_json::to_value(payload)?,
            SessionEvent::CommandFinished { payload, .. } => serde_json::to_value(payload)?,
            SessionEvent::Input { payload, .. } => serde_json::to_value(payload)?,
            SessionEvent::Signal { payload, .. } => serde_json::to_value(payload)?,
        };

        Ok(EventEnvelope {
            event: self.name().to_string(),
            session_id: self.session_id().map(str::to_string),
            payload,
        })
    }

    /// Decode a wire envelope; `Ok(None)` for event names this build does not know
    pub fn from_envelope(envelope: EventEnvelope) -> Result<Option<Self>, serde_json::Error> {
        let EventEnvelope {
            event,
            session_id,
            payload,
        } = envelope;

        if event == EVENT_CREATED {
            return Ok(Some(SessionEvent::Created(serde_json::from_value(payload)?)));
        }

        let session_id = session_id.unwrap_or_default();
        let event = match event.as_str() {
            EVENT_OUTPUT => SessionEvent::Output {
                session_id,
                payload: from_payload(payload)?,
            },
            EVENT_EXIT => SessionEvent::Exit {
                session_id,
                payload: from_payload(payload)?,
            },
            EVENT_COMMAND_START => SessionEvent::CommandStart {
                session_id,
                payload: from_payload(payload)?,
            },
            EVENT_COMMAND_FINISHED => SessionEvent::CommandFinished {
                session_id,
                payload: from_payload(payload)?,
            },
            EVENT_INPUT => SessionEvent::Input {
                session_id,
                payload: from_payload(payload)?,
            },
            EVENT_SIGNAL => SessionEvent::Signal {
                session_id,
                payload: from_payload(payload)?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn from_payload<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_envelope_shape() {
        let event = SessionEvent::Output {
            session_id: "s1".to_string(),
            payload: OutputPayload {
                chunk: "hi\r\n".to_string(),
                lines: vec!["hi".to_string()],
                timestamp: 10,
            },
        };

        let envelope = event.to_envelope().unwrap();
        assert_eq!(envelope.event, "session:output");
        assert_eq!(envelope.session_id.as_deref(), Some("s1"));
        assert_eq!(envelope.payload["lines"][0], "hi");

        let decoded = SessionEvent::from_envelope(envelope).unwrap().unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_created_is_global() {
        let info = SessionInfo {
            id: "s1".to_string(),
            shell: "/bin/sh".to_string(),
            cwd: "/tmp".to_string(),
            pid: Some(42),
            alive: true,
            created_at: 1,
            last_activity_at: 1,
            log_lines: 0,
            queued_commands: 0,
            current_command: None,
        };
        let event = SessionEvent::Created(info);
        assert_eq!(event.session_id(), None);

        let envelope = event.to_envelope().unwrap();
        assert!(envelope.session_id.is_none());
        assert_eq!(envelope.payload["id"], "s1");
    }

    #[test]
    fn test_unknown_event_is_skipped() {
        let envelope = EventEnvelope {
            event: "session:teleported".to_string(),
            session_id: Some("s1".to_string()),
            payload: Value::Null,
        };
        assert!(SessionEvent::from_envelope(envelope).unwrap().is_none());
    }
}
