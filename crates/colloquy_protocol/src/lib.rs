//! Wire contract shared by the colloquy server and client.
//! Every envelope is one JSON object per transport message, discriminated by `type`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

mod content;

pub use content::{BlockDelta, ContentBlock, StreamEvent};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid permission mode: {0}")]
    InvalidPermissionMode(String),
}

/// Session-scoped policy deciding which tool invocations need a human decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionMode {
    #[default]
    #[serde(rename = "bypassPermissions")]
    AlwaysAllow,
    #[serde(rename = "acceptEdits")]
    AllowSafe,
    #[serde(rename = "default")]
    ConfirmAll,
}

impl PermissionMode {
    pub const ALL: [Self; 3] = [Self::AlwaysAllow, Self::AllowSafe, Self::ConfirmAll];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlwaysAllow => "bypassPermissions",
            Self::AllowSafe => "acceptEdits",
            Self::ConfirmAll => "default",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == value)
            .ok_or_else(|| ProtocolError::InvalidPermissionMode(value.to_owned()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

/// Lifecycle state shared by the server `status` envelope and the client state machine.
/// The server only ever reports `idle` and `thinking`; the rest are client-derived.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Connecting,
    Idle,
    Thinking,
    Streaming,
    ToolExecuting,
    WaitingPermission,
    Error,
}

/// Envelopes sent by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    UserMessage {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    PermissionResponse {
        request_id: String,
        behavior: PermissionBehavior,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Raw mode string; the server validates it and ignores unknown values.
    SetPermissionMode {
        mode: String,
    },
    Interrupt,
    #[serde(rename_all = "camelCase")]
    ResumeSession {
        session_id: String,
    },
    NewSession,
}

impl ClientEnvelope {
    pub fn set_permission_mode(mode: PermissionMode) -> Self {
        Self::SetPermissionMode {
            mode: mode.as_str().to_owned(),
        }
    }
}

/// Envelopes sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    #[serde(rename_all = "camelCase")]
    SessionInit {
        session_id: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        tools: Vec<String>,
    },
    Status {
        state: SessionStatus,
    },
    #[serde(rename_all = "camelCase")]
    StreamEvent {
        event: Value,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AssistantMessage {
        message: Value,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        request_id: String,
        tool_name: String,
        input: Value,
    },
    PermissionMode {
        mode: PermissionMode,
    },
    Result(RunResult),
    Error {
        message: String,
    },
    /// Engine output of a kind this protocol does not model, forwarded untouched.
    #[serde(rename_all = "camelCase")]
    EngineMessage {
        engine_type: String,
        data: Value,
    },
}

impl ServerEnvelope {
    pub fn status(state: SessionStatus) -> Self {
        Self::Status { state }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wire discriminator, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionInit { .. } => "session_init",
            Self::Status { .. } => "status",
            Self::StreamEvent { .. } => "stream_event",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::PermissionRequest { .. } => "permission_request",
            Self::PermissionMode { .. } => "permission_mode",
            Self::Result(_) => "result",
            Self::Error { .. } => "error",
            Self::EngineMessage { .. } => "engine_message",
        }
    }
}

/// Summary emitted when the engine finishes answering a turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub is_error: bool,
}

/// Empty JSON object; the fallback input for tool-use blocks.
pub fn empty_input() -> Value {
    Value::Object(Map::new())
}
