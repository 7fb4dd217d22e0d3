use std::collections::VecDeque;
use std::sync::Arc;

use colloquy_protocol::{
    ClientEnvelope, ContentBlock, PermissionBehavior, PermissionMode, RunResult, ServerEnvelope,
    SessionStatus, StreamEvent,
};
use serde_json::Value;

use crate::assembler::MessageAssembler;
use crate::errors::ClientError;
use crate::store::{MemoryTokenStore, TokenStore};
use crate::transcript::Transcript;

/// A tool invocation waiting for the user's decision.
#[derive(Clone, Debug, PartialEq)]
pub struct PermissionPrompt {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Point-in-time view of a client session, cheap enough to publish after every change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientSnapshot {
    pub status: SessionStatus,
    pub session_token: Option<String>,
    pub permission_mode: PermissionMode,
    /// Oldest first; the front is the one the user is asked about.
    pub pending_permissions: Vec<PermissionPrompt>,
    pub model: Option<String>,
    pub last_result: Option<RunResult>,
    pub transcript: Vec<crate::transcript::TranscriptEntry>,
}

/// Client-side session state machine.
///
/// Pure: it consumes server envelopes and user actions and returns the envelopes
/// to send, leaving I/O to the connection driver.
pub struct SessionClient {
    status: SessionStatus,
    session_token: Option<String>,
    permission_mode: PermissionMode,
    pending_permissions: VecDeque<PermissionPrompt>,
    model: Option<String>,
    last_result: Option<RunResult>,
    transcript: Transcript,
    assembler: MessageAssembler,
    store: Arc<dyn TokenStore>,
}

impl Default for SessionClient {
    fn default() -> Self {
        Self::new(Arc::new(MemoryTokenStore::new()))
    }
}

impl SessionClient {
    /// Start in `connecting`, seeded with whatever token the store already holds.
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        let session_token = store.load().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to load session token");
            None
        });
        Self {
            status: SessionStatus::Connecting,
            session_token,
            permission_mode: PermissionMode::default(),
            pending_permissions: VecDeque::new(),
            model: None,
            last_result: None,
            transcript: Transcript::default(),
            assembler: MessageAssembler::new(),
            store,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn permission_mode(&self) -> PermissionMode {
        self.permission_mode
    }

    pub fn pending_permission(&self) -> Option<&PermissionPrompt> {
        self.pending_permissions.front()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn last_result(&self) -> Option<&RunResult> {
        self.last_result.as_ref()
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            status: self.status,
            session_token: self.session_token.clone(),
            permission_mode: self.permission_mode,
            pending_permissions: self.pending_permissions.iter().cloned().collect(),
            model: self.model.clone(),
            last_result: self.last_result.clone(),
            transcript: self.transcript.entries().to_vec(),
        }
    }

    /// Transport is up. Returns the resume envelope when a token is held.
    pub fn on_connected(&mut self) -> Option<ClientEnvelope> {
        self.status = SessionStatus::Idle;
        self.session_token
            .clone()
            .map(|session_id| ClientEnvelope::ResumeSession { session_id })
    }

    /// Transport is down. The server aborted whatever was in flight, so partial
    /// output and the open permission prompt are dropped.
    pub fn on_disconnected(&mut self) {
        self.status = SessionStatus::Connecting;
        self.pending_permissions.clear();
        self.assembler.reset();
        self.transcript.discard_streaming();
    }

    pub fn on_envelope(&mut self, envelope: ServerEnvelope) {
        match envelope {
            ServerEnvelope::SessionInit {
                session_id, model, ..
            } => {
                if let Err(err) = self.store.save(&session_id) {
                    tracing::warn!(error = %err, "failed to persist session token");
                }
                self.session_token = Some(session_id);
                self.model = model;
            }
            ServerEnvelope::Status { state } => self.status = state,
            ServerEnvelope::StreamEvent {
                event,
                parent_tool_use_id,
            } => self.on_stream_event(event, parent_tool_use_id),
            ServerEnvelope::AssistantMessage {
                message,
                parent_tool_use_id,
            } => {
                let content = self.assembler.finalize(&message);
                self.transcript.finalize_assistant(content, parent_tool_use_id);
            }
            ServerEnvelope::PermissionRequest {
                request_id,
                tool_name,
                input,
            } => {
                self.pending_permissions.push_back(PermissionPrompt {
                    request_id,
                    tool_name,
                    input,
                });
                self.status = SessionStatus::WaitingPermission;
            }
            ServerEnvelope::PermissionMode { mode } => self.permission_mode = mode,
            ServerEnvelope::Result(result) => {
                self.status = SessionStatus::Idle;
                self.last_result = Some(result);
            }
            ServerEnvelope::Error { message } => {
                self.status = SessionStatus::Error;
                self.transcript.push_error(message);
            }
            ServerEnvelope::EngineMessage { engine_type, .. } => {
                tracing::trace!(engine_type = %engine_type, "engine message not rendered");
            }
        }
    }

    fn on_stream_event(&mut self, event: Value, parent_tool_use_id: Option<String>) {
        let event = match serde_json::from_value::<StreamEvent>(event) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring malformed stream event");
                return;
            }
        };
        let applied = self.assembler.apply(&event);
        if let Some(status) = applied.status {
            self.status = status;
        }
        if applied.changed {
            let blocks = self.assembler.snapshot();
            if blocks.is_empty() {
                self.transcript.discard_streaming();
            } else {
                self.transcript.upsert_streaming(blocks, parent_tool_use_id);
            }
        }
    }

    /// Blank turns are dropped locally.
    pub fn send_message(&mut self, text: &str) -> Option<ClientEnvelope> {
        if text.trim().is_empty() {
            return None;
        }
        self.transcript.push_user(text);
        self.status = SessionStatus::Thinking;
        Some(ClientEnvelope::UserMessage {
            text: text.to_owned(),
        })
    }

    pub fn respond_permission(
        &mut self,
        behavior: PermissionBehavior,
        message: Option<String>,
    ) -> Result<ClientEnvelope, ClientError> {
        let prompt = self
            .pending_permissions
            .pop_front()
            .ok_or(ClientError::NoPendingPermission)?;
        self.status = if self.pending_permissions.is_empty() {
            SessionStatus::ToolExecuting
        } else {
            SessionStatus::WaitingPermission
        };
        Ok(ClientEnvelope::PermissionResponse {
            request_id: prompt.request_id,
            behavior,
            message,
        })
    }

    pub fn interrupt(&mut self) -> ClientEnvelope {
        self.pending_permissions.clear();
        self.status = SessionStatus::Idle;
        ClientEnvelope::Interrupt
    }

    /// The mode changes locally only once the server confirms it.
    pub fn change_permission_mode(&self, mode: PermissionMode) -> ClientEnvelope {
        ClientEnvelope::set_permission_mode(mode)
    }

    /// Forget the conversation and its token; the next turn starts a fresh session.
    pub fn new_session(&mut self) -> ClientEnvelope {
        if let Err(err) = self.store.clear() {
            tracing::warn!(error = %err, "failed to clear stored session token");
        }
        self.session_token = None;
        self.model = None;
        self.last_result = None;
        self.pending_permissions.clear();
        self.transcript.clear();
        self.assembler.reset();
        self.status = SessionStatus::Idle;
        ClientEnvelope::NewSession
    }

    /// Content of the streaming placeholder, if a message is being streamed.
    pub fn streaming_content(&self) -> Option<&[ContentBlock]> {
        self.transcript
            .streaming_entry()
            .map(|entry| entry.content.as_slice())
    }
}
