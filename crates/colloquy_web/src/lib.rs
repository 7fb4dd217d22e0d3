//! WebSocket endpoint serving one conversation session per connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use colloquy_runtime::{
    spawn_sink_worker, AgentEngine, JsonlTranscript, RuntimeError, SessionConfig,
    TranscriptRecord, TranscriptSink,
};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

mod connection;
mod state;

pub const CONVERSATION_PATH: &str = "/ws/conversation";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebConfig {
    pub inbound_channel_capacity: usize,
    pub outbound_channel_capacity: usize,
    pub sink_channel_capacity: usize,
    /// Upper bound for waiting on a superseded connection to shut down.
    pub stale_teardown_timeout: Duration,
    /// Append every outbound envelope of every session to this JSONL file, one
    /// record per line tagged with its connection id and session token.
    pub transcript_path: Option<PathBuf>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            inbound_channel_capacity: 32,
            outbound_channel_capacity: 512,
            sink_channel_capacity: 1024,
            stale_teardown_timeout: Duration::from_secs(5),
            transcript_path: None,
        }
    }
}

impl WebConfig {
    pub fn with_transcript_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcript_path = Some(path.into());
        self
    }

    pub fn with_stale_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.stale_teardown_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), WebError> {
        if self.inbound_channel_capacity == 0 {
            return Err(WebError::InvalidConfig(
                "inbound_channel_capacity must be > 0".to_owned(),
            ));
        }
        if self.outbound_channel_capacity == 0 {
            return Err(WebError::InvalidConfig(
                "outbound_channel_capacity must be > 0".to_owned(),
            ));
        }
        if self.stale_teardown_timeout.is_zero() {
            return Err(WebError::InvalidConfig(
                "stale_teardown_timeout must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WebError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("transcript sink unavailable: {0}")]
    Transcript(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Shared server state; cheap to clone into every connection.
#[derive(Clone)]
pub struct ConversationServer {
    engine: Arc<dyn AgentEngine>,
    session_config: SessionConfig,
    config: WebConfig,
    state: Arc<RwLock<state::ConnectionState>>,
    sink_tx: Option<mpsc::Sender<TranscriptRecord>>,
}

impl ConversationServer {
    pub async fn new(
        engine: Arc<dyn AgentEngine>,
        session_config: SessionConfig,
        config: WebConfig,
    ) -> Result<Self, WebError> {
        config.validate()?;
        session_config.validate()?;

        let sink_tx = match &config.transcript_path {
            Some(path) => {
                let sink: Arc<dyn TranscriptSink> = Arc::new(
                    JsonlTranscript::open(path)
                        .await
                        .map_err(|err| WebError::Transcript(err.to_string()))?,
                );
                let (tx, _worker) = spawn_sink_worker(sink, config.sink_channel_capacity)?;
                tracing::info!(path = %path.display(), "writing session transcript");
                Some(tx)
            }
            None => None,
        };

        Ok(Self {
            engine,
            session_config,
            config,
            state: Arc::new(RwLock::new(state::ConnectionState::default())),
            sink_tx,
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(CONVERSATION_PATH, get(connection::ws_handler))
            .with_state(self.clone())
    }

    pub async fn live_connections(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Connection currently bound to a session token, if any.
    pub async fn token_holder(&self, session_token: &str) -> Option<String> {
        self.state
            .read()
            .await
            .token_to_connection
            .get(session_token)
            .cloned()
    }
}

#[cfg(test)]
mod tests;
