//! Session transcript export. Every outbound envelope becomes one [`TranscriptRecord`]
//! naming the connection and session it belongs to, so a server-wide transcript can be
//! split back into conversations.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use colloquy_protocol::ServerEnvelope;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::errors::SinkError;

pub type TranscriptSinkFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// One transcript line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRecord {
    /// Write order across the whole transcript, starting at 1.
    pub seq: u64,
    pub ts_millis: i64,
    pub connection_id: String,
    /// Engine session the envelope belongs to; absent before the first run reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub envelope: ServerEnvelope,
}

impl TranscriptRecord {
    /// Record stamped with the current time. `seq` is assigned by the sink worker.
    pub fn new(
        connection_id: impl Into<String>,
        session_token: Option<String>,
        envelope: ServerEnvelope,
    ) -> Self {
        Self {
            seq: 0,
            ts_millis: now_millis(),
            connection_id: connection_id.into(),
            session_token,
            envelope,
        }
    }
}

/// Destination for transcript records. Failures are reported, never panicked on.
pub trait TranscriptSink: Send + Sync + 'static {
    fn append<'a>(&'a self, record: &'a TranscriptRecord) -> TranscriptSinkFuture<'a>;
}

/// Append-only JSONL transcript file, one record per line.
#[derive(Debug)]
pub struct JsonlTranscript {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlTranscript {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await
            .map_err(io_error)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl TranscriptSink for JsonlTranscript {
    fn append<'a>(&'a self, record: &'a TranscriptRecord) -> TranscriptSinkFuture<'a> {
        Box::pin(async move {
            let line = serde_json::to_string(record)
                .map_err(|err| SinkError::Serialize(err.to_string()))?;

            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await.map_err(io_error)?;
            writer.write_all(b"\n").await.map_err(io_error)?;
            // Lines stay whole on disk even if the process dies mid-session.
            writer.flush().await.map_err(io_error)
        })
    }
}

fn io_error(err: std::io::Error) -> SinkError {
    SinkError::Io(err.to_string())
}

fn now_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}
