use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use colloquy_protocol::ServerEnvelope;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::errors::RuntimeError;
use crate::sink::{TranscriptRecord, TranscriptSink};

/// Server-to-client envelope path for one session.
/// Every component of a session (orchestrator, run driver, arbitrator) shares a clone.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::Sender<ServerEnvelope>,
    tap: Option<Arc<TranscriptTap>>,
}

/// Transcript identity of one connection. Shared by every clone of its `Outbound`.
#[derive(Debug)]
struct TranscriptTap {
    connection_id: String,
    session_token: Mutex<Option<String>>,
    tx: mpsc::Sender<TranscriptRecord>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<ServerEnvelope>) -> Self {
        Self { tx, tap: None }
    }

    /// Mirror every envelope into the transcript queue, tagged with `connection_id`.
    pub fn with_transcript(
        mut self,
        connection_id: impl Into<String>,
        sink_tx: mpsc::Sender<TranscriptRecord>,
    ) -> Self {
        self.tap = Some(Arc::new(TranscriptTap {
            connection_id: connection_id.into(),
            session_token: Mutex::new(None),
            tx: sink_tx,
        }));
        self
    }

    /// Session token attached to subsequent transcript records.
    pub fn tag_session(&self, session_token: Option<&str>) {
        if let Some(tap) = &self.tap {
            *lock(&tap.session_token) = session_token.map(ToOwned::to_owned);
        }
    }

    /// Send one envelope toward the client. Returns false once the connection is gone;
    /// callers treat that as a no-op, never as a failure of the run.
    pub async fn send(&self, envelope: ServerEnvelope) -> bool {
        if let Some(tap) = &self.tap {
            if let ServerEnvelope::SessionInit { session_id, .. } = &envelope {
                self.tag_session(Some(session_id));
            }
            tap.record(&envelope);
        }
        self.tx.send(envelope).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl TranscriptTap {
    /// Queue without blocking the session; a full or closed queue drops the record.
    fn record(&self, envelope: &ServerEnvelope) {
        let session_token = lock(&self.session_token).clone();
        let record = TranscriptRecord::new(self.connection_id.clone(), session_token, envelope.clone());
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    kind = envelope.kind(),
                    "transcript queue full; dropping envelope"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    kind = envelope.kind(),
                    "transcript queue closed; dropping envelope"
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start the transcript worker shared by all sessions of a server.
/// The worker numbers records in the order it writes them.
pub fn spawn_sink_worker(
    sink: Arc<dyn TranscriptSink>,
    capacity: usize,
) -> Result<(mpsc::Sender<TranscriptRecord>, JoinHandle<()>), RuntimeError> {
    if capacity == 0 {
        return Err(RuntimeError::InvalidConfig(
            "sink_channel_capacity must be > 0".to_owned(),
        ));
    }
    let (tx, rx) = mpsc::channel(capacity);
    let task = tokio::spawn(sink_loop(sink, rx));
    Ok((tx, task))
}

/// Sink failures are logged and never fail session dispatch.
async fn sink_loop(sink: Arc<dyn TranscriptSink>, mut rx: mpsc::Receiver<TranscriptRecord>) {
    let mut next_seq = 1;
    while let Some(mut record) = rx.recv().await {
        record.seq = next_seq;
        next_seq += 1;
        if let Err(err) = sink.append(&record).await {
            tracing::warn!(
                seq = record.seq,
                connection_id = %record.connection_id,
                kind = record.envelope.kind(),
                error = %err,
                "transcript write failed"
            );
        }
    }
}
