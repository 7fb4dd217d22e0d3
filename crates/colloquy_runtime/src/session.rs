//! Per-connection conversation session.
//!
//! A [`Session`] is an actor: it owns the session token, the permission arbitrator, and at
//! most one active run, and it processes client envelopes and run progress one at a time on
//! a single task. The run itself executes on its own task and reports back over a channel.

use std::sync::Arc;

use colloquy_protocol::{ClientEnvelope, PermissionMode, ServerEnvelope, SessionStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::engine::{AgentEngine, RunControl, RunOptions};
use crate::errors::RuntimeError;
use crate::feeder::{turn_channel, Delivery, FeedError, TurnFeeder};
use crate::outbound::Outbound;
use crate::permissions::{PermissionArbitrator, PermissionGate};

mod run;

use run::{RunDriver, RunEvent, RunOutcome};

pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired, starting fresh...";
pub const TURN_QUEUE_FULL_MESSAGE: &str =
    "A message is already queued for the current response; wait for it to finish.";

const RUN_EVENT_CAPACITY: usize = 16;

struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
    feeder: TurnFeeder,
    control: Option<Arc<dyn RunControl>>,
    task: JoinHandle<()>,
}

pub struct Session {
    engine: Arc<dyn AgentEngine>,
    config: SessionConfig,
    outbound: Outbound,
    arbitrator: Arc<PermissionArbitrator>,
    session_token: Option<String>,
    active: Option<ActiveRun>,
    /// A turn that arrived after the active run stopped accepting input.
    deferred_turn: Option<String>,
    next_run_id: u64,
    run_events_tx: mpsc::Sender<RunEvent>,
    run_events_rx: mpsc::Receiver<RunEvent>,
}

impl Session {
    pub fn new(
        engine: Arc<dyn AgentEngine>,
        config: SessionConfig,
        outbound: Outbound,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let arbitrator = Arc::new(PermissionArbitrator::new(
            config.permission_mode,
            config.safe_tools.iter().cloned(),
            outbound.clone(),
        ));
        let (run_events_tx, run_events_rx) = mpsc::channel(RUN_EVENT_CAPACITY);
        Ok(Self {
            engine,
            config,
            outbound,
            arbitrator,
            session_token: None,
            active: None,
            deferred_turn: None,
            next_run_id: 0,
            run_events_tx,
            run_events_rx,
        })
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn permission_mode(&self) -> PermissionMode {
        self.arbitrator.mode()
    }

    /// Serve the session until `inbound` closes, then tear the active run down.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientEnvelope>) {
        self.send(ServerEnvelope::status(SessionStatus::Idle)).await;
        self.send(ServerEnvelope::PermissionMode {
            mode: self.arbitrator.mode(),
        })
        .await;

        loop {
            tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => break,
                },
                Some(event) = self.run_events_rx.recv() => self.on_run_event(event).await,
            }
        }

        self.shutdown().await;
    }

    async fn handle_envelope(&mut self, envelope: ClientEnvelope) {
        match envelope {
            ClientEnvelope::UserMessage { text } => self.submit_turn(text).await,
            ClientEnvelope::PermissionResponse {
                request_id,
                behavior,
                message,
            } => match request_id.parse::<u64>() {
                Ok(request_id) => {
                    self.arbitrator.resolve(request_id, behavior, message);
                }
                Err(_) => tracing::debug!(%request_id, "ignoring malformed permission request id"),
            },
            ClientEnvelope::SetPermissionMode { mode } => self.set_permission_mode(&mode).await,
            ClientEnvelope::Interrupt => self.interrupt(),
            ClientEnvelope::ResumeSession { session_id } => {
                tracing::info!(%session_id, "client resumed session");
                self.set_session_token(Some(session_id));
                self.send(ServerEnvelope::status(SessionStatus::Idle)).await;
            }
            ClientEnvelope::NewSession => {
                self.retire_active_run();
                self.set_session_token(None);
                self.deferred_turn = None;
                self.send(ServerEnvelope::status(SessionStatus::Idle)).await;
            }
        }
    }

    /// Deliver a turn to the active run, or start a run for it.
    async fn submit_turn(&mut self, turn: String) {
        self.send(ServerEnvelope::status(SessionStatus::Thinking))
            .await;

        let Some(active) = &self.active else {
            self.start_run(turn);
            return;
        };

        match active.feeder.offer(turn) {
            Ok(Delivery::Handed) => tracing::debug!(run_id = active.id, "turn handed to active run"),
            Ok(Delivery::Parked) => tracing::debug!(run_id = active.id, "turn parked for active run"),
            Err(FeedError::Occupied(_)) => {
                self.send(ServerEnvelope::error(TURN_QUEUE_FULL_MESSAGE)).await;
            }
            // Unreachable while feeders are closed only after leaving `active`; a turn
            // racing the run's end is parked and comes back as the leftover instead.
            Err(FeedError::Closed(turn)) => self.keep_for_next_run(Some(turn)),
        }
    }

    fn start_run(&mut self, turn: String) {
        self.next_run_id += 1;
        let run_id = self.next_run_id;
        let cancel = CancellationToken::new();
        let (feeder, turns) = turn_channel(turn.clone(), cancel.clone());
        let options = RunOptions {
            workspace_root: self.config.workspace_root.clone(),
            resume: self.session_token.clone(),
            permission_mode: self.arbitrator.mode(),
            permissions: PermissionGate::new(Arc::clone(&self.arbitrator), cancel.clone()),
            cancel: cancel.clone(),
        };
        tracing::info!(
            run_id,
            resume = options.resume.as_deref().unwrap_or(""),
            "starting agent run"
        );

        let driver = RunDriver {
            run_id,
            engine: Arc::clone(&self.engine),
            first_turn: turn,
            outbound: self.outbound.clone(),
            events: self.run_events_tx.clone(),
            drain_timeout: self.config.shutdown_grace,
        };
        let task = tokio::spawn(driver.drive(turns, options));
        self.active = Some(ActiveRun {
            id: run_id,
            cancel,
            feeder,
            control: None,
            task,
        });
    }

    async fn set_permission_mode(&mut self, mode: &str) {
        let mode = match mode.parse::<PermissionMode>() {
            Ok(mode) => mode,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring permission mode change");
                return;
            }
        };
        self.arbitrator.set_mode(mode);

        if let Some(control) = self.active.as_ref().and_then(|active| active.control.clone()) {
            tokio::spawn(async move {
                if let Err(err) = control.set_permission_mode(mode).await {
                    tracing::warn!(%mode, error = %err, "failed to notify engine of permission mode");
                }
            });
        }
        self.send(ServerEnvelope::PermissionMode { mode }).await;
    }

    /// Cancel the active run's scope. The idle status follows once the run reports back.
    fn interrupt(&mut self) {
        let Some(active) = &self.active else {
            tracing::debug!("interrupt with no active run");
            return;
        };
        tracing::info!(run_id = active.id, "interrupting agent run");
        if let Some(control) = active.control.clone() {
            tokio::spawn(async move {
                if let Err(err) = control.interrupt().await {
                    tracing::debug!(error = %err, "engine interrupt request failed");
                }
            });
        }
        active.cancel.cancel();
    }

    /// Stop the active run without waiting; its completion report will be ignored.
    fn retire_active_run(&mut self) -> Option<JoinHandle<()>> {
        let active = self.active.take()?;
        tracing::info!(run_id = active.id, "retiring agent run");
        active.feeder.close();
        active.cancel.cancel();
        Some(active.task)
    }

    async fn on_run_event(&mut self, event: RunEvent) {
        match event {
            RunEvent::Started { run_id, control } => {
                if let Some(active) = self.active.as_mut().filter(|active| active.id == run_id) {
                    active.control = Some(control);
                }
            }
            RunEvent::SessionToken { run_id, token } => {
                if self.is_active(run_id) {
                    tracing::info!(run_id, session_token = %token, "session established");
                    self.set_session_token(Some(token));
                }
            }
            RunEvent::Finished { run_id, outcome } => {
                if !self.is_active(run_id) {
                    tracing::debug!(run_id, "ignoring completion of retired run");
                    return;
                }
                self.on_run_finished(outcome).await;
            }
        }
    }

    async fn on_run_finished(&mut self, outcome: RunOutcome) {
        let Some(active) = self.active.take() else {
            return;
        };
        let leftover = active.feeder.close();

        match outcome {
            RunOutcome::Completed => {
                self.keep_for_next_run(leftover);
                self.send(ServerEnvelope::status(SessionStatus::Idle)).await;
            }
            RunOutcome::Aborted => {
                if leftover.is_some() || self.deferred_turn.is_some() {
                    tracing::debug!(run_id = active.id, "dropping turns queued behind an interrupted run");
                }
                self.deferred_turn = None;
                self.send(ServerEnvelope::status(SessionStatus::Idle)).await;
            }
            RunOutcome::Failed { message } => {
                self.keep_for_next_run(leftover);
                self.send(ServerEnvelope::error(message)).await;
                self.send(ServerEnvelope::status(SessionStatus::Idle)).await;
            }
            RunOutcome::ResumeExpired { turn } => {
                self.keep_for_next_run(leftover);
                self.set_session_token(None);
                self.send(ServerEnvelope::error(SESSION_EXPIRED_MESSAGE)).await;
                // Without a token the retry cannot expire again.
                self.start_run(turn);
                return;
            }
        }

        if let Some(turn) = self.deferred_turn.take() {
            self.send(ServerEnvelope::status(SessionStatus::Thinking))
                .await;
            self.start_run(turn);
        }
    }

    fn keep_for_next_run(&mut self, leftover: Option<String>) {
        if let Some(turn) = leftover {
            if self.deferred_turn.is_none() {
                self.deferred_turn = Some(turn);
            }
        }
    }

    fn is_active(&self, run_id: u64) -> bool {
        self.active.as_ref().is_some_and(|active| active.id == run_id)
    }

    async fn shutdown(&mut self) {
        let Some(task) = self.retire_active_run() else {
            return;
        };
        let grace = self.config.shutdown_grace;
        let abort = task.abort_handle();
        if timeout(grace, task).await.is_err() {
            tracing::warn!("agent run did not stop within the shutdown grace; aborting");
            abort.abort();
        }
    }

    fn set_session_token(&mut self, token: Option<String>) {
        self.outbound.tag_session(token.as_deref());
        self.session_token = token;
    }

    async fn send(&self, envelope: ServerEnvelope) {
        if !self.outbound.send(envelope).await {
            tracing::debug!("session outbound closed");
        }
    }
}

#[cfg(test)]
mod tests;
