use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::engine::{AgentEngine, EngineRun, RunControl, RunOptions};
use crate::errors::EngineError;
use crate::feeder::TurnSource;
use crate::outbound::Outbound;

/// Progress reported by a run task back to its session.
pub(crate) enum RunEvent {
    Started {
        run_id: u64,
        control: Arc<dyn RunControl>,
    },
    SessionToken {
        run_id: u64,
        token: String,
    },
    Finished {
        run_id: u64,
        outcome: RunOutcome,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Aborted,
    Failed { message: String },
    /// The resumed engine state is gone; `turn` is the turn that started the run.
    ResumeExpired { turn: String },
}

/// Task body for one run: start the engine, forward its outputs, report the outcome.
pub(crate) struct RunDriver {
    pub(crate) run_id: u64,
    pub(crate) engine: Arc<dyn AgentEngine>,
    pub(crate) first_turn: String,
    pub(crate) outbound: Outbound,
    pub(crate) events: mpsc::Sender<RunEvent>,
    /// Bound on waiting for the engine to wind down after cancellation.
    pub(crate) drain_timeout: Duration,
}

impl RunDriver {
    pub(crate) async fn drive(self, turns: TurnSource, options: RunOptions) {
        let resumed = options.resume.is_some();
        let cancel = options.cancel.clone();

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            started = self.engine.start_run(turns, options) => Some(started),
        };
        let outcome = match started {
            None => RunOutcome::Aborted,
            Some(Err(err)) => self.classify_failure(err, resumed, false),
            Some(Ok(run)) => {
                let _ = self
                    .events
                    .send(RunEvent::Started {
                        run_id: self.run_id,
                        control: Arc::clone(&run.control),
                    })
                    .await;
                self.forward_outputs(run, &cancel, resumed).await
            }
        };

        tracing::debug!(run_id = self.run_id, ?outcome, "agent run finished");
        let _ = self
            .events
            .send(RunEvent::Finished {
                run_id: self.run_id,
                outcome,
            })
            .await;
    }

    async fn forward_outputs(
        &self,
        mut run: EngineRun,
        cancel: &CancellationToken,
        resumed: bool,
    ) -> RunOutcome {
        let mut seen_output = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.drain_after_cancel(&mut run).await;
                    return RunOutcome::Aborted;
                }
                item = run.outputs.recv() => item,
            };

            match item {
                None => return RunOutcome::Completed,
                Some(Ok(output)) => {
                    seen_output = true;
                    if let Some(token) = output.session_id() {
                        let _ = self
                            .events
                            .send(RunEvent::SessionToken {
                                run_id: self.run_id,
                                token: token.to_owned(),
                            })
                            .await;
                    }
                    self.outbound.send(output.into_envelope()).await;
                }
                Some(Err(_)) if cancel.is_cancelled() => return RunOutcome::Aborted,
                Some(Err(err)) => return self.classify_failure(err, resumed, seen_output),
            }
        }
    }

    /// Wait for the engine to close its output stream so the idle status follows a
    /// fully stopped run. Late outputs are discarded.
    async fn drain_after_cancel(&self, run: &mut EngineRun) {
        let drained = timeout(self.drain_timeout, async {
            while run.outputs.recv().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                run_id = self.run_id,
                "engine did not stop within the drain timeout"
            );
        }
    }

    fn classify_failure(&self, err: EngineError, resumed: bool, seen_output: bool) -> RunOutcome {
        if resumed && !seen_output && err.is_resume_expiry() {
            tracing::info!(run_id = self.run_id, error = %err, "resumed session is no longer available");
            return RunOutcome::ResumeExpired {
                turn: self.first_turn.clone(),
            };
        }
        tracing::warn!(run_id = self.run_id, error = %err, "agent run failed");
        RunOutcome::Failed {
            message: err.to_string(),
        }
    }
}
