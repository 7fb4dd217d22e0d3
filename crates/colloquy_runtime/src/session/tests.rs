use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use colloquy_protocol::{PermissionBehavior, RunResult};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use super::*;
use crate::engine::{EngineFuture, EngineOutput, EngineRun};
use crate::errors::EngineError;
use crate::feeder::TurnSource;
use crate::permissions::PermissionDecision;

#[derive(Debug, Default)]
struct FakeEngineState {
    starts: Mutex<Vec<Option<String>>>,
    decisions: Mutex<Vec<PermissionDecision>>,
    mode_changes: Mutex<Vec<PermissionMode>>,
    interrupts: AtomicUsize,
    expire_resume: AtomicBool,
}

/// Scripted engine. Turn text selects behavior:
/// `fail` ends the run with an error, `tool:<Name>` asks permission once,
/// `tools:<n>` asks `n` permissions concurrently, anything else streams an echo.
#[derive(Clone, Debug, Default)]
struct FakeEngine {
    state: Arc<FakeEngineState>,
}

impl FakeEngine {
    fn starts(&self) -> Vec<Option<String>> {
        self.state.starts.lock().expect("starts lock").clone()
    }

    fn decisions(&self) -> Vec<PermissionDecision> {
        self.state.decisions.lock().expect("decisions lock").clone()
    }
}

struct FakeControl {
    state: Arc<FakeEngineState>,
}

impl RunControl for FakeControl {
    fn interrupt(&self) -> EngineFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.state.interrupts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn set_permission_mode(&self, mode: PermissionMode) -> EngineFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.state
                .mode_changes
                .lock()
                .expect("mode lock")
                .push(mode);
            Ok(())
        })
    }
}

impl AgentEngine for FakeEngine {
    fn start_run<'a>(
        &'a self,
        turns: TurnSource,
        options: RunOptions,
    ) -> EngineFuture<'a, Result<EngineRun, EngineError>> {
        Box::pin(async move {
            let run_index = {
                let mut starts = self.state.starts.lock().expect("starts lock");
                starts.push(options.resume.clone());
                starts.len()
            };
            let (tx, outputs) = mpsc::channel(64);
            let expired =
                options.resume.is_some() && self.state.expire_resume.load(Ordering::SeqCst);
            tokio::spawn(fake_run(
                Arc::clone(&self.state),
                turns,
                options,
                tx,
                format!("sess-{run_index}"),
                expired,
            ));
            Ok(EngineRun {
                outputs,
                control: Arc::new(FakeControl {
                    state: Arc::clone(&self.state),
                }),
            })
        })
    }
}

type OutputTx = mpsc::Sender<Result<EngineOutput, EngineError>>;

async fn fake_run(
    state: Arc<FakeEngineState>,
    mut turns: TurnSource,
    options: RunOptions,
    tx: OutputTx,
    session_id: String,
    expired: bool,
) {
    if expired {
        let _ = tx.send(Err(EngineError::Exited { code: Some(1) })).await;
        return;
    }

    let mut announced = false;
    while let Some(turn) = turns.next_turn().await {
        if !announced {
            announced = true;
            let _ = tx
                .send(Ok(EngineOutput::SessionInit {
                    session_id: session_id.clone(),
                    model: Some("fake-model".to_owned()),
                    tools: vec!["Bash".to_owned(), "Read".to_owned()],
                }))
                .await;
        }

        if turn == "fail" {
            let _ = tx.send(Err(EngineError::Other("engine crashed".to_owned()))).await;
            return;
        }

        let reply = if let Some(tool) = turn.strip_prefix("tool:") {
            let decision = options
                .permissions
                .check(tool, json!({"command": "rm -rf /"}))
                .await;
            state
                .decisions
                .lock()
                .expect("decisions lock")
                .push(decision.clone());
            match decision {
                PermissionDecision::Allow { .. } => format!("{tool} allowed"),
                PermissionDecision::Deny { message } => format!("{tool} denied: {message}"),
            }
        } else if let Some(count) = turn.strip_prefix("tools:") {
            let count: usize = count.parse().expect("tool count");
            let mut checks = Vec::new();
            for index in 0..count {
                let gate = options.permissions.clone();
                checks.push(tokio::spawn(async move {
                    gate.check("Bash", json!({"command": format!("step {index}")}))
                        .await
                }));
            }
            for check in checks {
                let decision = check.await.expect("check join");
                state
                    .decisions
                    .lock()
                    .expect("decisions lock")
                    .push(decision);
            }
            "tools done".to_owned()
        } else {
            stream_text(&tx, &format!("echo: {turn}")).await;
            format!("echo: {turn}")
        };

        let _ = tx
            .send(Ok(EngineOutput::Assistant {
                message: json!({"role": "assistant", "content": [{"type": "text", "text": reply}]}),
                parent_tool_use_id: None,
            }))
            .await;
        let _ = tx
            .send(Ok(EngineOutput::Result(RunResult {
                session_id: Some(session_id.clone()),
                subtype: "success".to_owned(),
                result: Some(reply),
                num_turns: Some(1),
                ..RunResult::default()
            })))
            .await;
    }
}

async fn stream_text(tx: &OutputTx, text: &str) {
    let (head, tail) = text.split_at(text.len() / 2);
    let events = [
        json!({"type": "message_start", "message": {"role": "assistant"}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": head}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": tail}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_stop"}),
    ];
    for event in events {
        let _ = tx
            .send(Ok(EngineOutput::StreamEvent {
                event,
                parent_tool_use_id: None,
            }))
            .await;
    }
}

struct Harness {
    engine: FakeEngine,
    inbound: Option<mpsc::Sender<ClientEnvelope>>,
    outbound: mpsc::Receiver<ServerEnvelope>,
    task: JoinHandle<()>,
}

impl Harness {
    async fn start(mode: PermissionMode) -> Self {
        let engine = FakeEngine::default();
        let config = SessionConfig::new("/tmp/colloquy-workspace")
            .with_permission_mode(mode)
            .with_shutdown_grace(Duration::from_secs(1));
        let (outbound_tx, outbound) = mpsc::channel(128);
        let session = Session::new(Arc::new(engine.clone()), config, Outbound::new(outbound_tx))
            .expect("session config");
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let task = tokio::spawn(session.run(inbound_rx));

        let mut harness = Self {
            engine,
            inbound: Some(inbound_tx),
            outbound,
            task,
        };
        assert_eq!(harness.next().await, ServerEnvelope::status(SessionStatus::Idle));
        assert_eq!(harness.next().await, ServerEnvelope::PermissionMode { mode });
        harness
    }

    async fn send(&self, envelope: ClientEnvelope) {
        self.inbound
            .as_ref()
            .expect("inbound open")
            .send(envelope)
            .await
            .expect("session alive");
    }

    async fn say(&self, text: &str) {
        self.send(ClientEnvelope::UserMessage {
            text: text.to_owned(),
        })
        .await;
    }

    async fn next(&mut self) -> ServerEnvelope {
        timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("envelope timeout")
            .expect("outbound closed")
    }

    /// Skip envelopes until one matches.
    async fn until(&mut self, matches: impl Fn(&ServerEnvelope) -> bool) -> ServerEnvelope {
        loop {
            let envelope = self.next().await;
            if matches(&envelope) {
                return envelope;
            }
        }
    }

    async fn next_result(&mut self) -> RunResult {
        match self.until(|e| matches!(e, ServerEnvelope::Result(_))).await {
            ServerEnvelope::Result(result) => result,
            _ => unreachable!(),
        }
    }

    async fn permission_request_id(&mut self) -> String {
        match self
            .until(|e| matches!(e, ServerEnvelope::PermissionRequest { .. }))
            .await
        {
            ServerEnvelope::PermissionRequest { request_id, .. } => request_id,
            _ => unreachable!(),
        }
    }

    async fn assert_quiet(&mut self) {
        let extra = timeout(Duration::from_millis(100), self.outbound.recv()).await;
        assert!(extra.is_err(), "unexpected envelope: {extra:?}");
    }
}

fn text_of(message: &Value) -> &str {
    message["content"][0]["text"].as_str().unwrap_or_default()
}

#[tokio::test(flavor = "current_thread")]
async fn list_files_turn_streams_in_order_and_ends_with_result() {
    let mut harness = Harness::start(PermissionMode::AlwaysAllow).await;
    harness.say("list files").await;

    assert_eq!(harness.next().await, ServerEnvelope::status(SessionStatus::Thinking));
    assert_eq!(
        harness.next().await,
        ServerEnvelope::SessionInit {
            session_id: "sess-1".to_owned(),
            model: Some("fake-model".to_owned()),
            tools: vec!["Bash".to_owned(), "Read".to_owned()],
        }
    );
    let mut kinds = Vec::new();
    for _ in 0..6 {
        match harness.next().await {
            ServerEnvelope::StreamEvent { event, .. } => {
                kinds.push(event["type"].as_str().unwrap_or_default().to_owned());
            }
            other => panic!("expected stream event, got {other:?}"),
        }
    }
    assert_eq!(
        kinds,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_stop"
        ]
    );
    match harness.next().await {
        ServerEnvelope::AssistantMessage { message, .. } => {
            assert_eq!(text_of(&message), "echo: list files");
        }
        other => panic!("expected assistant message, got {other:?}"),
    }
    let result = harness.next_result().await;
    assert_eq!(result.result.as_deref(), Some("echo: list files"));
    assert_eq!(result.session_id.as_deref(), Some("sess-1"));
}

#[tokio::test(flavor = "current_thread")]
async fn follow_up_turn_is_absorbed_by_the_active_run() {
    let mut harness = Harness::start(PermissionMode::AlwaysAllow).await;
    harness.say("first").await;
    harness.next_result().await;

    harness.say("second").await;
    assert_eq!(harness.next().await, ServerEnvelope::status(SessionStatus::Thinking));
    assert_eq!(
        harness.next_result().await.result.as_deref(),
        Some("echo: second")
    );
    assert_eq!(harness.engine.starts(), vec![None]);
}

#[tokio::test(flavor = "current_thread")]
async fn confirm_all_denial_reaches_engine_and_run_continues() {
    let mut harness = Harness::start(PermissionMode::ConfirmAll).await;
    harness.say("tool:Bash").await;

    let request = harness
        .until(|e| matches!(e, ServerEnvelope::PermissionRequest { .. }))
        .await;
    let request_id = match request {
        ServerEnvelope::PermissionRequest {
            request_id,
            tool_name,
            input,
        } => {
            assert_eq!(tool_name, "Bash");
            assert_eq!(input, json!({"command": "rm -rf /"}));
            request_id
        }
        _ => unreachable!(),
    };
    harness
        .send(ClientEnvelope::PermissionResponse {
            request_id,
            behavior: PermissionBehavior::Deny,
            message: None,
        })
        .await;

    assert_eq!(
        harness.next_result().await.result.as_deref(),
        Some("Bash denied: Denied by user")
    );
    assert_eq!(
        harness.engine.decisions(),
        vec![PermissionDecision::Deny {
            message: "Denied by user".to_owned()
        }]
    );

    harness.say("still here").await;
    assert_eq!(
        harness.next_result().await.result.as_deref(),
        Some("echo: still here")
    );
}

#[tokio::test(flavor = "current_thread")]
async fn interrupt_resolves_every_pending_request_as_aborted() {
    let mut harness = Harness::start(PermissionMode::ConfirmAll).await;
    harness.say("tools:3").await;

    let mut request_ids = Vec::new();
    for _ in 0..3 {
        request_ids.push(harness.permission_request_id().await);
    }
    harness.send(ClientEnvelope::Interrupt).await;

    harness
        .until(|e| *e == ServerEnvelope::status(SessionStatus::Idle))
        .await;
    assert_eq!(harness.engine.decisions(), vec![PermissionDecision::aborted(); 3]);

    // Late decisions for aborted requests are ignored.
    for request_id in request_ids {
        harness
            .send(ClientEnvelope::PermissionResponse {
                request_id,
                behavior: PermissionBehavior::Allow,
                message: None,
            })
            .await;
    }
    harness.send(ClientEnvelope::Interrupt).await;
    harness.assert_quiet().await;
    assert_eq!(harness.engine.decisions().len(), 3);

    // The session stays usable and resumes the same conversation.
    harness.say("after").await;
    harness.next_result().await;
    assert_eq!(
        harness.engine.starts(),
        vec![None, Some("sess-1".to_owned())]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn interrupt_without_active_run_is_a_noop() {
    let mut harness = Harness::start(PermissionMode::AlwaysAllow).await;
    harness.send(ClientEnvelope::Interrupt).await;
    harness.assert_quiet().await;
}

#[tokio::test(flavor = "current_thread")]
async fn expired_resume_is_retried_once_as_fresh_run() {
    let mut harness = Harness::start(PermissionMode::AlwaysAllow).await;
    harness.engine.state.expire_resume.store(true, Ordering::SeqCst);

    harness
        .send(ClientEnvelope::ResumeSession {
            session_id: "sess-old".to_owned(),
        })
        .await;
    assert_eq!(harness.next().await, ServerEnvelope::status(SessionStatus::Idle));

    harness.say("hello again").await;
    assert_eq!(harness.next().await, ServerEnvelope::status(SessionStatus::Thinking));
    assert_eq!(harness.next().await, ServerEnvelope::error(SESSION_EXPIRED_MESSAGE));
    assert!(matches!(
        harness.next().await,
        ServerEnvelope::SessionInit { ref session_id, .. } if session_id == "sess-2"
    ));
    assert_eq!(
        harness.next_result().await.result.as_deref(),
        Some("echo: hello again")
    );
    assert_eq!(
        harness.engine.starts(),
        vec![Some("sess-old".to_owned()), None]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn engine_failure_is_reported_and_session_stays_resumable() {
    let mut harness = Harness::start(PermissionMode::AlwaysAllow).await;
    harness.say("fail").await;

    assert_eq!(
        harness
            .until(|e| matches!(e, ServerEnvelope::Error { .. }))
            .await,
        ServerEnvelope::error("engine error: engine crashed")
    );
    assert_eq!(harness.next().await, ServerEnvelope::status(SessionStatus::Idle));

    harness.say("retry").await;
    harness.next_result().await;
    assert_eq!(
        harness.engine.starts(),
        vec![None, Some("sess-1".to_owned())]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn turn_queued_behind_an_ending_run_starts_the_next_run() {
    let mut harness = Harness::start(PermissionMode::AlwaysAllow).await;
    harness.say("fail").await;
    harness.say("after").await;

    assert_eq!(
        harness
            .until(|e| matches!(e, ServerEnvelope::Error { .. }))
            .await,
        ServerEnvelope::error("engine error: engine crashed")
    );
    assert_eq!(
        harness.next_result().await.result.as_deref(),
        Some("echo: after")
    );
    assert_eq!(
        harness.engine.starts(),
        vec![None, Some("sess-1".to_owned())]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn invalid_permission_mode_is_ignored() {
    let mut harness = Harness::start(PermissionMode::AlwaysAllow).await;
    harness
        .send(ClientEnvelope::SetPermissionMode {
            mode: "yolo".to_owned(),
        })
        .await;
    harness.assert_quiet().await;

    harness
        .send(ClientEnvelope::set_permission_mode(PermissionMode::ConfirmAll))
        .await;
    assert_eq!(
        harness.next().await,
        ServerEnvelope::PermissionMode {
            mode: PermissionMode::ConfirmAll
        }
    );

    harness.say("tool:Bash").await;
    harness.permission_request_id().await;
}

#[tokio::test(flavor = "current_thread")]
async fn mode_change_mid_run_notifies_engine() {
    let mut harness = Harness::start(PermissionMode::ConfirmAll).await;
    harness.say("warm up").await;
    harness.next_result().await;

    harness
        .send(ClientEnvelope::set_permission_mode(PermissionMode::AllowSafe))
        .await;
    harness
        .until(|e| matches!(e, ServerEnvelope::PermissionMode { .. }))
        .await;

    timeout(Duration::from_secs(2), async {
        while harness
            .engine
            .state
            .mode_changes
            .lock()
            .expect("mode lock")
            .is_empty()
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("engine notified");
    assert_eq!(
        *harness.engine.state.mode_changes.lock().expect("mode lock"),
        vec![PermissionMode::AllowSafe]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn new_session_forgets_token() {
    let mut harness = Harness::start(PermissionMode::AlwaysAllow).await;
    harness.say("one").await;
    harness.next_result().await;

    harness.send(ClientEnvelope::NewSession).await;
    assert_eq!(
        harness
            .until(|e| matches!(e, ServerEnvelope::Status { .. }))
            .await,
        ServerEnvelope::status(SessionStatus::Idle)
    );

    harness.say("two").await;
    assert!(matches!(
        harness
            .until(|e| matches!(e, ServerEnvelope::SessionInit { .. }))
            .await,
        ServerEnvelope::SessionInit { ref session_id, .. } if session_id == "sess-2"
    ));
    assert_eq!(harness.engine.starts(), vec![None, None]);
}

#[tokio::test(flavor = "current_thread")]
async fn closing_inbound_cancels_run_and_ends_session() {
    let mut harness = Harness::start(PermissionMode::ConfirmAll).await;
    harness.say("tool:Bash").await;
    harness.permission_request_id().await;

    drop(harness.inbound.take());
    timeout(Duration::from_secs(3), &mut harness.task)
        .await
        .expect("session must stop")
        .expect("session join");

    timeout(Duration::from_secs(2), async {
        while harness.engine.decisions().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pending permission resolved");
    assert_eq!(harness.engine.decisions(), vec![PermissionDecision::aborted()]);
}
