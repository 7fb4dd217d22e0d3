use std::path::{Path, PathBuf};
use std::sync::Mutex;

use colloquy_protocol::{
    ClientEnvelope, PermissionBehavior, PermissionMode, RunResult, ServerEnvelope, SessionStatus,
};
use colloquy_runtime::{
    EngineError, EngineFuture, EngineOutput, EngineRun, PermissionDecision, RunControl,
    RunOptions, TranscriptRecord, TurnSource,
};
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::*;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TempDir {
    root: PathBuf,
}

impl TempDir {
    fn new() -> Self {
        let root = std::env::temp_dir().join(format!("colloquy_web_test_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create temp root");
        Self { root }
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Engine double: echoes every turn, or asks for `Bash` when the turn starts with `tool:`.
/// A resumed run keeps the resumed session id.
#[derive(Clone, Default)]
struct FakeEngine {
    starts: Arc<Mutex<Vec<Option<String>>>>,
}

impl FakeEngine {
    fn starts(&self) -> Vec<Option<String>> {
        self.starts.lock().expect("fake engine starts lock").clone()
    }
}

struct NoopControl;

impl RunControl for NoopControl {
    fn interrupt(&self) -> EngineFuture<'_, Result<(), EngineError>> {
        Box::pin(async { Ok(()) })
    }

    fn set_permission_mode(&self, _mode: PermissionMode) -> EngineFuture<'_, Result<(), EngineError>> {
        Box::pin(async { Ok(()) })
    }
}

impl AgentEngine for FakeEngine {
    fn start_run<'a>(
        &'a self,
        turns: TurnSource,
        options: RunOptions,
    ) -> EngineFuture<'a, Result<EngineRun, EngineError>> {
        Box::pin(async move {
            let session_id = {
                let mut starts = self.starts.lock().expect("fake engine starts lock");
                starts.push(options.resume.clone());
                options
                    .resume
                    .clone()
                    .unwrap_or_else(|| format!("sess-{}", starts.len()))
            };
            let (tx, outputs) = mpsc::channel(64);
            tokio::spawn(fake_run(turns, options, tx, session_id));
            Ok(EngineRun {
                outputs,
                control: Arc::new(NoopControl),
            })
        })
    }
}

async fn fake_run(
    mut turns: TurnSource,
    options: RunOptions,
    tx: mpsc::Sender<Result<EngineOutput, EngineError>>,
    session_id: String,
) {
    let mut announced = false;
    while let Some(turn) = turns.next_turn().await {
        if !announced {
            announced = true;
            let _ = tx
                .send(Ok(EngineOutput::SessionInit {
                    session_id: session_id.clone(),
                    model: Some("fake-model".to_owned()),
                    tools: vec!["Bash".to_owned()],
                }))
                .await;
        }

        let reply = match turn.strip_prefix("tool:") {
            Some(command) => match options
                .permissions
                .check("Bash", json!({ "command": command }))
                .await
            {
                PermissionDecision::Allow { .. } => format!("ran {command}"),
                PermissionDecision::Deny { message } => format!("refused: {message}"),
            },
            None => {
                let events = [
                    json!({"type": "message_start", "message": {"role": "assistant"}}),
                    json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
                    json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": turn.clone()}}),
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
                turn.clone()
            }
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
                ..RunResult::default()
            })))
            .await;
    }
}

struct TestServer {
    server: ConversationServer,
    engine: FakeEngine,
    url: String,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_server(session_config: SessionConfig, config: WebConfig) -> TestServer {
    let engine = FakeEngine::default();
    let server = ConversationServer::new(Arc::new(engine.clone()), session_config, config)
        .await
        .expect("create server");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let router = server.router();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    TestServer {
        server,
        engine,
        url: format!("ws://{addr}{CONVERSATION_PATH}"),
        task,
    }
}

async fn connect(url: &str) -> Socket {
    let (socket, _) = timeout(Duration::from_secs(2), tokio_tungstenite::connect_async(url))
        .await
        .expect("connect timeout")
        .expect("connect");
    socket
}

async fn send(socket: &mut Socket, envelope: &ClientEnvelope) {
    let text = serde_json::to_string(envelope).expect("serialize client envelope");
    socket.send(Message::text(text)).await.expect("send envelope");
}

async fn next_envelope(socket: &mut Socket) -> ServerEnvelope {
    loop {
        let message = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("envelope timeout")
            .expect("socket ended")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("parse server envelope");
        }
    }
}

async fn until_result(socket: &mut Socket) -> (Vec<&'static str>, RunResult) {
    let mut kinds = Vec::new();
    loop {
        let envelope = next_envelope(socket).await;
        kinds.push(envelope.kind());
        if let ServerEnvelope::Result(result) = envelope {
            return (kinds, result);
        }
    }
}

async fn expect_greeting(socket: &mut Socket, mode: PermissionMode) {
    assert_eq!(
        next_envelope(socket).await,
        ServerEnvelope::status(SessionStatus::Idle)
    );
    assert_eq!(
        next_envelope(socket).await,
        ServerEnvelope::PermissionMode { mode }
    );
}

/// Drain the socket until the server closes it.
async fn expect_closed(socket: &mut Socket) {
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket must be closed by the server");
}

async fn wait_for_connections(server: &ConversationServer, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.live_connections().await != expected {
        assert!(Instant::now() < deadline, "expected {expected} live connections");
        sleep(Duration::from_millis(10)).await;
    }
}

fn user_message(text: &str) -> ClientEnvelope {
    ClientEnvelope::UserMessage {
        text: text.to_owned(),
    }
}

#[test]
fn web_config_rejects_zero_capacities_and_timeout() {
    let mut config = WebConfig::default();
    config.inbound_channel_capacity = 0;
    assert_eq!(
        config.validate(),
        Err(WebError::InvalidConfig(
            "inbound_channel_capacity must be > 0".to_owned()
        ))
    );

    let mut config = WebConfig::default();
    config.outbound_channel_capacity = 0;
    assert!(matches!(config.validate(), Err(WebError::InvalidConfig(_))));

    let config = WebConfig::default().with_stale_teardown_timeout(Duration::ZERO);
    assert!(matches!(config.validate(), Err(WebError::InvalidConfig(_))));

    assert!(WebConfig::default().validate().is_ok());
}

#[tokio::test(flavor = "current_thread")]
async fn server_new_rejects_invalid_session_config() {
    let err = match ConversationServer::new(
        Arc::new(FakeEngine::default()),
        SessionConfig::new(""),
        WebConfig::default(),
    )
    .await
    {
        Ok(_) => panic!("empty workspace must be rejected"),
        Err(err) => err,
    };
    assert!(matches!(err, WebError::Runtime(RuntimeError::InvalidConfig(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_is_greeted_and_streams_a_turn() {
    let harness = spawn_server(SessionConfig::default(), WebConfig::default()).await;
    let mut socket = connect(&harness.url).await;
    expect_greeting(&mut socket, PermissionMode::AlwaysAllow).await;

    send(&mut socket, &user_message("list files")).await;
    assert_eq!(
        next_envelope(&mut socket).await,
        ServerEnvelope::status(SessionStatus::Thinking)
    );
    let (kinds, result) = until_result(&mut socket).await;
    assert_eq!(
        kinds,
        vec![
            "session_init",
            "stream_event",
            "stream_event",
            "stream_event",
            "stream_event",
            "stream_event",
            "assistant_message",
            "result",
        ]
    );
    assert_eq!(result.result.as_deref(), Some("list files"));
    assert_eq!(result.session_id.as_deref(), Some("sess-1"));

    assert!(harness.server.token_holder("sess-1").await.is_some());
    assert_eq!(harness.server.live_connections().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frames_are_ignored() {
    let harness = spawn_server(SessionConfig::default(), WebConfig::default()).await;
    let mut socket = connect(&harness.url).await;
    expect_greeting(&mut socket, PermissionMode::AlwaysAllow).await;

    socket
        .send(Message::text("{not json"))
        .await
        .expect("send garbage");
    socket
        .send(Message::text(r#"{"type":"no_such_kind"}"#))
        .await
        .expect("send unknown kind");
    send(&mut socket, &user_message("still here")).await;

    assert_eq!(
        next_envelope(&mut socket).await,
        ServerEnvelope::status(SessionStatus::Thinking)
    );
    let (_, result) = until_result(&mut socket).await;
    assert_eq!(result.result.as_deref(), Some("still here"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn confirm_all_permission_round_trip_over_the_socket() {
    let session_config = SessionConfig::default().with_permission_mode(PermissionMode::ConfirmAll);
    let harness = spawn_server(session_config, WebConfig::default()).await;
    let mut socket = connect(&harness.url).await;
    expect_greeting(&mut socket, PermissionMode::ConfirmAll).await;

    send(&mut socket, &user_message("tool:ls")).await;
    let request_id = loop {
        if let ServerEnvelope::PermissionRequest {
            request_id,
            tool_name,
            input,
        } = next_envelope(&mut socket).await
        {
            assert_eq!(tool_name, "Bash");
            assert_eq!(input, json!({"command": "ls"}));
            break request_id;
        }
    };

    send(
        &mut socket,
        &ClientEnvelope::PermissionResponse {
            request_id,
            behavior: PermissionBehavior::Deny,
            message: Some("not now".to_owned()),
        },
    )
    .await;
    let (_, result) = until_result(&mut socket).await;
    assert_eq!(result.result.as_deref(), Some("refused: not now"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resuming_a_held_token_tears_down_the_stale_connection() {
    let harness = spawn_server(SessionConfig::default(), WebConfig::default()).await;

    let mut stale = connect(&harness.url).await;
    expect_greeting(&mut stale, PermissionMode::AlwaysAllow).await;
    send(&mut stale, &user_message("first")).await;
    let (_, result) = until_result(&mut stale).await;
    let token = result.session_id.expect("session token");
    let stale_holder = harness.server.token_holder(&token).await.expect("stale holder");

    let mut fresh = connect(&harness.url).await;
    expect_greeting(&mut fresh, PermissionMode::AlwaysAllow).await;
    send(
        &mut fresh,
        &ClientEnvelope::ResumeSession {
            session_id: token.clone(),
        },
    )
    .await;
    assert_eq!(
        next_envelope(&mut fresh).await,
        ServerEnvelope::status(SessionStatus::Idle)
    );
    expect_closed(&mut stale).await;
    wait_for_connections(&harness.server, 1).await;

    let fresh_holder = harness.server.token_holder(&token).await.expect("fresh holder");
    assert_ne!(fresh_holder, stale_holder);

    send(&mut fresh, &user_message("second")).await;
    let (_, result) = until_result(&mut fresh).await;
    assert_eq!(result.session_id.as_deref(), Some(token.as_str()));
    assert_eq!(harness.engine.starts(), vec![None, Some(token)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_the_socket_unregisters_the_connection() {
    let harness = spawn_server(SessionConfig::default(), WebConfig::default()).await;
    let mut socket = connect(&harness.url).await;
    expect_greeting(&mut socket, PermissionMode::AlwaysAllow).await;
    send(&mut socket, &user_message("hello")).await;
    until_result(&mut socket).await;

    socket.close(None).await.expect("close socket");
    wait_for_connections(&harness.server, 0).await;
    assert!(harness.server.token_holder("sess-1").await.is_none());
}

fn transcript_records(path: &Path) -> Vec<TranscriptRecord> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).expect("transcript line"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transcript_records_outbound_envelopes() {
    let temp = TempDir::new();
    let path = temp.root.join("transcript.jsonl");
    let harness = spawn_server(
        SessionConfig::default(),
        WebConfig::default().with_transcript_path(&path),
    )
    .await;
    let mut tokens = Vec::new();
    for text in ["hello", "again"] {
        let mut socket = connect(&harness.url).await;
        expect_greeting(&mut socket, PermissionMode::AlwaysAllow).await;
        send(&mut socket, &user_message(text)).await;
        let (_, result) = until_result(&mut socket).await;
        tokens.push(result.session_id.expect("session token"));
    }
    assert_eq!(tokens, ["sess-1", "sess-2"]);

    let deadline = Instant::now() + Duration::from_secs(2);
    let records = loop {
        let records = transcript_records(&path);
        let results = records
            .iter()
            .filter(|record| record.envelope.kind() == "result")
            .count();
        if results == 2 {
            break records;
        }
        assert!(Instant::now() < deadline, "transcript must contain both results");
        sleep(Duration::from_millis(10)).await;
    };

    let seqs: Vec<u64> = records.iter().map(|record| record.seq).collect();
    let expected: Vec<u64> = (1..=records.len() as u64).collect();
    assert_eq!(seqs, expected);

    let mut connections: Vec<&str> = Vec::new();
    for record in &records {
        if !connections.contains(&record.connection_id.as_str()) {
            connections.push(&record.connection_id);
        }
    }
    assert_eq!(connections.len(), 2, "each connection is tagged separately");

    for (connection_id, token) in connections.iter().zip(&tokens) {
        let lines: Vec<&TranscriptRecord> = records
            .iter()
            .filter(|record| record.connection_id == *connection_id)
            .collect();
        let kinds: Vec<&str> = lines.iter().map(|record| record.envelope.kind()).collect();
        assert_eq!(kinds[..3], ["status", "permission_mode", "status"]);
        assert_eq!(lines[0].session_token, None);

        let init = lines
            .iter()
            .position(|record| record.envelope.kind() == "session_init")
            .expect("session_init recorded");
        assert!(lines[init..]
            .iter()
            .all(|record| record.session_token.as_deref() == Some(token.as_str())));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outbound_keeps_flowing_while_a_takeover_waits() {
    let harness = spawn_server(
        SessionConfig::default(),
        WebConfig::default().with_stale_teardown_timeout(Duration::from_secs(30)),
    )
    .await;
    let stuck_teardown = CancellationToken::new();
    let stuck_finished = CancellationToken::new();
    state::register_connection(
        &harness.server.state,
        "conn_stuck",
        stuck_teardown.clone(),
        stuck_finished.clone(),
    )
    .await;
    state::claim_session_token(&harness.server.state, "conn_stuck", "sess-stuck").await;

    let mut socket = connect(&harness.url).await;
    expect_greeting(&mut socket, PermissionMode::AlwaysAllow).await;
    send(&mut socket, &user_message("hello")).await;
    send(
        &mut socket,
        &ClientEnvelope::ResumeSession {
            session_id: "sess-stuck".to_owned(),
        },
    )
    .await;

    let (_, result) = until_result(&mut socket).await;
    assert_eq!(result.result.as_deref(), Some("hello"));
    timeout(Duration::from_secs(2), stuck_teardown.cancelled())
        .await
        .expect("stale holder is told to close");

    stuck_finished.cancel();
    assert_eq!(
        next_envelope(&mut socket).await,
        ServerEnvelope::status(SessionStatus::Idle)
    );
}
