use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use colloquy_protocol::PermissionMode;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{AgentEngine, EngineFuture, EngineOutput, EngineRun, RunControl, RunOptions};
use crate::errors::{EngineError, RuntimeError};
use crate::feeder::TurnSource;
use crate::permissions::PermissionGate;
use crate::transport::{ChildSpec, ChildTransport, ChildTransportConfig};

pub const DEFAULT_ENGINE_PROGRAM: &str = "claude";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessEngineConfig {
    pub program: PathBuf,
    /// Appended after the protocol arguments.
    pub extra_args: Vec<String>,
    pub env: HashMap<String, String>,
    pub transport: ChildTransportConfig,
    pub output_channel_capacity: usize,
    pub control_timeout: Duration,
    pub flush_timeout: Duration,
    pub terminate_grace: Duration,
}

impl Default for ProcessEngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_ENGINE_PROGRAM),
            extra_args: Vec::new(),
            env: HashMap::new(),
            transport: ChildTransportConfig::default(),
            output_channel_capacity: 256,
            control_timeout: Duration::from_secs(10),
            flush_timeout: Duration::from_millis(500),
            terminate_grace: Duration::from_secs(2),
        }
    }
}

impl ProcessEngineConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_control_timeout(mut self, control_timeout: Duration) -> Self {
        self.control_timeout = control_timeout;
        self
    }

    pub fn with_terminate_grace(mut self, terminate_grace: Duration) -> Self {
        self.terminate_grace = terminate_grace;
        self
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.program.as_os_str().is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "program must not be empty".to_owned(),
            ));
        }
        if self.output_channel_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "output_channel_capacity must be > 0".to_owned(),
            ));
        }
        if self.control_timeout.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "control_timeout must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Mode passed to the CLI. Every session mode keeps the CLI in its prompting mode so
/// each tool call reaches the arbitrator, which owns the allow-list.
fn cli_permission_mode(mode: PermissionMode) -> &'static str {
    match mode {
        PermissionMode::AlwaysAllow | PermissionMode::AllowSafe | PermissionMode::ConfirmAll => {
            "default"
        }
    }
}

/// Agent engine backed by a CLI child process speaking stream-json over stdio.
#[derive(Clone, Debug)]
pub struct ProcessEngine {
    config: ProcessEngineConfig,
}

impl ProcessEngine {
    pub fn new(config: ProcessEngineConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProcessEngineConfig {
        &self.config
    }

    fn child_spec(&self, options: &RunOptions) -> ChildSpec {
        let mut spec = ChildSpec::new(&self.config.program)
            .cwd(&options.workspace_root)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages")
            .arg("--permission-prompt-tool")
            .arg("stdio")
            .arg("--permission-mode")
            .arg(cli_permission_mode(options.permission_mode));
        if let Some(session_id) = &options.resume {
            spec = spec.arg("--resume").arg(session_id);
        }
        spec.args.extend(self.config.extra_args.iter().cloned());
        spec.env = self.config.env.clone();
        spec
    }
}

impl AgentEngine for ProcessEngine {
    fn start_run<'a>(
        &'a self,
        turns: TurnSource,
        options: RunOptions,
    ) -> EngineFuture<'a, Result<EngineRun, EngineError>> {
        Box::pin(async move {
            let spec = self.child_spec(&options);
            let mut transport = ChildTransport::spawn(spec, self.config.transport)
                .map_err(|err| EngineError::Spawn(err.to_string()))?;
            let reader = transport.take_reader()?;
            let control = Arc::new(ProcessControl::new(
                transport.take_writer()?,
                self.config.control_timeout,
            ));

            let (out_tx, out_rx) = mpsc::channel(self.config.output_channel_capacity);
            let scope = options.cancel.child_token();
            let session_id = options.resume.clone().unwrap_or_default();

            tokio::spawn(pump_turns(turns, Arc::clone(&control), session_id));
            tokio::spawn(
                Supervisor {
                    transport,
                    reader,
                    control: Arc::clone(&control),
                    gate: options.permissions.rescoped(scope.clone()),
                    out_tx,
                    cancel: options.cancel,
                    scope,
                    flush_timeout: self.config.flush_timeout,
                    terminate_grace: self.config.terminate_grace,
                }
                .run(),
            );

            Ok(EngineRun {
                outputs: out_rx,
                control,
            })
        })
    }
}

/// Write each human turn as a stream-json user message; stdin closes when turns end.
async fn pump_turns(mut turns: TurnSource, control: Arc<ProcessControl>, session_id: String) {
    while let Some(turn) = turns.next_turn().await {
        let frame = json!({
            "type": "user",
            "message": {"role": "user", "content": turn},
            "parent_tool_use_id": null,
            "session_id": session_id,
        });
        if let Err(err) = control.write(frame).await {
            tracing::debug!(error = %err, "engine stdin closed while feeding turn");
            return;
        }
    }
    control.close_writer();
}

type ControlResult = Result<Value, EngineError>;

/// Outbound control requests and the single stdin write path shared by a run.
struct ProcessControl {
    writer: Mutex<Option<mpsc::Sender<Value>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ControlResult>>>,
    next_request_id: AtomicU64,
    control_timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ProcessControl {
    fn new(writer: mpsc::Sender<Value>, control_timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            control_timeout,
        }
    }

    async fn write(&self, frame: Value) -> Result<(), EngineError> {
        let writer = lock(&self.writer)
            .clone()
            .ok_or(EngineError::TransportClosed)?;
        writer
            .send(frame)
            .await
            .map_err(|_| EngineError::TransportClosed)
    }

    fn close_writer(&self) {
        lock(&self.writer).take();
    }

    /// Send one control request and wait for the matching `control_response`.
    async fn request(&self, request: Value) -> ControlResult {
        let request_id = format!(
            "req_{}",
            self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
        );
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), tx);

        let frame = json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        });
        if let Err(err) = self.write(frame).await {
            lock(&self.pending).remove(&request_id);
            return Err(err);
        }

        match timeout(self.control_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::TransportClosed),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                Err(EngineError::ControlTimeout)
            }
        }
    }

    /// Route a `control_response` from the engine to its waiter.
    fn complete(&self, response: &Value) {
        let Some(request_id) = response.get("request_id").and_then(Value::as_str) else {
            tracing::debug!("control_response without request_id");
            return;
        };
        let Some(waiter) = lock(&self.pending).remove(request_id) else {
            tracing::debug!(request_id, "control_response for unknown request");
            return;
        };

        let result = match response.get("subtype").and_then(Value::as_str) {
            Some("success") => Ok(response.get("response").cloned().unwrap_or(Value::Null)),
            _ => Err(EngineError::ControlRejected(
                response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown control error")
                    .to_owned(),
            )),
        };
        let _ = waiter.send(result);
    }

    /// Drop every waiter; they observe `TransportClosed`.
    fn fail_pending(&self) {
        lock(&self.pending).clear();
    }
}

impl RunControl for ProcessControl {
    fn interrupt(&self) -> EngineFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.request(json!({"subtype": "interrupt"})).await?;
            Ok(())
        })
    }

    fn set_permission_mode(&self, mode: PermissionMode) -> EngineFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            self.request(json!({
                "subtype": "set_permission_mode",
                "mode": cli_permission_mode(mode),
            }))
            .await?;
            Ok(())
        })
    }
}

struct Supervisor {
    transport: ChildTransport,
    reader: mpsc::Receiver<Value>,
    control: Arc<ProcessControl>,
    gate: PermissionGate,
    out_tx: mpsc::Sender<Result<EngineOutput, EngineError>>,
    cancel: CancellationToken,
    /// Child of `cancel`; also cancelled when the process ends so in-flight
    /// permission checks resolve.
    scope: CancellationToken,
    flush_timeout: Duration,
    terminate_grace: Duration,
}

impl Supervisor {
    async fn run(mut self) {
        let mut checks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.reader.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if !self.dispatch(message, &mut checks).await {
                        break;
                    }
                }
            }
        }

        self.scope.cancel();
        let drained = timeout(self.flush_timeout, async {
            while checks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            checks.shutdown().await;
        }
        self.control.close_writer();
        drop(self.reader);

        let cancelled = self.cancel.is_cancelled();
        match self
            .transport
            .shutdown(self.flush_timeout, self.terminate_grace)
            .await
        {
            Ok(exit) if exit.status.success() || cancelled => {
                tracing::debug!(code = exit.code(), cancelled, "engine run ended");
            }
            Ok(exit) => {
                tracing::warn!(
                    code = exit.code(),
                    stderr = %exit.stderr_tail.join("\n"),
                    "engine process exited unsuccessfully"
                );
                let _ = self
                    .out_tx
                    .send(Err(EngineError::Exited { code: exit.code() }))
                    .await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "engine shutdown failed");
                if !cancelled {
                    let _ = self.out_tx.send(Err(EngineError::Other(err.to_string()))).await;
                }
            }
        }
        self.control.fail_pending();
    }

    /// Returns false once the output receiver is gone.
    async fn dispatch(&self, message: Value, checks: &mut JoinSet<()>) -> bool {
        match message.get("type").and_then(Value::as_str) {
            Some("control_request") => {
                self.on_control_request(message, checks);
                true
            }
            Some("control_response") => {
                if let Some(response) = message.get("response") {
                    self.control.complete(response);
                }
                true
            }
            Some("control_cancel_request") => {
                tracing::debug!("ignoring control_cancel_request");
                true
            }
            _ => self
                .out_tx
                .send(Ok(EngineOutput::from_json(message)))
                .await
                .is_ok(),
        }
    }

    fn on_control_request(&self, message: Value, checks: &mut JoinSet<()>) {
        let request_id = message
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let request = message.get("request").cloned().unwrap_or(Value::Null);
        let subtype = request
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let control = Arc::clone(&self.control);

        if subtype != "can_use_tool" {
            tracing::debug!(subtype, "rejecting unsupported control request");
            let frame = json!({
                "type": "control_response",
                "response": {
                    "subtype": "error",
                    "request_id": request_id,
                    "error": format!("unsupported control request: {subtype}"),
                },
            });
            checks.spawn(async move {
                let _ = control.write(frame).await;
            });
            return;
        }

        let tool_name = request
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let input = request
            .get("input")
            .cloned()
            .unwrap_or_else(colloquy_protocol::empty_input);
        let gate = self.gate.clone();
        checks.spawn(async move {
            let decision = gate.check(&tool_name, input).await;
            let frame = json!({
                "type": "control_response",
                "response": {
                    "subtype": "success",
                    "request_id": request_id,
                    "response": decision,
                },
            });
            if let Err(err) = control.write(frame).await {
                tracing::debug!(tool_name = %tool_name, error = %err, "could not deliver permission decision");
            }
        });
    }
}
