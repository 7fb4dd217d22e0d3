use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::errors::RuntimeError;

const STDERR_TAIL_LINES: usize = 20;

/// How to launch one engine child process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ChildSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildTransportConfig {
    pub read_channel_capacity: usize,
    pub write_channel_capacity: usize,
}

impl Default for ChildTransportConfig {
    fn default() -> Self {
        Self {
            read_channel_capacity: 256,
            write_channel_capacity: 64,
        }
    }
}

/// What remained after the child was reaped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildExit {
    pub status: ExitStatus,
    pub malformed_line_count: u64,
    pub stderr_tail: Vec<String>,
}

impl ChildExit {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Line-delimited JSON pipe to a child process: stdout lines become `Value`s,
/// values written to the writer become stdin lines. Stderr is logged and its tail kept.
pub struct ChildTransport {
    write_tx: Option<mpsc::Sender<Value>>,
    read_rx: Option<mpsc::Receiver<Value>>,
    malformed_line_count: Arc<AtomicU64>,
    stderr_tail: StderrTail,
    reader_task: Option<JoinHandle<std::io::Result<()>>>,
    writer_task: Option<JoinHandle<std::io::Result<()>>>,
    stderr_task: Option<JoinHandle<()>>,
    child: Child,
}

impl ChildTransport {
    pub fn spawn(spec: ChildSpec, config: ChildTransportConfig) -> Result<Self, RuntimeError> {
        if config.read_channel_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "read_channel_capacity must be > 0".to_owned(),
            ));
        }
        if config.write_channel_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "write_channel_capacity must be > 0".to_owned(),
            ));
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|err| {
            RuntimeError::Internal(format!(
                "failed to spawn {}: {err}",
                spec.program.display()
            ))
        })?;
        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;

        let (write_tx, write_rx) = mpsc::channel(config.write_channel_capacity);
        let (read_tx, read_rx) = mpsc::channel(config.read_channel_capacity);
        let malformed_line_count = Arc::new(AtomicU64::new(0));
        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));

        tracing::debug!(
            program = %spec.program.display(),
            pid = child.id(),
            "engine child spawned"
        );

        Ok(Self {
            write_tx: Some(write_tx),
            read_rx: Some(read_rx),
            reader_task: Some(tokio::spawn(stdout_loop(
                stdout,
                read_tx,
                Arc::clone(&malformed_line_count),
            ))),
            writer_task: Some(tokio::spawn(stdin_loop(write_rx, stdin))),
            stderr_task: Some(tokio::spawn(stderr_loop(stderr, Arc::clone(&stderr_tail)))),
            malformed_line_count,
            stderr_tail,
            child,
        })
    }

    /// Hand out the only stdin sender; stdin closes once every clone of it is dropped.
    pub fn take_writer(&mut self) -> Result<mpsc::Sender<Value>, RuntimeError> {
        self.write_tx.take().ok_or(RuntimeError::TransportClosed)
    }

    pub fn take_reader(&mut self) -> Result<mpsc::Receiver<Value>, RuntimeError> {
        self.read_rx.take().ok_or_else(|| {
            RuntimeError::Internal("stdout receiver already taken from transport".to_owned())
        })
    }

    pub fn malformed_line_count(&self) -> u64 {
        self.malformed_line_count.load(Ordering::Relaxed)
    }

    /// Close stdin, give the writer `flush_timeout` to drain, give the child
    /// `terminate_grace` to exit on its own, then kill it. Reader tasks are always joined.
    pub async fn shutdown(
        mut self,
        flush_timeout: Duration,
        terminate_grace: Duration,
    ) -> Result<ChildExit, RuntimeError> {
        drop(self.write_tx.take());
        drop(self.read_rx.take());

        if let Some(mut writer_task) = self.writer_task.take() {
            let joined = match timeout(flush_timeout, &mut writer_task).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::debug!("engine stdin flush timed out; terminating child");
                    reap_with_grace(&mut self.child, terminate_grace).await?;
                    writer_task.await
                }
            };
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(error = %err, "engine stdin writer failed"),
                Err(err) => {
                    return Err(RuntimeError::Internal(format!(
                        "writer task join failed: {err}"
                    )))
                }
            }
        }

        let status = reap_with_grace(&mut self.child, terminate_grace).await?;

        if let Some(reader_task) = self.reader_task.take() {
            match reader_task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(error = %err, "engine stdout reader failed"),
                Err(err) => {
                    return Err(RuntimeError::Internal(format!(
                        "reader task join failed: {err}"
                    )))
                }
            }
        }
        if let Some(stderr_task) = self.stderr_task.take() {
            let _ = stderr_task.await;
        }

        let stderr_tail = match self.stderr_tail.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        };
        Ok(ChildExit {
            status,
            malformed_line_count: self.malformed_line_count(),
            stderr_tail,
        })
    }
}

fn take_pipe<T>(pipe: Option<T>, label: &str) -> Result<T, RuntimeError> {
    pipe.ok_or_else(|| RuntimeError::Internal(format!("failed to acquire child {label} pipe")))
}

async fn reap_with_grace(
    child: &mut Child,
    terminate_grace: Duration,
) -> Result<ExitStatus, RuntimeError> {
    if let Some(status) = child
        .try_wait()
        .map_err(|err| RuntimeError::Internal(format!("child try_wait failed: {err}")))?
    {
        return Ok(status);
    }

    match timeout(terminate_grace, child.wait()).await {
        Ok(waited) => {
            waited.map_err(|err| RuntimeError::Internal(format!("child wait failed: {err}")))
        }
        Err(_) => {
            tracing::debug!(pid = child.id(), "engine child did not exit in time; killing");
            child
                .kill()
                .await
                .map_err(|err| RuntimeError::Internal(format!("child kill failed: {err}")))?;
            child.wait().await.map_err(|err| {
                RuntimeError::Internal(format!("child wait after kill failed: {err}"))
            })
        }
    }
}

/// One stdout line -> one JSON parse attempt; non-JSON lines are counted and skipped.
/// Allocation: one reusable String buffer per task. Complexity: O(line_length) per line.
async fn stdout_loop(
    stdout: ChildStdout,
    read_tx: mpsc::Sender<Value>,
    malformed_line_count: Arc<AtomicU64>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stdout);
    let mut line = String::with_capacity(4096);

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(raw) {
            Ok(json) => {
                if read_tx.send(json).await.is_err() {
                    return Ok(());
                }
            }
            Err(err) => {
                malformed_line_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %err, "skipping non-JSON engine stdout line");
            }
        }
    }
}

/// Single serialization path into child stdin. A broken pipe means the child is gone
/// and ends the loop quietly.
async fn stdin_loop(
    mut write_rx: mpsc::Receiver<Value>,
    mut stdin: ChildStdin,
) -> std::io::Result<()> {
    let mut frame = Vec::<u8>::with_capacity(4096);

    while let Some(json) = write_rx.recv().await {
        frame.clear();
        serde_json::to_writer(&mut frame, &json).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to serialize engine input: {err}"),
            )
        })?;
        frame.push(b'\n');

        match stdin.write_all(&frame).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
            Err(err) => return Err(err),
        }
    }

    match stdin.flush().await {
        Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => Err(err),
        _ => Ok(()),
    }
}

async fn stderr_loop(stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "colloquy_runtime::engine::stderr", "{line}");
        let mut tail = match tail.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
