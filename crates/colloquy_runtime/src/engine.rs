use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use colloquy_protocol::{PermissionMode, RunResult};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::EngineError;
use crate::feeder::TurnSource;
use crate::permissions::PermissionGate;

pub mod process;

pub use process::{ProcessEngine, ProcessEngineConfig};

pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything an engine needs to start one run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub workspace_root: PathBuf,
    /// Engine session token to continue, if any.
    pub resume: Option<String>,
    pub permission_mode: PermissionMode,
    /// Consulted once per tool invocation before it executes.
    pub permissions: PermissionGate,
    /// Run scope. Engines stop producing output promptly once cancelled.
    pub cancel: CancellationToken,
}

/// One item of the engine's output stream.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineOutput {
    SessionInit {
        session_id: String,
        model: Option<String>,
        tools: Vec<String>,
    },
    Assistant {
        message: Value,
        parent_tool_use_id: Option<String>,
    },
    StreamEvent {
        event: Value,
        parent_tool_use_id: Option<String>,
    },
    Result(RunResult),
    /// Any other engine message, forwarded opaquely.
    Other { kind: String, data: Value },
}

/// In-flight controls for a started run.
pub trait RunControl: Send + Sync {
    fn interrupt(&self) -> EngineFuture<'_, Result<(), EngineError>>;

    fn set_permission_mode(&self, mode: PermissionMode) -> EngineFuture<'_, Result<(), EngineError>>;
}

/// A started run: an ordered output stream plus its control handle.
/// The stream ends when the run finishes; a trailing `Err` reports a failed run.
pub struct EngineRun {
    pub outputs: mpsc::Receiver<Result<EngineOutput, EngineError>>,
    pub control: Arc<dyn RunControl>,
}

/// Seam between the session orchestrator and whatever produces assistant output.
pub trait AgentEngine: Send + Sync + 'static {
    fn start_run<'a>(
        &'a self,
        turns: TurnSource,
        options: RunOptions,
    ) -> EngineFuture<'a, Result<EngineRun, EngineError>>;
}
