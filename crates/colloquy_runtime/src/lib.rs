//! Server-side conversation runtime: session orchestration, permission arbitration,
//! turn feeding, and the agent engine seam.

pub mod config;
pub mod engine;
pub mod errors;
pub mod feeder;
pub mod outbound;
pub mod permissions;
pub mod session;
pub mod sink;
pub mod transport;
mod wire;

pub use colloquy_protocol as protocol;
pub use config::{SessionConfig, DEFAULT_SAFE_TOOLS, DEFAULT_WORKSPACE_DIR};
pub use engine::{
    AgentEngine, EngineFuture, EngineOutput, EngineRun, ProcessEngine, ProcessEngineConfig,
    RunControl, RunOptions,
};
pub use errors::{EngineError, RuntimeError, SinkError};
pub use feeder::{turn_channel, Delivery, FeedError, TurnFeeder, TurnSource};
pub use outbound::{spawn_sink_worker, Outbound};
pub use permissions::{PermissionArbitrator, PermissionDecision, PermissionGate};
pub use session::Session;
pub use sink::{JsonlTranscript, TranscriptRecord, TranscriptSink, TranscriptSinkFuture};
pub use transport::{ChildSpec, ChildTransportConfig};
