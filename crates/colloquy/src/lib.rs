//! Client side of a colloquy conversation.
//! `SessionClient` is the I/O-free state machine; `ConversationClient` drives it over WebSocket.

mod assembler;
mod client;
mod errors;
mod session;
mod store;
mod transcript;

pub use assembler::{Applied, MessageAssembler};
pub use client::{ConnectionConfig, ConversationClient};
pub use errors::ClientError;
pub use session::{ClientSnapshot, PermissionPrompt, SessionClient};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use transcript::{Role, Transcript, TranscriptEntry};

pub use colloquy_protocol as protocol;
