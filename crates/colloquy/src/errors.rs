use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("not connected to the server")]
    NotConnected,
    #[error("no permission request is pending")]
    NoPendingPermission,
    #[error("client is shut down")]
    Closed,
    #[error("token store failed: {0}")]
    TokenStore(String),
    #[error("websocket failed: {0}")]
    Transport(String),
}
