use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub(crate) struct ConnectionRecord {
    /// Cancelled to make the connection close itself.
    pub(crate) teardown: CancellationToken,
    /// Cancelled by the connection once its session has fully stopped.
    pub(crate) finished: CancellationToken,
    pub(crate) session_token: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    pub(crate) connections: HashMap<String, ConnectionRecord>,
    pub(crate) token_to_connection: HashMap<String, String>,
}

pub(crate) async fn register_connection(
    state: &Arc<RwLock<ConnectionState>>,
    connection_id: &str,
    teardown: CancellationToken,
    finished: CancellationToken,
) {
    let mut state = state.write().await;
    state.connections.insert(
        connection_id.to_owned(),
        ConnectionRecord {
            teardown,
            finished,
            session_token: None,
        },
    );
}

/// Bind `session_token` to `connection_id`.
/// If another live connection held the token, its teardown is signalled and its
/// `finished` token returned so the caller can wait for it.
pub(crate) async fn claim_session_token(
    state: &Arc<RwLock<ConnectionState>>,
    connection_id: &str,
    session_token: &str,
) -> Option<CancellationToken> {
    let mut state = state.write().await;
    let previous_holder = state
        .token_to_connection
        .insert(session_token.to_owned(), connection_id.to_owned());

    let replaced_token = state
        .connections
        .get_mut(connection_id)
        .and_then(|record| record.session_token.replace(session_token.to_owned()));
    if let Some(replaced_token) = replaced_token.filter(|token| token != session_token) {
        if state.token_to_connection.get(&replaced_token).map(String::as_str) == Some(connection_id)
        {
            state.token_to_connection.remove(&replaced_token);
        }
    }

    let holder = previous_holder.filter(|holder| holder != connection_id)?;
    let stale = state.connections.get_mut(&holder)?;
    stale.session_token = None;
    stale.teardown.cancel();
    Some(stale.finished.clone())
}

pub(crate) async fn unregister_connection(
    state: &Arc<RwLock<ConnectionState>>,
    connection_id: &str,
) {
    let mut state = state.write().await;
    let Some(record) = state.connections.remove(connection_id) else {
        return;
    };
    if let Some(token) = record.session_token {
        if state.token_to_connection.get(&token).map(String::as_str) == Some(connection_id) {
            state.token_to_connection.remove(&token);
        }
    }
}

pub(crate) fn new_connection_id() -> String {
    format!("conn_{}", Uuid::new_v4())
}
