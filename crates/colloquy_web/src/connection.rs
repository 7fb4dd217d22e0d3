use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use colloquy_protocol::{ClientEnvelope, ServerEnvelope};
use colloquy_runtime::{Outbound, Session};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::state;
use crate::ConversationServer;

/// GET /ws/conversation
pub(crate) async fn ws_handler(
    State(server): State<ConversationServer>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_connection(server, socket))
}

/// Run one connection: a fresh session actor bridged to the socket.
/// Ends when the socket closes, the session stops, or a newer connection claims the token.
async fn serve_connection(server: ConversationServer, socket: WebSocket) {
    let connection_id = state::new_connection_id();
    let teardown = CancellationToken::new();
    let finished = CancellationToken::new();
    state::register_connection(&server.state, &connection_id, teardown.clone(), finished.clone())
        .await;
    tracing::info!(%connection_id, "conversation connection opened");

    let (inbound_tx, inbound_rx) = mpsc::channel(server.config.inbound_channel_capacity);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(server.config.outbound_channel_capacity);
    let mut outbound = Outbound::new(outbound_tx);
    if let Some(sink_tx) = &server.sink_tx {
        outbound = outbound.with_transcript(connection_id.clone(), sink_tx.clone());
    }

    let session = match Session::new(
        server.engine.clone(),
        server.session_config.clone(),
        outbound,
    ) {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(%connection_id, error = %err, "failed to create session");
            state::unregister_connection(&server.state, &connection_id).await;
            finished.cancel();
            return;
        }
    };
    let session_task = tokio::spawn(session.run(inbound_rx));
    let (mut sender, receiver) = socket.split();
    // Inbound frames are read on their own task so a stale-connection takeover or a
    // full inbound queue never stalls delivery of outbound envelopes.
    let mut reader = tokio::spawn(read_client_frames(
        server.clone(),
        connection_id.clone(),
        receiver,
        inbound_tx,
    ));

    loop {
        tokio::select! {
            biased;
            _ = teardown.cancelled() => {
                tracing::info!(%connection_id, "connection superseded by a newer one");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            envelope = outbound_rx.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                if let ServerEnvelope::SessionInit { session_id, .. } = &envelope {
                    state::claim_session_token(&server.state, &connection_id, session_id).await;
                }
                if !send_envelope(&mut sender, &envelope).await {
                    break;
                }
            }
            _ = &mut reader => break,
        }
    }

    // Dropping the reader closes the session's inbound queue.
    reader.abort();
    drop(outbound_rx);
    if let Err(err) = session_task.await {
        tracing::warn!(%connection_id, error = %err, "session task failed");
    }
    state::unregister_connection(&server.state, &connection_id).await;
    finished.cancel();
    tracing::info!(%connection_id, "conversation connection closed");
}

/// Forward client envelopes to the session until the socket or the session closes.
async fn read_client_frames(
    server: ConversationServer,
    connection_id: String,
    mut receiver: SplitStream<WebSocket>,
    inbound_tx: mpsc::Sender<ClientEnvelope>,
) {
    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(%connection_id, error = %err, "websocket receive failed");
                break;
            }
        };
        let envelope = match serde_json::from_str::<ClientEnvelope>(text.as_str()) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(%connection_id, error = %err, "ignoring malformed client envelope");
                continue;
            }
        };
        if let ClientEnvelope::ResumeSession { session_id } = &envelope {
            take_over_session(&server, &connection_id, session_id).await;
        }
        if inbound_tx.send(envelope).await.is_err() {
            break;
        }
    }
}

/// Tear down whichever connection currently holds `session_token` before this one uses it.
async fn take_over_session(server: &ConversationServer, connection_id: &str, session_token: &str) {
    let Some(stale_finished) =
        state::claim_session_token(&server.state, connection_id, session_token).await
    else {
        return;
    };
    tracing::info!(connection_id, session_token, "waiting for stale connection to close");
    if timeout(
        server.config.stale_teardown_timeout,
        stale_finished.cancelled(),
    )
    .await
    .is_err()
    {
        tracing::warn!(
            connection_id,
            session_token,
            "stale connection did not close in time; continuing"
        );
    }
}

async fn send_envelope(sender: &mut SplitSink<WebSocket, Message>, envelope: &ServerEnvelope) -> bool {
    let text = match serde_json::to_string(envelope) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(kind = envelope.kind(), error = %err, "failed to serialize envelope");
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}
