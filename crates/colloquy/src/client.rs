use std::sync::Arc;
use std::time::Duration;

use colloquy_protocol::{ClientEnvelope, PermissionBehavior, PermissionMode, ServerEnvelope};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::errors::ClientError;
use crate::session::{ClientSnapshot, SessionClient};
use crate::store::TokenStore;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Full endpoint URL, e.g. `ws://127.0.0.1:3000/ws/conversation`.
    pub url: String,
    /// Fixed delay between a lost connection and the next attempt.
    pub reconnect_backoff: Duration,
    pub connect_timeout: Duration,
    pub command_channel_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            command_channel_capacity: 64,
        }
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ClientError::InvalidConfig(format!(
                "url must use ws:// or wss://: {}",
                self.url
            )));
        }
        if self.reconnect_backoff.is_zero() {
            return Err(ClientError::InvalidConfig(
                "reconnect_backoff must be > 0".to_owned(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::InvalidConfig(
                "connect_timeout must be > 0".to_owned(),
            ));
        }
        if self.command_channel_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "command_channel_capacity must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Action {
    SendMessage(String),
    RespondPermission {
        behavior: PermissionBehavior,
        message: Option<String>,
    },
    Interrupt,
    SetPermissionMode(PermissionMode),
    NewSession,
}

struct Command {
    action: Action,
    reply: oneshot::Sender<Result<(), ClientError>>,
}

/// Handle to a background task that keeps one conversation connected.
///
/// The task reconnects after `reconnect_backoff` whenever the socket drops and
/// replays the stored session token on every connect. Dropping the handle
/// closes the connection.
pub struct ConversationClient {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<ClientSnapshot>,
    task: JoinHandle<()>,
}

impl ConversationClient {
    /// Spawn the connection task on the current tokio runtime.
    pub fn spawn(config: ConnectionConfig, store: Arc<dyn TokenStore>) -> Result<Self, ClientError> {
        config.validate()?;
        let state = SessionClient::new(store);
        let (snapshot_tx, snapshots) = watch::channel(state.snapshot());
        let (commands, command_rx) = mpsc::channel(config.command_channel_capacity);
        let driver = Driver {
            config,
            state,
            commands: command_rx,
            snapshots: snapshot_tx,
        };
        let task = tokio::spawn(driver.run());
        Ok(Self {
            commands,
            snapshots,
            task,
        })
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified after every state change. Intermediate states may be coalesced.
    pub fn subscribe(&self) -> watch::Receiver<ClientSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until the published state satisfies `predicate`.
    pub async fn wait_until<F>(&self, mut predicate: F) -> Result<ClientSnapshot, ClientError>
    where
        F: FnMut(&ClientSnapshot) -> bool,
    {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(&mut predicate)
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(ClientSnapshot::clone(&snapshot))
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.request(Action::SendMessage(text.into())).await
    }

    /// Answer the oldest pending permission prompt.
    pub async fn respond_permission(
        &self,
        behavior: PermissionBehavior,
        message: Option<String>,
    ) -> Result<(), ClientError> {
        self.request(Action::RespondPermission { behavior, message })
            .await
    }

    pub async fn interrupt(&self) -> Result<(), ClientError> {
        self.request(Action::Interrupt).await
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), ClientError> {
        self.request(Action::SetPermissionMode(mode)).await
    }

    pub async fn new_session(&self) -> Result<(), ClientError> {
        self.request(Action::NewSession).await
    }

    /// Close the connection and wait for the background task to stop.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "conversation client task failed");
        }
    }

    async fn request(&self, action: Action) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command { action, reply })
            .await
            .map_err(|_| ClientError::Closed)?;
        response.await.map_err(|_| ClientError::Closed)?
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Attempt {
    Connected(Box<Socket>),
    Failed,
    Stop,
}

struct Driver {
    config: ConnectionConfig,
    state: SessionClient,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<ClientSnapshot>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            match self.connect().await {
                Attempt::Stop => return,
                Attempt::Failed => {}
                Attempt::Connected(socket) => {
                    if let Flow::Stop = self.serve(*socket).await {
                        return;
                    }
                    tracing::info!(url = %self.config.url, "conversation connection lost");
                    self.state.on_disconnected();
                    self.publish();
                }
            }
            if let Flow::Stop = self.pause().await {
                return;
            }
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.state.snapshot());
    }

    /// Commands issued while disconnected fail fast instead of queueing.
    fn reject(command: Command) {
        let _ = command.reply.send(Err(ClientError::NotConnected));
    }

    async fn connect(&mut self) -> Attempt {
        let attempt = timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        );
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(Ok((socket, _))) => {
                            tracing::info!(url = %self.config.url, "conversation connected");
                            Attempt::Connected(Box::new(socket))
                        }
                        Ok(Err(err)) => {
                            tracing::warn!(url = %self.config.url, error = %err, "conversation connect failed");
                            Attempt::Failed
                        }
                        Err(_) => {
                            tracing::warn!(url = %self.config.url, "conversation connect timed out");
                            Attempt::Failed
                        }
                    };
                }
                command = self.commands.recv() => match command {
                    Some(command) => Self::reject(command),
                    None => return Attempt::Stop,
                }
            }
        }
    }

    async fn pause(&mut self) -> Flow {
        let backoff = tokio::time::sleep(self.config.reconnect_backoff);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => return Flow::Continue,
                command = self.commands.recv() => match command {
                    Some(command) => Self::reject(command),
                    None => return Flow::Stop,
                }
            }
        }
    }

    async fn serve(&mut self, socket: Socket) -> Flow {
        let (mut sink, mut stream) = socket.split();
        if let Some(resume) = self.state.on_connected() {
            if let Err(err) = send_envelope(&mut sink, &resume).await {
                tracing::debug!(error = %err, "failed to send resume");
                return Flow::Continue;
            }
        }
        self.publish();

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(Command { action, reply }) = command else {
                        let _ = sink.close().await;
                        return Flow::Stop;
                    };
                    let result = match self.apply(action) {
                        Ok(Some(envelope)) => send_envelope(&mut sink, &envelope).await,
                        Ok(None) => Ok(()),
                        Err(err) => Err(err),
                    };
                    let transport_failed = matches!(result, Err(ClientError::Transport(_)));
                    let _ = reply.send(result);
                    self.publish();
                    if transport_failed {
                        return Flow::Continue;
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEnvelope>(text.as_str()) {
                            Ok(envelope) => {
                                self.state.on_envelope(envelope);
                                self.publish();
                            }
                            Err(err) => {
                                tracing::debug!(error = %err, "ignoring malformed server envelope");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Flow::Continue,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "websocket receive failed");
                        return Flow::Continue;
                    }
                }
            }
        }
    }

    fn apply(&mut self, action: Action) -> Result<Option<ClientEnvelope>, ClientError> {
        Ok(match action {
            Action::SendMessage(text) => self.state.send_message(&text),
            Action::RespondPermission { behavior, message } => {
                Some(self.state.respond_permission(behavior, message)?)
            }
            Action::Interrupt => Some(self.state.interrupt()),
            Action::SetPermissionMode(mode) => Some(self.state.change_permission_mode(mode)),
            Action::NewSession => Some(self.state.new_session()),
        })
    }
}

async fn send_envelope(
    sink: &mut SplitSink<Socket, Message>,
    envelope: &ClientEnvelope,
) -> Result<(), ClientError> {
    let text = serde_json::to_string(envelope)
        .map_err(|err| ClientError::Transport(format!("serialize {envelope:?}: {err}")))?;
    sink.send(Message::text(text))
        .await
        .map_err(|err| ClientError::Transport(err.to_string()))
}
