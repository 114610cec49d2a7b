//! WebSocket chat client.
//!
//! Provides:
//! - Connection lifecycle (connect, authenticate, logout)
//! - Automatic reconnection with capped exponential backoff
//! - Typed send helpers for every client event
//!
//! A supervisor task owns the socket. Outgoing events go through a channel
//! that outlives individual sockets, so events submitted while reconnecting
//! are sent once the new session is authenticated.
//!
//! Reconnection only follows abnormal loss of the connection. It never
//! follows `logout()`, an `auth_error`, or a `force_disconnect` (a newer
//! connection owns the session).

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{ChatError, ProtocolError};
use crate::protocol::{
    ClientEvent, Conversation, ConversationRef, GroupId, MarkRead, MessageId, SendMessage,
    ServerEvent, TypingTarget, UserSummary,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Why the client stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `logout()` was called or the client was dropped
    Logout,
    /// The server rejected the token
    AuthRejected(String),
    /// The server closed this session in favour of another
    ForceDisconnected(String),
    /// Reconnection attempts exhausted
    GaveUp { attempts: u32 },
}

/// Events emitted by the chat client.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Socket open, authentication pending
    Connected,
    Authenticated(UserSummary),
    /// Any other server event
    Event(ServerEvent),
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected { reason: DisconnectReason },
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`, attempt counted from 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// How a live session ended.
enum SessionEnd {
    Logout,
    AuthRejected(String),
    ForceDisconnected(String),
    Lost(String),
}

/// Why a handshake failed.
enum HandshakeError {
    Rejected(String),
    Transport(ProtocolError),
}

/// The chat client.
pub struct ChatClient {
    url: String,
    token: String,
    policy: ReconnectPolicy,
    handshake_timeout: Duration,

    /// Connection state, shared with the supervisor task
    state: Arc<RwLock<ConnectionState>>,

    /// Identity reported by the last successful authentication
    user: Arc<RwLock<Option<UserSummary>>>,

    /// Outgoing events; the receiving half lives in the supervisor
    outgoing_tx: Option<mpsc::Sender<ClientEvent>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ChatEvent>>,

    event_tx: mpsc::Sender<ChatEvent>,

    logout_tx: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl ChatClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            url: url.into(),
            token: token.into(),
            policy: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(5),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            user: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            logout_tx: None,
            supervisor: None,
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.event_rx.take()
    }

    /// Connect and authenticate, then keep the session alive in the
    /// background.
    ///
    /// The first attempt is not retried: its failure is returned here.
    pub async fn connect(&mut self) -> Result<UserSummary, ChatError> {
        if self.supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            if let Some(user) = self.user().await {
                return Ok(user);
            }
        }
        *self.state.write().await = ConnectionState::Connecting;

        let (ws, user) = match handshake(&self.url, &self.token, self.handshake_timeout).await {
            Ok(session) => session,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(match e {
                    HandshakeError::Rejected(reason) => {
                        log::warn!("Authentication rejected: {reason}");
                        ChatError::Unauthenticated
                    }
                    HandshakeError::Transport(e) => e.into(),
                });
            }
        };

        *self.user.write().await = Some(user.clone());
        *self.state.write().await = ConnectionState::Connected;

        let (out_tx, out_rx) = mpsc::channel(256);
        let (logout_tx, logout_rx) = oneshot::channel();
        self.outgoing_tx = Some(out_tx);
        self.logout_tx = Some(logout_tx);

        let supervisor = Supervisor {
            url: self.url.clone(),
            token: self.token.clone(),
            policy: self.policy,
            handshake_timeout: self.handshake_timeout,
            state: self.state.clone(),
            user: self.user.clone(),
            event_tx: self.event_tx.clone(),
            outgoing: out_rx,
            logout: logout_rx,
        };
        self.supervisor = Some(tokio::spawn(supervisor.run(ws, user.clone())));
        Ok(user)
    }

    /// Close the session; no reconnection follows.
    pub async fn logout(&mut self) {
        if let Some(tx) = self.logout_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.supervisor.take() {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                log::warn!("Client supervisor did not stop after logout");
            }
        }
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Queue an event for the server.
    ///
    /// While reconnecting, events wait for the next authenticated session.
    pub async fn send(&self, event: ClientEvent) -> Result<(), ProtocolError> {
        if *self.state.read().await == ConnectionState::Disconnected {
            return Err(ProtocolError::ConnectionClosed);
        }
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(event)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn send_message(&self, request: SendMessage) -> Result<(), ProtocolError> {
        self.send(ClientEvent::SendMessage(request)).await
    }

    pub async fn start_typing(&self, conversation: Conversation) -> Result<(), ProtocolError> {
        self.send(ClientEvent::TypingStart(TypingTarget::from(conversation)))
            .await
    }

    pub async fn stop_typing(&self, conversation: Conversation) -> Result<(), ProtocolError> {
        self.send(ClientEvent::TypingStop(TypingTarget::from(conversation)))
            .await
    }

    pub async fn mark_read(
        &self,
        message_ids: Vec<MessageId>,
        conversation: Conversation,
    ) -> Result<(), ProtocolError> {
        self.send(ClientEvent::MarkMessagesRead(MarkRead {
            message_ids,
            conversation_id: conversation.id(),
            is_group: conversation.is_group(),
        }))
        .await
    }

    pub async fn mark_all_read(&self, conversation: Conversation) -> Result<(), ProtocolError> {
        self.send(ClientEvent::MarkAllRead(ConversationRef::from(conversation)))
            .await
    }

    pub async fn join_room(&self, room: GroupId) -> Result<(), ProtocolError> {
        self.send(ClientEvent::JoinRoom { room }).await
    }

    pub async fn leave_room(&self, room: GroupId) -> Result<(), ProtocolError> {
        self.send(ClientEvent::LeaveRoom { room }).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Identity of the last successful authentication.
    pub async fn user(&self) -> Option<UserSummary> {
        self.user.read().await.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

/// Owns the socket for the lifetime of a logical session, across reconnects.
struct Supervisor {
    url: String,
    token: String,
    policy: ReconnectPolicy,
    handshake_timeout: Duration,
    state: Arc<RwLock<ConnectionState>>,
    user: Arc<RwLock<Option<UserSummary>>>,
    event_tx: mpsc::Sender<ChatEvent>,
    outgoing: mpsc::Receiver<ClientEvent>,
    logout: oneshot::Receiver<()>,
}

impl Supervisor {
    async fn run(mut self, ws: WsStream, user: UserSummary) {
        let mut session = Some((ws, user));
        let mut attempt = 0u32;

        let reason = loop {
            if let Some((ws, user)) = session.take() {
                attempt = 0;
                *self.user.write().await = Some(user.clone());
                *self.state.write().await = ConnectionState::Connected;
                self.emit(ChatEvent::Connected);
                self.emit(ChatEvent::Authenticated(user));

                match self.run_session(ws).await {
                    SessionEnd::Logout => break DisconnectReason::Logout,
                    SessionEnd::AuthRejected(reason) => break DisconnectReason::AuthRejected(reason),
                    SessionEnd::ForceDisconnected(reason) => {
                        break DisconnectReason::ForceDisconnected(reason)
                    }
                    SessionEnd::Lost(reason) => log::warn!("Connection to {} lost: {reason}", self.url),
                }
            }

            if attempt >= self.policy.max_attempts {
                break DisconnectReason::GaveUp { attempts: attempt };
            }
            let delay = self.policy.delay(attempt);
            attempt += 1;
            *self.state.write().await = ConnectionState::Reconnecting;
            self.emit(ChatEvent::Reconnecting { attempt, delay });
            log::info!("Reconnecting to {} in {delay:?} (attempt {attempt})", self.url);

            tokio::select! {
                _ = &mut self.logout => break DisconnectReason::Logout,
                () = tokio::time::sleep(delay) => {}
            }

            match handshake(&self.url, &self.token, self.handshake_timeout).await {
                Ok(established) => session = Some(established),
                Err(HandshakeError::Rejected(reason)) => break DisconnectReason::AuthRejected(reason),
                Err(HandshakeError::Transport(e)) => {
                    log::debug!("Reconnect attempt {attempt} failed: {e}");
                }
            }
        };

        *self.state.write().await = ConnectionState::Disconnected;
        log::info!("Client for {} stopped: {reason:?}", self.url);
        self.emit(ChatEvent::Disconnected { reason });
    }

    async fn run_session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                _ = &mut self.logout => {
                    match ClientEvent::Logout.to_json() {
                        Ok(json) => {
                            if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                                log::debug!("Logout not sent: {e}");
                            }
                        }
                        Err(e) => log::error!("Failed to encode logout: {e}"),
                    }
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return SessionEnd::Logout;
                }

                outgoing = self.outgoing.recv() => {
                    let Some(event) = outgoing else {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return SessionEnd::Logout;
                    };
                    let json = match event.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            log::error!("Failed to encode {}: {e}", event.name());
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_json(text.as_str()) {
                            Ok(ServerEvent::ForceDisconnect { reason }) => {
                                return SessionEnd::ForceDisconnected(reason);
                            }
                            Ok(ServerEvent::AuthError { error }) => {
                                return SessionEnd::AuthRejected(error);
                            }
                            Ok(event) => self.emit(ChatEvent::Event(event)),
                            Err(e) => log::warn!("Ignoring undecodable server event: {e}"),
                        },
                        Some(Ok(WsMessage::Ping(data))) => {
                            if let Err(e) = sink.send(WsMessage::Pong(data)).await {
                                return SessionEnd::Lost(e.to_string());
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return SessionEnd::Lost("closed by server".into());
                        }
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Hand an event to the application without waiting on it. A full
    /// channel drops the event so the socket and logout keep being served.
    fn emit(&self, event: ChatEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Event channel full; dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::trace!("Event receiver dropped");
            }
        }
    }
}

/// Open a socket and authenticate on it.
async fn handshake(
    url: &str,
    token: &str,
    timeout: Duration,
) -> Result<(WsStream, UserSummary), HandshakeError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| HandshakeError::Transport(e.into()))?;

    let hello = ClientEvent::Authenticate {
        token: token.to_string(),
    }
    .to_json()
    .map_err(HandshakeError::Transport)?;
    ws.send(WsMessage::Text(hello.into()))
        .await
        .map_err(|e| HandshakeError::Transport(e.into()))?;

    let answer = tokio::time::timeout(timeout, await_auth_answer(&mut ws))
        .await
        .map_err(|_| HandshakeError::Transport(ProtocolError::Timeout))?;

    match answer {
        Ok(Ok(user)) => Ok((ws, user)),
        Ok(Err(reason)) => Err(HandshakeError::Rejected(reason)),
        Err(e) => Err(HandshakeError::Transport(e)),
    }
}

/// First `authenticated` (user) or `auth_error` (reason) on a fresh socket.
async fn await_auth_answer(ws: &mut WsStream) -> Result<Result<UserSummary, String>, ProtocolError> {
    while let Some(frame) = ws.next().await {
        match frame? {
            WsMessage::Text(text) => match ServerEvent::from_json(text.as_str())? {
                ServerEvent::Authenticated(user) => return Ok(Ok(user)),
                ServerEvent::AuthError { error } => return Ok(Err(error)),
                other => log::debug!("Ignoring {} before authentication", other.name()),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(ProtocolError::ConnectionClosed)
}
