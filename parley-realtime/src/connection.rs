//! Connection manager: the per-connection state machine.
//!
//! Transport-independent. The server task owns one [`Connection`] per socket
//! and feeds it decoded client events; everything shared lives behind the
//! [`ConnectionManager`].
//!
//! ```text
//!   Connecting ──open──► Authenticating ──authenticate ok──► Authenticated
//!        │                     │ bad token / timeout               │
//!        └─────────────────────┴──────────────► Disconnected ◄─────┘
//! ```
//!
//! Authentication runs in this order:
//! 1. validate the token (fail closed, `auth_error` then close)
//! 2. `authenticated` + `online_users` into the outbound queue
//! 3. presence register and offline replay under the user's queue lock
//! 4. close the evicted connection, if any
//! 5. subscribe to the user's group rooms
//! 6. `user_online` to everyone else, unless the user was already online
//!
//! Validation is bounded by the connection's authentication deadline, so a
//! slow authority cannot hold an unauthenticated socket open past it.
//! `logout` drops the cached session and closes the connection.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::broadcast::{CloseReason, Hub, Subscription};
use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::offline::OfflineQueue;
use crate::presence::{Departure, Participant, PresenceRegistry};
use crate::protocol::{
    ClientEvent, ConnectionId, Conversation, GroupId, MarkedNotice, MessageId, ServerEvent, UserId,
};
use crate::receipts::ReadReceiptTracker;
use crate::router::MessageRouter;
use crate::session::{SessionAuthority, SessionValidator};
use crate::storage::Store;
use crate::typing::TypingTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport handshake in progress; no application data accepted
    Connecting,
    /// Waiting for `authenticate`
    Authenticating,
    Authenticated,
    /// Terminal
    Disconnected,
}

/// One live connection, owned by its handling task.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    participant: Option<Participant>,
    rooms: HashSet<GroupId>,
    opened_at: DateTime<Utc>,
    auth_deadline: Option<Instant>,
    /// Hashed token of the validated session, dropped from the cache on logout
    session_key: Option<String>,
}

impl Connection {
    fn new() -> Self {
        Self {
            id: ConnectionId::new(),
            state: ConnectionState::Connecting,
            participant: None,
            rooms: HashSet::new(),
            opened_at: Utc::now(),
            auth_deadline: None,
            session_key: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn participant(&self) -> Option<&Participant> {
        self.participant.as_ref()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.participant.as_ref().map(|p| p.user_id)
    }

    pub fn rooms(&self) -> &HashSet<GroupId> {
        &self.rooms
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// End of the authentication window, once it has started.
    pub fn auth_deadline(&self) -> Option<Instant> {
        self.auth_deadline
    }

    fn require_participant(&self) -> Result<Participant, ChatError> {
        match (&self.state, &self.participant) {
            (ConnectionState::Authenticated, Some(participant)) => Ok(participant.clone()),
            _ => Err(ChatError::NotAuthenticated),
        }
    }
}

/// What the transport should do after an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Result of one background sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_events: usize,
    pub expired_sessions: usize,
}

pub struct ConnectionManager {
    config: ServerConfig,
    validator: SessionValidator,
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
    presence: Arc<PresenceRegistry>,
    offline: Arc<OfflineQueue>,
    typing: Arc<TypingTracker>,
    receipts: ReadReceiptTracker,
    router: MessageRouter,
}

impl ConnectionManager {
    pub fn new(
        config: ServerConfig,
        authority: Arc<dyn SessionAuthority>,
        store: Arc<dyn Store>,
    ) -> Self {
        let hub = Arc::new(Hub::new(config.outbound_buffer));
        let presence = Arc::new(PresenceRegistry::new());
        let offline = Arc::new(OfflineQueue::new(
            config.offline_queue_capacity,
            config.offline_max_age,
        ));
        let typing = Arc::new(TypingTracker::new(
            hub.clone(),
            presence.clone(),
            config.typing_timeout,
        ));
        let receipts = ReadReceiptTracker::new(store.clone(), hub.clone(), presence.clone());
        let router = MessageRouter::new(store.clone(), hub.clone(), presence.clone(), offline.clone());

        Self {
            validator: SessionValidator::from_config(authority, &config),
            config,
            store,
            hub,
            presence,
            offline,
            typing,
            receipts,
            router,
        }
    }

    /// Create a connection and its outbound queue.
    pub fn open(&self) -> (Connection, Subscription) {
        let conn = Connection::new();
        let subscription = self.hub.attach(conn.id);
        log::debug!("Connection {} opened", conn.id);
        (conn, subscription)
    }

    /// Transport is up; start the authentication window.
    pub fn begin_authentication(&self, conn: &mut Connection) {
        if conn.state == ConnectionState::Connecting {
            conn.state = ConnectionState::Authenticating;
            conn.auth_deadline = Some(Instant::now() + self.config.auth_timeout);
        }
    }

    /// Handle one client event and translate errors into replies.
    ///
    /// Request errors are answered with `error` on this connection only;
    /// lifecycle errors ask the transport to close.
    pub async fn dispatch(&self, conn: &mut Connection, event: ClientEvent) -> Flow {
        let name = event.name();
        let closes = matches!(event, ClientEvent::Logout);
        match self.handle_event(conn, event).await {
            Ok(()) if closes => Flow::Close,
            Ok(()) => Flow::Continue,
            Err(e) if e.is_fatal() => {
                log::info!("Closing connection {} after {name}: {e}", conn.id);
                Flow::Close
            }
            Err(e) => {
                log::debug!("Rejected {name} on {}: {e}", conn.id);
                self.report(conn.id, &e);
                Flow::Continue
            }
        }
    }

    /// Send a request-level `error` to one connection.
    pub fn report(&self, conn: ConnectionId, err: &ChatError) {
        if let Err(e) = self.hub.send(conn, ServerEvent::error(err)) {
            log::debug!("Error reply not delivered: {e}");
        }
    }

    pub async fn handle_event(&self, conn: &mut Connection, event: ClientEvent) -> Result<(), ChatError> {
        match event {
            ClientEvent::Authenticate { token } => self.authenticate(conn, &token).await,
            ClientEvent::SendMessage(request) => {
                let sender = conn.require_participant()?;
                self.router.send(&sender, request).await.map(|_| ())
            }
            ClientEvent::TypingStart(target) => {
                let who = conn.require_participant()?;
                let conversation = target.conversation()?;
                Self::require_room(conn, &who, conversation)?;
                self.typing.start_typing(&who, conversation);
                Ok(())
            }
            ClientEvent::TypingStop(target) => {
                let who = conn.require_participant()?;
                let conversation = target.conversation()?;
                self.typing.stop_typing(&who, conversation);
                Ok(())
            }
            ClientEvent::MarkMessagesRead(request) => {
                let reader = conn.require_participant()?;
                let conversation = Conversation::from_wire(request.conversation_id, request.is_group);
                self.require_member(&reader, conversation).await?;
                let newly = self
                    .receipts
                    .mark_read(&reader, &request.message_ids, conversation)
                    .await?;
                self.send_marked(conn.id, conversation, newly);
                Ok(())
            }
            ClientEvent::MarkAllRead(request) => {
                let reader = conn.require_participant()?;
                let conversation = request.conversation();
                self.require_member(&reader, conversation).await?;
                let newly = self.receipts.mark_all_read(&reader, conversation).await?;
                self.send_marked(conn.id, conversation, newly);
                Ok(())
            }
            ClientEvent::JoinRoom { room } => {
                let who = conn.require_participant()?;
                if !self.store.is_group_member(room, who.user_id).await? {
                    return Err(ChatError::NotAMember {
                        user: who.user_id,
                        group: room,
                    });
                }
                self.hub.join_room(room, conn.id);
                conn.rooms.insert(room);
                self.hub.send(conn.id, ServerEvent::RoomJoined { room })?;
                Ok(())
            }
            ClientEvent::LeaveRoom { room } => {
                let who = conn.require_participant()?;
                self.hub.leave_room(room, conn.id);
                conn.rooms.remove(&room);
                self.typing.stop_typing(&who, Conversation::Group(room));
                self.hub.send(conn.id, ServerEvent::RoomLeft { room })?;
                Ok(())
            }
            ClientEvent::Logout => {
                self.logout(conn);
                Ok(())
            }
        }
    }

    /// Forget the connection's cached session. The caller closes the socket.
    fn logout(&self, conn: &mut Connection) {
        let Some(key) = conn.session_key.take() else {
            log::debug!("Logout on unauthenticated connection {}", conn.id);
            return;
        };
        let dropped = self.validator.invalidate_key(&key);
        if let Some(user) = conn.user_id() {
            log::info!("User {user} logged out on {} (cached session dropped: {dropped})", conn.id);
        }
    }

    async fn authenticate(&self, conn: &mut Connection, token: &str) -> Result<(), ChatError> {
        match conn.state {
            ConnectionState::Authenticating => {}
            ConnectionState::Authenticated => {
                log::debug!("Connection {} sent authenticate twice; ignored", conn.id);
                return Ok(());
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                return Err(ChatError::NotAuthenticated);
            }
        }

        let validation = self.validator.validate(token);
        let outcome = match conn.auth_deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, validation)
                .await
                .unwrap_or_else(|_| Err(ChatError::AuthTimeout(self.config.auth_timeout))),
            None => validation.await,
        };
        let identity = match outcome {
            Ok(identity) => identity,
            Err(e) => {
                self.reject(conn, &e);
                return Err(e);
            }
        };
        conn.session_key = Some(SessionValidator::hash_token(token));

        let participant = Participant::new(identity.user_id, identity.username.clone(), conn.id);
        let user = participant.user_id;
        self.hub.bind_user(conn.id, user);
        self.hub
            .send(conn.id, ServerEvent::Authenticated(identity.summary()))?;
        let users = self
            .presence
            .list_online()
            .into_iter()
            .filter(|summary| summary.user_id != user)
            .collect();
        self.hub.send(conn.id, ServerEvent::OnlineUsers { users })?;

        let (evicted, replay) = self.offline.register_and_replay(
            user,
            || self.presence.register(user, participant.username.clone(), conn.id),
            |event| self.hub.send(conn.id, event).is_ok(),
        );
        conn.participant = Some(participant.clone());
        conn.state = ConnectionState::Authenticated;

        if let Some(previous) = evicted {
            if !self.hub.close(previous, CloseReason::Superseded) {
                log::debug!("Evicted connection {previous} was already closing");
            }
        }

        match self.store.list_group_rooms_for(user).await {
            Ok(rooms) => {
                for room in rooms {
                    self.hub.join_room(room, conn.id);
                    conn.rooms.insert(room);
                }
            }
            Err(e) => log::warn!("Could not load group rooms for {user}: {e}"),
        }

        if evicted.is_none() {
            self.hub
                .broadcast_authenticated(ServerEvent::UserOnline(participant.summary()), Some(conn.id));
        }

        log::info!(
            "User {} ({user}) authenticated on {}: {} rooms, {} queued events replayed",
            participant.username,
            conn.id,
            conn.rooms.len(),
            replay.delivered
        );
        Ok(())
    }

    /// Authentication window elapsed without a valid token.
    pub fn reject_timeout(&self, conn: &mut Connection) {
        let err = ChatError::AuthTimeout(self.config.auth_timeout);
        log::info!("Connection {} did not authenticate in time", conn.id);
        self.reject(conn, &err);
    }

    fn reject(&self, conn: &Connection, err: &ChatError) {
        let event = ServerEvent::AuthError {
            error: err.to_string(),
        };
        if let Err(e) = self.hub.send(conn.id, event) {
            log::debug!("auth_error not delivered to {}: {e}", conn.id);
        }
    }

    /// Tear a connection down. Safe to call more than once.
    ///
    /// Typing state and `user_offline` are only touched when this was the
    /// user's live connection; a connection already replaced by a newer one
    /// leaves the user online.
    pub fn disconnect(&self, conn: &mut Connection) -> Departure {
        if conn.state == ConnectionState::Disconnected {
            return Departure::Unknown;
        }
        conn.state = ConnectionState::Disconnected;

        let departure = self.presence.unregister(conn.id);
        self.hub.detach(conn.id, conn.rooms.drain());

        match &departure {
            Departure::WentOffline(summary) => {
                let cleared = self.typing.clear_user(summary.user_id);
                if !cleared.is_empty() {
                    log::debug!("Cleared {} typing indicators of {}", cleared.len(), summary.user_id);
                }
                self.hub
                    .broadcast_authenticated(ServerEvent::UserOffline(summary.clone()), None);
                log::info!("User {} ({}) went offline", summary.username, summary.user_id);
            }
            Departure::Superseded(user) => {
                log::debug!("Connection {} of {user} closed after being replaced", conn.id);
            }
            Departure::Unknown => {
                log::debug!("Connection {} closed", conn.id);
            }
        }
        departure
    }

    /// Purge aged offline events and expired cached sessions.
    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            expired_events: self.offline.purge_expired(Utc::now()),
            expired_sessions: self.validator.purge_expired(),
        };
        if report != SweepReport::default() {
            log::info!(
                "Sweep removed {} offline events and {} cached sessions",
                report.expired_events,
                report.expired_sessions
            );
        }
        report
    }

    /// Signal every live connection to close.
    pub fn shutdown(&self) -> usize {
        self.presence
            .list_online()
            .into_iter()
            .filter_map(|summary| self.presence.connection_of(summary.user_id))
            .filter(|conn| self.hub.close(*conn, CloseReason::Shutdown))
            .count()
    }

    fn require_room(conn: &Connection, who: &Participant, conversation: Conversation) -> Result<(), ChatError> {
        match conversation {
            Conversation::Group(group) if !conn.rooms.contains(&group) => Err(ChatError::NotAMember {
                user: who.user_id,
                group,
            }),
            _ => Ok(()),
        }
    }

    async fn require_member(&self, who: &Participant, conversation: Conversation) -> Result<(), ChatError> {
        match conversation {
            Conversation::Group(group) if !self.store.is_group_member(group, who.user_id).await? => {
                Err(ChatError::NotAMember {
                    user: who.user_id,
                    group,
                })
            }
            _ => Ok(()),
        }
    }

    fn send_marked(&self, conn: ConnectionId, conversation: Conversation, message_ids: Vec<MessageId>) {
        let event = ServerEvent::MessagesMarked(MarkedNotice {
            conversation_id: conversation.id(),
            is_group: conversation.is_group(),
            message_ids,
        });
        if let Err(e) = self.hub.send(conn, event) {
            log::debug!("messages_marked not delivered to {conn}: {e}");
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn validator(&self) -> &SessionValidator {
        &self.validator
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    pub fn offline(&self) -> &Arc<OfflineQueue> {
        &self.offline
    }

    pub fn typing(&self) -> &Arc<TypingTracker> {
        &self.typing
    }

    pub fn receipts(&self) -> &ReadReceiptTracker {
        &self.receipts
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }
}
