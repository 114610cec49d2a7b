//! JSON wire protocol for the realtime channel.
//!
//! Every frame is a WebSocket text frame carrying one adjacently tagged event:
//! ```text
//! {"event": "send_message", "data": {"recipientId": "…", "content": "hi", "type": "text"}}
//! ```
//!
//! Inbound frames decode into [`ClientEvent`], outbound frames encode from
//! [`ServerEvent`]. Both are closed sets, so an unknown event name or a
//! malformed payload is rejected at the boundary instead of leaking into the
//! routing code.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, ErrorCode, ProtocolError};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Application user id (owned by the external user store).
    UserId
);
uuid_id!(
    /// Chat group id. Each group has exactly one broadcast room.
    GroupId
);
uuid_id!(
    /// Persisted message id, assigned by the store.
    MessageId
);
uuid_id!(
    /// Server-generated id of one live connection.
    ConnectionId
);

/// Kind of message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

/// Attachment metadata. The upload itself happens out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub url: String,
}

/// A conversation as seen from one participant: either a direct peer or a group.
///
/// Also used as the typing-state key (direct-user-id or group-id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conversation {
    Direct(UserId),
    Group(GroupId),
}

impl Conversation {
    /// Resolve the `recipientId` / `groupId` pair of a request.
    ///
    /// Exactly one of the two must be set.
    pub fn from_target(
        recipient: Option<UserId>,
        group: Option<GroupId>,
    ) -> Result<Self, ChatError> {
        match (recipient, group) {
            (Some(user), None) => Ok(Self::Direct(user)),
            (None, Some(group)) => Ok(Self::Group(group)),
            _ => Err(ChatError::InvalidTarget),
        }
    }

    /// Build from the `{conversationId, isGroup}` pair used by read receipts.
    pub fn from_wire(id: Uuid, is_group: bool) -> Self {
        if is_group {
            Self::Group(GroupId(id))
        } else {
            Self::Direct(UserId(id))
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Direct(user) => user.0,
            Self::Group(group) => group.0,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    pub fn group(&self) -> Option<GroupId> {
        match self {
            Self::Group(group) => Some(*group),
            Self::Direct(_) => None,
        }
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_meta: Option<FileMeta>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// The conversation this message belongs to, from the sender's side.
    pub fn conversation(&self) -> Option<Conversation> {
        Conversation::from_target(self.recipient_id, self.group_id).ok()
    }

    /// Whether `user` takes part in the direct conversation with `peer`.
    pub fn is_between(&self, user: UserId, peer: UserId) -> bool {
        self.group_id.is_none()
            && ((self.sender_id == user && self.recipient_id == Some(peer))
                || (self.sender_id == peer && self.recipient_id == Some(user)))
    }
}

/// Message data handed to the store before an id and timestamp exist.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub sender_username: String,
    pub conversation: Conversation,
    pub content: String,
    pub message_type: MessageType,
    pub file_meta: Option<FileMeta>,
}

/// Message as delivered to a recipient, optionally marked as an offline replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default, skip_serializing_if = "is_false")]
    pub queued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Delivery {
    pub fn live(message: Message) -> Self {
        Self {
            message,
            queued: false,
            queued_at: None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Inbound (client → server)
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_meta: Option<FileMeta>,
}

impl SendMessage {
    pub fn direct(recipient: UserId, content: impl Into<String>) -> Self {
        Self {
            recipient_id: Some(recipient),
            group_id: None,
            content: content.into(),
            message_type: MessageType::Text,
            file_meta: None,
        }
    }

    pub fn group(group: GroupId, content: impl Into<String>) -> Self {
        Self {
            recipient_id: None,
            group_id: Some(group),
            content: content.into(),
            message_type: MessageType::Text,
            file_meta: None,
        }
    }

    pub fn conversation(&self) -> Result<Conversation, ChatError> {
        Conversation::from_target(self.recipient_id, self.group_id)
    }
}

/// Target of a typing indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
}

impl TypingTarget {
    pub fn conversation(&self) -> Result<Conversation, ChatError> {
        Conversation::from_target(self.recipient_id, self.group_id)
    }
}

impl From<Conversation> for TypingTarget {
    fn from(conversation: Conversation) -> Self {
        match conversation {
            Conversation::Direct(user) => Self {
                recipient_id: Some(user),
                group_id: None,
            },
            Conversation::Group(group) => Self {
                recipient_id: None,
                group_id: Some(group),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
    pub message_ids: Vec<MessageId>,
    pub conversation_id: Uuid,
    #[serde(default)]
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: Uuid,
    #[serde(default)]
    pub is_group: bool,
}

impl ConversationRef {
    pub fn conversation(&self) -> Conversation {
        Conversation::from_wire(self.conversation_id, self.is_group)
    }
}

impl From<Conversation> for ConversationRef {
    fn from(conversation: Conversation) -> Self {
        Self {
            conversation_id: conversation.id(),
            is_group: conversation.is_group(),
        }
    }
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate { token: String },
    SendMessage(SendMessage),
    TypingStart(TypingTarget),
    TypingStop(TypingTarget),
    MarkMessagesRead(MarkRead),
    MarkAllRead(ConversationRef),
    JoinRoom { room: GroupId },
    LeaveRoom { room: GroupId },
    /// End the session: the server drops its cached session and closes.
    Logout,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::SendMessage(_) => "send_message",
            Self::TypingStart(_) => "typing_start",
            Self::TypingStop(_) => "typing_stop",
            Self::MarkMessagesRead(_) => "mark_messages_read",
            Self::MarkAllRead(_) => "mark_all_read",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::Logout => "logout",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

// ───────────────────────────────────────────────────────────────────
// Outbound (server → client)
// ───────────────────────────────────────────────────────────────────

/// `{userId, username}`, used for auth results and presence broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub user_id: UserId,
    pub username: String,
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadNotice {
    pub message_ids: Vec<MessageId>,
    pub reader_id: UserId,
    pub reader_username: String,
    pub conversation_id: Uuid,
    pub is_group: bool,
}

/// Answer to the reader: which ids were newly marked by this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkedNotice {
    pub conversation_id: Uuid,
    pub is_group: bool,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Events the server emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Authenticated(UserSummary),
    AuthError { error: String },
    OnlineUsers { users: Vec<UserSummary> },
    MessageSent(Message),
    NewMessage(Delivery),
    GroupMessage(Delivery),
    TypingStart(TypingNotice),
    TypingStop(TypingNotice),
    MessagesRead(ReadNotice),
    MessagesMarked(MarkedNotice),
    UserOnline(UserSummary),
    UserOffline(UserSummary),
    RoomJoined { room: GroupId },
    RoomLeft { room: GroupId },
    ForceDisconnect { reason: String },
    Error(ErrorBody),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticated(_) => "authenticated",
            Self::AuthError { .. } => "auth_error",
            Self::OnlineUsers { .. } => "online_users",
            Self::MessageSent(_) => "message_sent",
            Self::NewMessage(_) => "new_message",
            Self::GroupMessage(_) => "group_message",
            Self::TypingStart(_) => "typing_start",
            Self::TypingStop(_) => "typing_stop",
            Self::MessagesRead(_) => "messages_read",
            Self::MessagesMarked(_) => "messages_marked",
            Self::UserOnline(_) => "user_online",
            Self::UserOffline(_) => "user_offline",
            Self::RoomJoined { .. } => "room_joined",
            Self::RoomLeft { .. } => "room_left",
            Self::ForceDisconnect { .. } => "force_disconnect",
            Self::Error(_) => "error",
        }
    }

    /// Request-level error reply for the originating connection.
    pub fn error(err: &ChatError) -> Self {
        Self::Error(ErrorBody {
            code: err.code(),
            message: err.to_string(),
        })
    }

    pub fn typing(notice: TypingNotice) -> Self {
        if notice.is_typing {
            Self::TypingStart(notice)
        } else {
            Self::TypingStop(notice)
        }
    }

    /// Mark a held event as an offline replay.
    ///
    /// Message deliveries get `queued = true` and their enqueue time; other
    /// events are returned unchanged.
    pub fn into_replay(self, enqueued_at: DateTime<Utc>) -> Self {
        match self {
            Self::NewMessage(delivery) => Self::NewMessage(Delivery {
                queued: true,
                queued_at: Some(enqueued_at),
                ..delivery
            }),
            Self::GroupMessage(delivery) => Self::GroupMessage(Delivery {
                queued: true,
                queued_at: Some(enqueued_at),
                ..delivery
            }),
            other => other,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_message() -> Message {
        Message {
            id: MessageId::new(),
            sender_id: UserId::new(),
            sender_username: "alice".into(),
            recipient_id: Some(UserId::new()),
            group_id: None,
            content: "hi".into(),
            message_type: MessageType::Text,
            file_meta: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_send_message_wire_shape() {
        let recipient = UserId::new();
        let raw = json!({
            "event": "send_message",
            "data": { "recipientId": recipient, "content": "hi", "type": "text" }
        })
        .to_string();

        match ClientEvent::from_json(&raw).unwrap() {
            ClientEvent::SendMessage(req) => {
                assert_eq!(req.recipient_id, Some(recipient));
                assert_eq!(req.group_id, None);
                assert_eq!(req.content, "hi");
                assert_eq!(req.conversation().unwrap(), Conversation::Direct(recipient));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_message_type_defaults_to_text() {
        let raw = json!({
            "event": "send_message",
            "data": { "groupId": GroupId::new(), "content": "hello" }
        })
        .to_string();
        match ClientEvent::from_json(&raw).unwrap() {
            ClientEvent::SendMessage(req) => assert_eq!(req.message_type, MessageType::Text),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_target_requires_exactly_one() {
        let both = SendMessage {
            recipient_id: Some(UserId::new()),
            group_id: Some(GroupId::new()),
            content: "x".into(),
            message_type: MessageType::Text,
            file_meta: None,
        };
        assert!(matches!(both.conversation(), Err(ChatError::InvalidTarget)));

        let neither = SendMessage {
            recipient_id: None,
            group_id: None,
            ..both
        };
        assert!(matches!(neither.conversation(), Err(ChatError::InvalidTarget)));
    }

    #[test]
    fn test_unknown_event_rejected() {
        let raw = r#"{"event":"drop_tables","data":{}}"#;
        assert!(matches!(
            ClientEvent::from_json(raw),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_authenticate_wire_shape() {
        let event = ClientEvent::Authenticate {
            token: "abc".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "authenticate", "data": {"token": "abc"}}));
    }

    #[test]
    fn test_logout_needs_no_data() {
        let event = ClientEvent::from_json(r#"{"event":"logout"}"#).unwrap();
        assert_eq!(event, ClientEvent::Logout);
        assert_eq!(event.name(), "logout");
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "logout");
    }

    #[test]
    fn test_live_delivery_omits_queue_fields() {
        let event = ServerEvent::NewMessage(Delivery::live(sample_message()));
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "new_message");
        assert_eq!(value["data"]["content"], "hi");
        assert!(value["data"].get("queued").is_none());
        assert!(value["data"].get("queuedAt").is_none());
    }

    #[test]
    fn test_replay_marks_queued_and_keeps_timestamp() {
        let message = sample_message();
        let created_at = message.created_at;
        let enqueued_at = Utc::now();

        let replay = ServerEvent::NewMessage(Delivery::live(message)).into_replay(enqueued_at);
        match &replay {
            ServerEvent::NewMessage(delivery) => {
                assert!(delivery.queued);
                assert_eq!(delivery.queued_at, Some(enqueued_at));
                assert_eq!(delivery.message.created_at, created_at);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let decoded = ServerEvent::from_json(&replay.to_json().unwrap()).unwrap();
        assert_eq!(decoded, replay);
    }

    #[test]
    fn test_replay_leaves_other_events_alone() {
        let event = ServerEvent::UserOnline(UserSummary {
            user_id: UserId::new(),
            username: "bob".into(),
        });
        assert_eq!(event.clone().into_replay(Utc::now()), event);
    }

    #[test]
    fn test_typing_notice_camel_case() {
        let event = ServerEvent::typing(TypingNotice {
            user_id: UserId::new(),
            username: "carol".into(),
            is_typing: false,
            group_id: None,
        });
        assert_eq!(event.name(), "typing_stop");
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["data"]["isTyping"], false);
        assert_eq!(value["data"]["username"], "carol");
    }

    #[test]
    fn test_error_event_carries_code() {
        let event = ServerEvent::error(&ChatError::InvalidTarget);
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["code"], "invalid_target");
    }

    #[test]
    fn test_conversation_from_wire() {
        let id = Uuid::new_v4();
        assert_eq!(Conversation::from_wire(id, true), Conversation::Group(GroupId(id)));
        assert_eq!(Conversation::from_wire(id, false), Conversation::Direct(UserId(id)));
        assert_eq!(Conversation::from_wire(id, true).id(), id);
    }

    #[test]
    fn test_message_is_between() {
        let message = sample_message();
        let peer = message.recipient_id.unwrap();
        assert!(message.is_between(message.sender_id, peer));
        assert!(message.is_between(peer, message.sender_id));
        assert!(!message.is_between(peer, UserId::new()));
    }
}
