//! # parley-realtime — Real-time messaging core for Parley
//!
//! Live connections, presence, and delivery for a multi-user chat: direct
//! and group messages, offline replay, typing indicators, and read receipts
//! over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ ChatClient  │ ◄─────────────────► │ ChatServer       │
//! │ (per user)  │   JSON text frames  │ (central)        │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │ one task per connection
//!                                              ▼
//!                                     ┌──────────────────┐
//!                                     │ConnectionManager │── SessionValidator ── SessionAuthority
//!                                     └────────┬─────────┘
//!                 ┌──────────────┬─────────────┼──────────────┬──────────────┐
//!                 ▼              ▼             ▼              ▼              ▼
//!          MessageRouter   TypingTracker  ReadReceipt     Presence       OfflineQueue
//!                 │                       Tracker         Registry
//!                 ▼
//!               Store ◄──── membership, receipts
//!
//!          everything that delivers goes through the Hub (per-connection
//!          outbound queues + group rooms)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Tagged JSON wire events and domain ids
//! - [`error`] — Error taxonomy and wire error codes
//! - [`session`] — Session validation with a hashed-token cache
//! - [`presence`] — User ↔ connection registry (one session per user)
//! - [`broadcast`] — Delivery hub: outbound queues and room fan-out
//! - [`offline`] — Bounded per-user queue for disconnected recipients
//! - [`typing`] — Typing indicators with inactivity expiry
//! - [`receipts`] — Idempotent read receipts and unread counts
//! - [`router`] — Persist-then-deliver message routing
//! - [`connection`] — Per-connection state machine
//! - [`server`] — WebSocket chat server
//! - [`client`] — WebSocket chat client with reconnection
//! - [`storage`] — Store collaborator trait and in-memory store

pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod offline;
pub mod presence;
pub mod protocol;
pub mod receipts;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;
pub mod typing;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, CloseReason, Hub};
pub use client::{ChatClient, ChatEvent, ConnectionState, DisconnectReason, ReconnectPolicy};
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionManager, Flow};
pub use error::{ChatError, ErrorCode, ProtocolError};
pub use offline::{OfflineQueue, QueuedEvent};
pub use presence::{Departure, Participant, PresenceRegistry};
pub use protocol::{
    ClientEvent, ConnectionId, Conversation, GroupId, Message, MessageId, MessageType,
    SendMessage, ServerEvent, UserId, UserSummary,
};
pub use receipts::ReadReceiptTracker;
pub use router::MessageRouter;
pub use server::{ChatServer, ServerStats};
pub use session::{Identity, SessionAuthority, SessionValidator, StaticAuthority};
pub use storage::{MemoryStore, Store, StoreError};
pub use typing::TypingTracker;
