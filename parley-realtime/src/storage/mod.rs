//! Store collaborator consumed by the realtime core.
//!
//! The relational store (messages, users, group membership, read receipts)
//! lives outside this crate. The core only needs the narrow contract below:
//!
//! ```text
//! ┌──────────────┐  persist_message      ┌──────────────┐
//! │ MessageRouter│ ────────────────────► │              │
//! └──────────────┘                       │              │
//! ┌──────────────┐  list_group_rooms_for │    Store     │
//! │ Connection   │ ────────────────────► │  (external)  │
//! │ Manager      │  is_group_member      │              │
//! └──────────────┘                       │              │
//! ┌──────────────┐  insert_read_receipt  │              │
//! │ ReadReceipt  │ ────────────────────► │              │
//! │ Tracker      │  conversation_messages└──────────────┘
//! └──────────────┘
//! ```
//!
//! [`MemoryStore`] is an in-process implementation for tests and the
//! development server.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::protocol::{Conversation, GroupId, Message, MessageId, NewMessage, UserId};

pub use memory::MemoryStore;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A single "user has seen message" mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub reader_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new message, assigning its id and timestamp.
    async fn persist_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Groups `user` currently belongs to.
    async fn list_group_rooms_for(&self, user: UserId) -> Result<Vec<GroupId>, StoreError>;

    async fn is_group_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError>;

    /// Messages of `conversation` as seen by `reader`, oldest first.
    async fn conversation_messages(
        &self,
        reader: UserId,
        conversation: Conversation,
    ) -> Result<Vec<Message>, StoreError>;

    /// Insert-if-absent. Returns `true` only when the receipt is new.
    async fn insert_read_receipt(&self, receipt: ReadReceipt) -> Result<bool, StoreError>;

    /// Subset of `messages` that `reader` has already read.
    async fn read_message_ids(
        &self,
        reader: UserId,
        messages: &[MessageId],
    ) -> Result<HashSet<MessageId>, StoreError>;
}
