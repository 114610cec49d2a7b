//! In-memory [`Store`] implementation.
//!
//! Keeps messages, group membership and read receipts behind one async
//! `RwLock`. Can be switched unavailable to exercise persistence-failure
//! paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ReadReceipt, Store, StoreError};
use crate::protocol::{Conversation, GroupId, Message, MessageId, NewMessage, UserId};

#[derive(Default)]
struct MemoryState {
    messages: Vec<Message>,
    groups: HashMap<GroupId, HashSet<UserId>>,
    receipts: HashMap<(MessageId, UserId), DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a group with the given members.
    pub async fn add_group(&self, group: GroupId, members: impl IntoIterator<Item = UserId>) {
        let mut state = self.state.write().await;
        state.groups.insert(group, members.into_iter().collect());
    }

    pub async fn add_member(&self, group: GroupId, user: UserId) {
        let mut state = self.state.write().await;
        state.groups.entry(group).or_default().insert(user);
    }

    pub async fn remove_member(&self, group: GroupId, user: UserId) -> bool {
        let mut state = self.state.write().await;
        state
            .groups
            .get_mut(&group)
            .is_some_and(|members| members.remove(&user))
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    pub async fn receipt_count(&self) -> usize {
        self.state.read().await.receipts.len()
    }

    pub async fn read_at(&self, message: MessageId, reader: UserId) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .await
            .receipts
            .get(&(message, reader))
            .copied()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn persist_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.check_available()?;
        let stored = Message {
            id: MessageId::new(),
            sender_id: message.sender_id,
            sender_username: message.sender_username,
            recipient_id: match message.conversation {
                Conversation::Direct(user) => Some(user),
                Conversation::Group(_) => None,
            },
            group_id: message.conversation.group(),
            content: message.content,
            message_type: message.message_type,
            file_meta: message.file_meta,
            created_at: Utc::now(),
        };
        self.state.write().await.messages.push(stored.clone());
        Ok(stored)
    }

    async fn list_group_rooms_for(&self, user: UserId) -> Result<Vec<GroupId>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .groups
            .iter()
            .filter(|(_, members)| members.contains(&user))
            .map(|(group, _)| *group)
            .collect())
    }

    async fn is_group_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .groups
            .get(&group)
            .is_some_and(|members| members.contains(&user)))
    }

    async fn conversation_messages(
        &self,
        reader: UserId,
        conversation: Conversation,
    ) -> Result<Vec<Message>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| match conversation {
                Conversation::Direct(peer) => m.is_between(reader, peer),
                Conversation::Group(group) => m.group_id == Some(group),
            })
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn insert_read_receipt(&self, receipt: ReadReceipt) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let key = (receipt.message_id, receipt.reader_id);
        if state.receipts.contains_key(&key) {
            return Ok(false);
        }
        state.receipts.insert(key, receipt.read_at);
        Ok(true)
    }

    async fn read_message_ids(
        &self,
        reader: UserId,
        messages: &[MessageId],
    ) -> Result<HashSet<MessageId>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(messages
            .iter()
            .filter(|id| state.receipts.contains_key(&(**id, reader)))
            .copied()
            .collect())
    }
}
