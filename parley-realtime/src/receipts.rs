//! Read receipts: idempotent per-(message, reader) marks.
//!
//! The store's insert-if-absent is the source of truth. In front of it an
//! in-flight set keeps two concurrent requests for the same pair (two open
//! tabs, a retry racing the original) from both reaching the store; the
//! loser simply reports the id as not newly marked.
//!
//! Only newly marked ids are broadcast, and never back to the reader's own
//! connection, so a reader cannot decrement their own unread count twice.
//!
//! Ids are only accepted when they name a message of the conversation that
//! the reader did not author. Anything else is dropped before it is claimed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use crate::broadcast::Hub;
use crate::error::ChatError;
use crate::presence::{Participant, PresenceRegistry};
use crate::protocol::{Conversation, Message, MessageId, ReadNotice, ServerEvent, UserId};
use crate::storage::{ReadReceipt, Store};

type ReceiptKey = (MessageId, UserId);

/// Keys claimed by one request; released on drop, including on error paths.
struct InFlight<'a> {
    map: &'a DashMap<ReceiptKey, ()>,
    keys: Vec<ReceiptKey>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        for key in &self.keys {
            self.map.remove(key);
        }
    }
}

pub struct ReadReceiptTracker {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
    presence: Arc<PresenceRegistry>,
    in_flight: DashMap<ReceiptKey, ()>,
}

impl ReadReceiptTracker {
    pub fn new(store: Arc<dyn Store>, hub: Arc<Hub>, presence: Arc<PresenceRegistry>) -> Self {
        Self {
            store,
            hub,
            presence,
            in_flight: DashMap::new(),
        }
    }

    /// Mark `ids` read by `reader`. Returns the ids newly marked by this call.
    pub async fn mark_read(
        &self,
        reader: &Participant,
        ids: &[MessageId],
        conversation: Conversation,
    ) -> Result<Vec<MessageId>, ChatError> {
        let readable: HashSet<MessageId> = self
            .readable_ids(reader.user_id, conversation)
            .await?
            .into_iter()
            .collect();
        let accepted: Vec<MessageId> = ids
            .iter()
            .copied()
            .filter(|id| readable.contains(id))
            .collect();
        if accepted.len() < ids.len() {
            log::debug!(
                "Ignoring {} read marks from {} outside {}",
                ids.len() - accepted.len(),
                reader.user_id,
                conversation.id()
            );
        }
        if accepted.is_empty() {
            return Ok(Vec::new());
        }
        self.record(reader, &accepted, conversation).await
    }

    /// Write receipts for ids already known to belong to the conversation.
    async fn record(
        &self,
        reader: &Participant,
        ids: &[MessageId],
        conversation: Conversation,
    ) -> Result<Vec<MessageId>, ChatError> {
        let claimed = self.claim(reader.user_id, ids);
        let mut newly = Vec::with_capacity(claimed.keys.len());
        for (message_id, reader_id) in claimed.keys.iter().copied() {
            let receipt = ReadReceipt {
                message_id,
                reader_id,
                read_at: Utc::now(),
            };
            if self
                .store
                .insert_read_receipt(receipt)
                .await
                .map_err(ChatError::PersistenceFailure)?
            {
                newly.push(message_id);
            }
        }
        drop(claimed);

        if !newly.is_empty() {
            log::debug!(
                "User {} read {} messages in {}",
                reader.user_id,
                newly.len(),
                conversation.id()
            );
            self.broadcast(reader, &newly, conversation);
        }
        Ok(newly)
    }

    /// Mark everything in `conversation` that `reader` has not read yet.
    pub async fn mark_all_read(
        &self,
        reader: &Participant,
        conversation: Conversation,
    ) -> Result<Vec<MessageId>, ChatError> {
        let unread = self.unread_ids(reader.user_id, conversation).await?;
        if unread.is_empty() {
            return Ok(Vec::new());
        }
        self.record(reader, &unread, conversation).await
    }

    /// Messages in `conversation` not authored by `reader` and not yet read.
    pub async fn unread_count(
        &self,
        reader: UserId,
        conversation: Conversation,
    ) -> Result<usize, ChatError> {
        Ok(self.unread_ids(reader, conversation).await?.len())
    }

    async fn unread_ids(
        &self,
        reader: UserId,
        conversation: Conversation,
    ) -> Result<Vec<MessageId>, ChatError> {
        let candidates = self.readable_ids(reader, conversation).await?;
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let read = self.store.read_message_ids(reader, &candidates).await?;
        Ok(candidates
            .into_iter()
            .filter(|id| !read.contains(id))
            .collect())
    }

    /// Messages of `conversation` that `reader` may mark: everything they did
    /// not author.
    async fn readable_ids(
        &self,
        reader: UserId,
        conversation: Conversation,
    ) -> Result<Vec<MessageId>, ChatError> {
        Ok(self
            .store
            .conversation_messages(reader, conversation)
            .await?
            .iter()
            .filter(|message| message.sender_id != reader)
            .map(|message: &Message| message.id)
            .collect())
    }

    /// Claim the not-yet-in-flight keys among `ids`, deduplicated.
    fn claim(&self, reader: UserId, ids: &[MessageId]) -> InFlight<'_> {
        let mut seen = HashSet::with_capacity(ids.len());
        let keys = ids
            .iter()
            .filter(|id| seen.insert(**id))
            .map(|id| (*id, reader))
            .filter(|key| self.in_flight.insert(*key, ()).is_none())
            .collect();
        InFlight {
            map: &self.in_flight,
            keys,
        }
    }

    fn broadcast(&self, reader: &Participant, ids: &[MessageId], conversation: Conversation) {
        match conversation {
            Conversation::Direct(peer) => {
                // The peer sees the conversation keyed by the reader.
                let event = ServerEvent::MessagesRead(ReadNotice {
                    message_ids: ids.to_vec(),
                    reader_id: reader.user_id,
                    reader_username: reader.username.clone(),
                    conversation_id: reader.user_id.as_uuid(),
                    is_group: false,
                });
                if let Some(conn) = self.presence.connection_of(peer) {
                    if let Err(e) = self.hub.send(conn, event) {
                        log::debug!("Read notice to {peer} not delivered: {e}");
                    }
                }
            }
            Conversation::Group(group) => {
                let event = ServerEvent::MessagesRead(ReadNotice {
                    message_ids: ids.to_vec(),
                    reader_id: reader.user_id,
                    reader_username: reader.username.clone(),
                    conversation_id: group.as_uuid(),
                    is_group: true,
                });
                self.hub
                    .broadcast_room(group, event, Some(reader.connection_id));
            }
        }
    }

    /// Receipt writes currently in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
