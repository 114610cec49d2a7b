//! Message router: persist first, then deliver.
//!
//! ```text
//! send_message ─► resolve target ─► (group) membership ─► Store::persist_message
//!                                                                │
//!              message_sent ◄── origin connection ◄──────────────┤
//!                                                                ▼
//!                         direct: live via presence, else offline queue
//!                         group:  fan-out to the room (no offline replay)
//! ```
//!
//! A store failure stops everything after it: nothing is acknowledged and
//! nothing is delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::broadcast::Hub;
use crate::error::ChatError;
use crate::offline::{OfflineQueue, Routed};
use crate::presence::{Participant, PresenceRegistry};
use crate::protocol::{Conversation, Delivery, Message, NewMessage, SendMessage, ServerEvent};
use crate::storage::Store;

#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    pub messages_routed: u64,
    pub delivered_live: u64,
    pub queued_offline: u64,
    pub group_deliveries: u64,
}

pub struct MessageRouter {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
    presence: Arc<PresenceRegistry>,
    offline: Arc<OfflineQueue>,
    messages_routed: AtomicU64,
    delivered_live: AtomicU64,
    queued_offline: AtomicU64,
    group_deliveries: AtomicU64,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<Hub>,
        presence: Arc<PresenceRegistry>,
        offline: Arc<OfflineQueue>,
    ) -> Self {
        Self {
            store,
            hub,
            presence,
            offline,
            messages_routed: AtomicU64::new(0),
            delivered_live: AtomicU64::new(0),
            queued_offline: AtomicU64::new(0),
            group_deliveries: AtomicU64::new(0),
        }
    }

    /// Persist and deliver one message from `sender`.
    pub async fn send(&self, sender: &Participant, request: SendMessage) -> Result<Message, ChatError> {
        let conversation = request.conversation()?;

        if let Conversation::Group(group) = conversation {
            if !self.store.is_group_member(group, sender.user_id).await? {
                return Err(ChatError::NotAMember {
                    user: sender.user_id,
                    group,
                });
            }
        }

        let message = self
            .store
            .persist_message(NewMessage {
                sender_id: sender.user_id,
                sender_username: sender.username.clone(),
                conversation,
                content: request.content,
                message_type: request.message_type,
                file_meta: request.file_meta,
            })
            .await
            .map_err(|e| {
                log::error!("Failed to persist message from {}: {e}", sender.user_id);
                ChatError::PersistenceFailure(e)
            })?;
        self.messages_routed.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self
            .hub
            .send(sender.connection_id, ServerEvent::MessageSent(message.clone()))
        {
            log::debug!("Ack for message {} not delivered: {e}", message.id);
        }

        match conversation {
            Conversation::Direct(recipient) => {
                let event = ServerEvent::NewMessage(Delivery::live(message.clone()));
                let routed = self.offline.deliver_or_enqueue(recipient, event, |event| {
                    self.presence
                        .connection_of(recipient)
                        .is_some_and(|conn| self.hub.send(conn, event.clone()).is_ok())
                });
                match routed {
                    Routed::Live => self.delivered_live.fetch_add(1, Ordering::Relaxed),
                    Routed::Queued => self.queued_offline.fetch_add(1, Ordering::Relaxed),
                };
                log::debug!("Message {} to {recipient}: {routed:?}", message.id);
            }
            Conversation::Group(group) => {
                let event = ServerEvent::GroupMessage(Delivery::live(message.clone()));
                let delivered = self
                    .hub
                    .broadcast_room(group, event, Some(sender.connection_id));
                self.group_deliveries
                    .fetch_add(delivered as u64, Ordering::Relaxed);
                log::debug!(
                    "Message {} to group {group} reached {delivered} connections",
                    message.id
                );
            }
        }

        Ok(message)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            delivered_live: self.delivered_live.load(Ordering::Relaxed),
            queued_offline: self.queued_offline.load(Ordering::Relaxed),
            group_deliveries: self.group_deliveries.load(Ordering::Relaxed),
        }
    }
}
