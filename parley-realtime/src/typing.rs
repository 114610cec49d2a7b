//! Typing indicators.
//!
//! Per conversation key (direct peer or group) the set of users currently
//! typing. One inactivity timer runs per mark. A refresh by a later
//! `typing_start` only moves the mark's refresh time; the timer sleeps again
//! for the remainder when it wakes early. The mark's generation keeps a timer
//! from clearing a newer mark created after a stop.
//!
//! Notifications go out on transitions only:
//! - not typing → typing: `typing_start {isTyping: true}`
//! - typing → not typing (stop, timeout, disconnect): `typing_stop {isTyping: false}`

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::broadcast::Hub;
use crate::presence::{Participant, PresenceRegistry};
use crate::protocol::{ConnectionId, Conversation, ServerEvent, TypingNotice, UserId};

#[derive(Debug, Clone)]
struct TypingMark {
    generation: u64,
    origin: ConnectionId,
    username: String,
    refreshed_at: Instant,
}

pub struct TypingTracker {
    hub: Arc<Hub>,
    presence: Arc<PresenceRegistry>,
    timeout: Duration,
    conversations: DashMap<Conversation, HashSet<UserId>>,
    /// Reverse index; its per-user guard is taken before `conversations`.
    by_user: DashMap<UserId, HashMap<Conversation, TypingMark>>,
    generation: AtomicU64,
    timers: AtomicUsize,
}

impl TypingTracker {
    pub fn new(hub: Arc<Hub>, presence: Arc<PresenceRegistry>, timeout: Duration) -> Self {
        Self {
            hub,
            presence,
            timeout,
            conversations: DashMap::new(),
            by_user: DashMap::new(),
            generation: AtomicU64::new(0),
            timers: AtomicUsize::new(0),
        }
    }

    /// Mark `who` as typing in `conversation`, or refresh an existing mark.
    ///
    /// Returns `true` if the user was not already typing there. Only a new
    /// mark starts a timer.
    pub fn start_typing(self: &Arc<Self>, who: &Participant, conversation: Conversation) -> bool {
        let started = {
            let mut marks = self.by_user.entry(who.user_id).or_default();
            match marks.entry(conversation) {
                Entry::Occupied(mut occupied) => {
                    let mark = occupied.get_mut();
                    mark.refreshed_at = Instant::now();
                    mark.origin = who.connection_id;
                    None
                }
                Entry::Vacant(vacant) => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    vacant.insert(TypingMark {
                        generation,
                        origin: who.connection_id,
                        username: who.username.clone(),
                        refreshed_at: Instant::now(),
                    });
                    self.conversations
                        .entry(conversation)
                        .or_default()
                        .insert(who.user_id);
                    Some(generation)
                }
            }
        };

        match started {
            Some(generation) => {
                self.notify(who.user_id, &who.username, who.connection_id, conversation, true);
                self.arm(who.user_id, conversation, generation);
                true
            }
            None => false,
        }
    }

    fn arm(self: &Arc<Self>, user: UserId, conversation: Conversation, generation: u64) {
        let tracker = Arc::clone(self);
        self.timers.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let mut due = Instant::now() + tracker.timeout;
            loop {
                tokio::time::sleep_until(due).await;
                match tracker.expire(user, conversation, generation) {
                    Some(later) => due = later,
                    None => break,
                }
            }
            tracker.timers.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Explicit stop. Returns `true` if the user was typing.
    pub fn stop_typing(&self, who: &Participant, conversation: Conversation) -> bool {
        match self.take_mark(who.user_id, conversation) {
            Some(mark) => {
                self.notify(who.user_id, &mark.username, mark.origin, conversation, false);
                true
            }
            None => false,
        }
    }

    /// Remove `user` from every conversation, notifying a stop for each.
    pub fn clear_user(&self, user: UserId) -> Vec<Conversation> {
        let Some((_, marks)) = self.by_user.remove(&user) else {
            return Vec::new();
        };
        let mut cleared = Vec::with_capacity(marks.len());
        for (conversation, mark) in marks {
            self.remove_from_conversation(user, conversation);
            self.notify(user, &mark.username, mark.origin, conversation, false);
            cleared.push(conversation);
        }
        cleared
    }

    /// Clear the mark if it sat idle for the whole timeout. Returns the new
    /// due time when it was refreshed in the meantime.
    fn expire(&self, user: UserId, conversation: Conversation, generation: u64) -> Option<Instant> {
        let mark = {
            let mut marks = self.by_user.get_mut(&user)?;
            let current = marks.get(&conversation)?;
            if current.generation != generation {
                return None;
            }
            let due = current.refreshed_at + self.timeout;
            if due > Instant::now() {
                return Some(due);
            }
            let mark = marks.remove(&conversation)?;
            self.remove_from_conversation(user, conversation);
            mark
        };
        self.by_user.remove_if(&user, |_, marks| marks.is_empty());
        log::trace!("Typing indicator for {user} expired");
        self.notify(user, &mark.username, mark.origin, conversation, false);
        None
    }

    fn take_mark(&self, user: UserId, conversation: Conversation) -> Option<TypingMark> {
        let mark = {
            let mut marks = self.by_user.get_mut(&user)?;
            let mark = marks.remove(&conversation)?;
            self.remove_from_conversation(user, conversation);
            mark
        };
        self.by_user.remove_if(&user, |_, marks| marks.is_empty());
        Some(mark)
    }

    fn remove_from_conversation(&self, user: UserId, conversation: Conversation) {
        if let Some(mut typing) = self.conversations.get_mut(&conversation) {
            typing.remove(&user);
        }
        self.conversations
            .remove_if(&conversation, |_, typing| typing.is_empty());
    }

    fn notify(
        &self,
        user: UserId,
        username: &str,
        origin: ConnectionId,
        conversation: Conversation,
        is_typing: bool,
    ) {
        let event = ServerEvent::typing(TypingNotice {
            user_id: user,
            username: username.to_string(),
            is_typing,
            group_id: conversation.group(),
        });
        match conversation {
            Conversation::Direct(peer) => {
                if let Some(conn) = self.presence.connection_of(peer) {
                    if let Err(e) = self.hub.send(conn, event) {
                        log::debug!("Typing notice to {peer} not delivered: {e}");
                    }
                }
            }
            Conversation::Group(group) => {
                self.hub.broadcast_room(group, event, Some(origin));
            }
        }
    }

    /// Users currently typing in `conversation`.
    pub fn typing_in(&self, conversation: Conversation) -> Vec<UserId> {
        self.conversations
            .get(&conversation)
            .map(|typing| typing.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_typing(&self, user: UserId, conversation: Conversation) -> bool {
        self.by_user
            .get(&user)
            .is_some_and(|marks| marks.contains_key(&conversation))
    }

    /// Number of conversations with at least one typing user.
    pub fn active_conversations(&self) -> usize {
        self.conversations.len()
    }

    /// Inactivity timers still running.
    pub fn pending_timers(&self) -> usize {
        self.timers.load(Ordering::Relaxed)
    }
}
