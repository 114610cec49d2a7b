//! Offline delivery queue: events held for users who are not connected.
//!
//! Bounded per user (oldest evicted first) and aged out by a periodic sweep
//! so abandoned accounts cannot grow memory without limit.
//!
//! The per-user `DashMap` entry is the unit of atomicity. Routing and
//! registration both run *inside* that guard:
//!
//! ```text
//! router:   entry(bob) ─► live(event)? ── yes ─► Live
//!                                   └── no ──► push_back (evict oldest if full)
//!
//! connect:  entry(bob) ─► register(bob, conn) ─► replay queue into conn
//! ```
//!
//! so an event can never be queued after Bob's flush and then sit there
//! while Bob is online.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::protocol::{ServerEvent, UserId};

/// An event waiting for its recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub event: ServerEvent,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedEvent {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event,
            enqueued_at: Utc::now(),
        }
    }

    /// The event as sent on replay: `queued = true` plus the enqueue time.
    pub fn into_replay(self) -> ServerEvent {
        self.event.into_replay(self.enqueued_at)
    }
}

/// Outcome of [`OfflineQueue::deliver_or_enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Live,
    Queued,
}

/// Outcome of [`OfflineQueue::register_and_replay`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Replay {
    pub delivered: usize,
    pub retained: usize,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queued_users: usize,
    pub queued_events: usize,
    pub evicted: u64,
    pub expired: u64,
}

pub struct OfflineQueue {
    queues: DashMap<UserId, VecDeque<QueuedEvent>>,
    capacity: usize,
    max_age: Duration,
    evicted: AtomicU64,
    expired: AtomicU64,
}

impl OfflineQueue {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
            max_age,
            evicted: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Hold an event for `user`.
    pub fn enqueue(&self, user: UserId, event: ServerEvent) {
        self.push(user, QueuedEvent::new(event));
    }

    /// Hold an already-stamped event for `user`.
    pub fn push(&self, user: UserId, item: QueuedEvent) {
        let mut queue = self.queues.entry(user).or_default();
        self.push_bounded(user, &mut queue, item);
    }

    fn push_bounded(&self, user: UserId, queue: &mut VecDeque<QueuedEvent>, item: QueuedEvent) {
        while queue.len() >= self.capacity {
            if queue.pop_front().is_some() {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                log::debug!("Offline queue for {user} full, evicted oldest event");
            }
        }
        queue.push_back(item);
    }

    /// Try `live` first; queue the event if it reports failure.
    ///
    /// `live` runs while the user's queue entry is locked, which makes the
    /// online check and the enqueue one atomic step. It must not touch this
    /// queue.
    pub fn deliver_or_enqueue<F>(&self, user: UserId, event: ServerEvent, live: F) -> Routed
    where
        F: FnOnce(&ServerEvent) -> bool,
    {
        let entry = self.queues.entry(user);
        if live(&event) {
            return Routed::Live;
        }
        let name = event.name();
        let mut queue = entry.or_default();
        self.push_bounded(user, &mut queue, QueuedEvent::new(event));
        log::debug!("Queued {name} for offline user {user}");
        Routed::Queued
    }

    /// Take and clear everything held for `user`, oldest first.
    pub fn flush(&self, user: UserId) -> Vec<QueuedEvent> {
        self.queues
            .remove(&user)
            .map(|(_, queue)| queue.into())
            .unwrap_or_default()
    }

    /// Run `register` under the user's queue lock, then replay the queue
    /// through `deliver` before releasing it.
    ///
    /// Pairs with [`deliver_or_enqueue`](Self::deliver_or_enqueue): anything
    /// routed after `register` sees the user online and lands behind the
    /// replayed events, anything routed before is part of the replay. Events
    /// `deliver` refuses stay queued with their original enqueue time.
    pub fn register_and_replay<R, F, D>(&self, user: UserId, register: F, mut deliver: D) -> (R, Replay)
    where
        F: FnOnce() -> R,
        D: FnMut(ServerEvent) -> bool,
    {
        match self.queues.entry(user) {
            Entry::Occupied(mut occupied) => {
                let registered = register();
                let pending = std::mem::take(occupied.get_mut());
                let mut replay = Replay::default();
                for item in pending {
                    if deliver(item.clone().into_replay()) {
                        replay.delivered += 1;
                    } else {
                        occupied.get_mut().push_back(item);
                        replay.retained += 1;
                    }
                }
                if occupied.get().is_empty() {
                    occupied.remove();
                } else {
                    log::warn!("{} queued events for {user} kept for a later replay", replay.retained);
                }
                (registered, replay)
            }
            Entry::Vacant(_vacant) => (register(), Replay::default()),
        }
    }

    /// Drop events older than the max age; remove queues left empty.
    ///
    /// Returns the number of events dropped.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return 0;
        };

        let mut dropped = 0;
        self.queues.retain(|user, queue| {
            while queue.front().is_some_and(|item| item.enqueued_at < cutoff) {
                queue.pop_front();
                dropped += 1;
            }
            if queue.is_empty() {
                log::debug!("Offline queue for {user} expired");
            }
            !queue.is_empty()
        });
        self.expired.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    pub fn len(&self, user: UserId) -> usize {
        self.queues.get(&user).map_or(0, |queue| queue.len())
    }

    pub fn is_empty(&self, user: UserId) -> bool {
        self.len(user) == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued_users: self.queues.len(),
            queued_events: self.queues.iter().map(|queue| queue.len()).sum(),
            evicted: self.evicted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}
