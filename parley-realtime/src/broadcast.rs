//! Delivery hub: per-connection outbound queues and room fan-out.
//!
//! Every live connection owns a bounded outbound queue. The hub maps
//! connection ids to those queues and group rooms to their subscribed
//! connections, so routing is a map lookup rather than a scan.
//!
//! ```text
//!  router / typing / receipts
//!            │ send(conn) / broadcast_room(group)
//!            ▼
//!  ┌──────────────────────────────┐
//!  │ Hub                          │
//!  │  connections: conn → queue   │
//!  │  rooms:       group → {conn} │
//!  └──────┬─────────────┬─────────┘
//!         ▼             ▼
//!   conn task A    conn task B   (write frames to the socket)
//! ```
//!
//! A subscriber whose queue is full or gone is logged and skipped; it never
//! fails the broadcast for the others. Forced closes use a separate
//! one-shot signal so they cannot be lost to backpressure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::error::ChatError;
use crate::protocol::{ConnectionId, GroupId, ServerEvent, UserId};

/// Why the server is closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection registered for the same user
    Superseded,
    /// Server shutting down
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Superseded => "superseded by a newer connection",
            Self::Shutdown => "server shutting down",
        }
    }
}

/// Receiving half handed to a connection task on [`Hub::attach`].
pub struct Subscription {
    pub events: mpsc::Receiver<Arc<ServerEvent>>,
    pub close: oneshot::Receiver<CloseReason>,
}

/// Statistics for monitoring delivery health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
    pub active_rooms: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

struct ConnectionSink {
    user: Option<UserId>,
    events: mpsc::Sender<Arc<ServerEvent>>,
    close: Option<oneshot::Sender<CloseReason>>,
}

pub struct Hub {
    connections: DashMap<ConnectionId, ConnectionSink>,
    rooms: DashMap<GroupId, HashSet<ConnectionId>>,
    /// Outbound queue capacity per connection
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            capacity: capacity.max(1),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a connection's outbound queue.
    pub fn attach(&self, conn: ConnectionId) -> Subscription {
        let (events_tx, events_rx) = mpsc::channel(self.capacity);
        let (close_tx, close_rx) = oneshot::channel();
        self.connections.insert(
            conn,
            ConnectionSink {
                user: None,
                events: events_tx,
                close: Some(close_tx),
            },
        );
        Subscription {
            events: events_rx,
            close: close_rx,
        }
    }

    /// Mark a connection as authenticated for `user`.
    pub fn bind_user(&self, conn: ConnectionId, user: UserId) {
        if let Some(mut sink) = self.connections.get_mut(&conn) {
            sink.user = Some(user);
        }
    }

    /// Remove a connection and its room subscriptions.
    pub fn detach(&self, conn: ConnectionId, rooms: impl IntoIterator<Item = GroupId>) {
        self.connections.remove(&conn);
        for room in rooms {
            self.leave_room(room, conn);
        }
    }

    pub fn is_attached(&self, conn: ConnectionId) -> bool {
        self.connections.contains_key(&conn)
    }

    /// Queue an event for one connection.
    pub fn send(&self, conn: ConnectionId, event: ServerEvent) -> Result<(), ChatError> {
        self.send_shared(conn, Arc::new(event))
    }

    pub fn send_shared(&self, conn: ConnectionId, event: Arc<ServerEvent>) -> Result<(), ChatError> {
        let result = match self.connections.get(&conn) {
            Some(sink) => sink.events.try_send(event).map_err(|e| {
                log::warn!("Dropping event for connection {conn}: {e}");
                ChatError::DeliveryFailure(conn)
            }),
            None => Err(ChatError::DeliveryFailure(conn)),
        };
        match result {
            Ok(()) => {
                self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Signal a connection task to close. Returns `false` if already signalled
    /// or gone.
    pub fn close(&self, conn: ConnectionId, reason: CloseReason) -> bool {
        let closer = self
            .connections
            .get_mut(&conn)
            .and_then(|mut sink| sink.close.take());
        match closer {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }

    /// Subscribe a connection to a group room. Returns `true` if newly added.
    pub fn join_room(&self, room: GroupId, conn: ConnectionId) -> bool {
        self.rooms.entry(room).or_default().insert(conn)
    }

    pub fn leave_room(&self, room: GroupId, conn: ConnectionId) -> bool {
        let removed = self
            .rooms
            .get_mut(&room)
            .is_some_and(|mut members| members.remove(&conn));
        self.rooms.remove_if(&room, |_, members| members.is_empty());
        removed
    }

    pub fn room_members(&self, room: GroupId) -> Vec<ConnectionId> {
        self.rooms
            .get(&room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, room: GroupId, conn: ConnectionId) -> bool {
        self.rooms
            .get(&room)
            .is_some_and(|members| members.contains(&conn))
    }

    /// Fan an event out to every connection subscribed to `room`.
    ///
    /// Returns the number of connections that accepted it.
    pub fn broadcast_room(
        &self,
        room: GroupId,
        event: ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let targets = self.room_members(room);
        self.fan_out(targets, event, except)
    }

    /// Fan an event out to every authenticated connection.
    pub fn broadcast_authenticated(&self, event: ServerEvent, except: Option<ConnectionId>) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().user.is_some())
            .map(|entry| *entry.key())
            .collect();
        self.fan_out(targets, event, except)
    }

    fn fan_out(
        &self,
        targets: Vec<ConnectionId>,
        event: ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        for conn in targets {
            if Some(conn) == except {
                continue;
            }
            match self.send_shared(conn, event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!("Broadcast of {} skipped a subscriber: {e}", event.name()),
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Delivery statistics (lock-free counters plus current sizes).
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.connections.len(),
            active_rooms: self.rooms.len(),
        }
    }
}
