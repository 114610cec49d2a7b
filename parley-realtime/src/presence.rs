//! Presence registry: who is online, and on which connection.
//!
//! Holds the bijection `user ↔ connection`. One live connection per user:
//! registering a second connection replaces the first and hands its id back
//! so the caller can close it.
//!
//! ```text
//! register(alice, c2)
//!       │  entry(alice) locked
//!       ▼
//! by_user[alice] = c2   ──► returns Some(c1)  (caller closes c1)
//! by_connection: -c1 +c2
//!
//! unregister(c1)        ──► by_user[alice] still c2 → untouched,
//!                           reports "still online"
//! ```
//!
//! Both indices are `DashMap`s; the per-user entry guard serialises
//! concurrent registrations for the same user.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::protocol::{ConnectionId, UserId, UserSummary};

/// An authenticated user acting through one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub username: String,
    pub connection_id: ConnectionId,
}

impl Participant {
    pub fn new(user_id: UserId, username: impl Into<String>, connection_id: ConnectionId) -> Self {
        Self {
            user_id,
            username: username.into(),
            connection_id,
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            user_id: self.user_id,
            username: self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub username: String,
    pub online_since: DateTime<Utc>,
}

/// Result of [`PresenceRegistry::unregister`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// The connection was the user's live one; the user is now offline.
    WentOffline(UserSummary),
    /// The connection had already been replaced; the user stays online.
    Superseded(UserId),
    /// Unknown connection (never registered or already removed).
    Unknown,
}

#[derive(Default)]
pub struct PresenceRegistry {
    by_user: DashMap<UserId, PresenceEntry>,
    by_connection: DashMap<ConnectionId, UserId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn` the live connection of `user`.
    ///
    /// Returns the evicted previous connection, if any.
    pub fn register(
        &self,
        user: UserId,
        username: impl Into<String>,
        conn: ConnectionId,
    ) -> Option<ConnectionId> {
        let entry = PresenceEntry {
            connection_id: conn,
            username: username.into(),
            online_since: Utc::now(),
        };

        // The reverse index is updated while the user's entry guard is held.
        let evicted = match self.by_user.entry(user) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(entry).connection_id;
                if previous != conn {
                    self.by_connection.remove(&previous);
                }
                self.by_connection.insert(conn, user);
                Some(previous).filter(|previous| *previous != conn)
            }
            Entry::Vacant(vacant) => {
                let _guard = vacant.insert(entry);
                self.by_connection.insert(conn, user);
                None
            }
        };

        if let Some(previous) = evicted {
            log::info!("User {user} re-registered on {conn}, evicting {previous}");
        }
        evicted
    }

    /// Remove `conn`. The user mapping is only dropped if it still points at
    /// `conn`, so a late teardown cannot knock out a newer connection.
    pub fn unregister(&self, conn: ConnectionId) -> Departure {
        let Some((_, user)) = self.by_connection.remove(&conn) else {
            return Departure::Unknown;
        };
        match self
            .by_user
            .remove_if(&user, |_, entry| entry.connection_id == conn)
        {
            Some((user_id, entry)) => Departure::WentOffline(UserSummary {
                user_id,
                username: entry.username,
            }),
            None => Departure::Superseded(user),
        }
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.by_user.contains_key(&user)
    }

    pub fn connection_of(&self, user: UserId) -> Option<ConnectionId> {
        self.by_user.get(&user).map(|entry| entry.connection_id)
    }

    pub fn user_of(&self, conn: ConnectionId) -> Option<UserId> {
        self.by_connection.get(&conn).map(|user| *user)
    }

    pub fn entry(&self, user: UserId) -> Option<PresenceEntry> {
        self.by_user.get(&user).map(|entry| entry.clone())
    }

    pub fn list_online(&self) -> Vec<UserSummary> {
        self.by_user
            .iter()
            .map(|entry| UserSummary {
                user_id: *entry.key(),
                username: entry.value().username.clone(),
            })
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.by_user.len()
    }
}
