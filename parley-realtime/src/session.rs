//! Session validation: opaque token → user identity.
//!
//! ```text
//! validate(token)
//!       │  sha256(token)
//!       ▼
//! local cache ──hit──► refresh last activity ──► Identity
//!       │ miss / expired
//!       ▼
//! SessionAuthority::validate()   (bounded by authority_timeout)
//!       │ Some(identity)             │ None / error / timeout
//!       ▼                            ▼
//! cache for min(ttl, expiry)     reject (fail closed)
//! ```
//!
//! Raw tokens are never kept; the cache is keyed by their SHA-256 digest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::protocol::{UserId, UserSummary};

/// The identity behind a valid session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    /// Session expiry as reported by the authority (None = no fixed expiry)
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            user_id: self.user_id,
            username: self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum AuthorityError {
    #[error("Authority unreachable: {0}")]
    Unreachable(String),

    #[error("Authority did not answer within {0:?}")]
    Timeout(Duration),
}

/// External source of truth for sessions (the SSO provider).
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    /// Returns `Ok(None)` for unknown, revoked or expired tokens.
    async fn validate(&self, token: &str) -> Result<Option<Identity>, AuthorityError>;
}

#[derive(Debug, Clone)]
struct CachedSession {
    identity: Identity,
    expires_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// Token validator with a local, hash-keyed session cache.
pub struct SessionValidator {
    authority: Arc<dyn SessionAuthority>,
    cache: DashMap<String, CachedSession>,
    cache_ttl: Duration,
    authority_timeout: Duration,
}

impl SessionValidator {
    pub fn new(
        authority: Arc<dyn SessionAuthority>,
        cache_ttl: Duration,
        authority_timeout: Duration,
    ) -> Self {
        Self {
            authority,
            cache: DashMap::new(),
            cache_ttl,
            authority_timeout,
        }
    }

    pub fn from_config(authority: Arc<dyn SessionAuthority>, config: &ServerConfig) -> Self {
        Self::new(authority, config.session_cache_ttl, config.authority_timeout)
    }

    /// One-way digest used as the cache key.
    pub fn hash_token(token: &str) -> String {
        format!("{:x}", Sha256::digest(token.as_bytes()))
    }

    /// Resolve a token to an identity, or fail closed.
    pub async fn validate(&self, token: &str) -> Result<Identity, ChatError> {
        if token.is_empty() {
            return Err(ChatError::Unauthenticated);
        }

        let key = Self::hash_token(token);
        let now = Utc::now();
        if let Some(identity) = self.cached(&key, now) {
            log::trace!("Session cache hit for user {}", identity.user_id);
            return Ok(identity);
        }

        let answer = tokio::time::timeout(self.authority_timeout, self.authority.validate(token))
            .await
            .map_err(|_| AuthorityError::Timeout(self.authority_timeout))
            .and_then(|result| result);

        let identity = match answer {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                self.cache.remove(&key);
                return Err(ChatError::Unauthenticated);
            }
            Err(e) => {
                log::warn!("Session authority failed and no cached session exists: {e}");
                return Err(ChatError::AuthorityUnavailable(e));
            }
        };

        if identity.expires_at.is_some_and(|expiry| expiry <= now) {
            return Err(ChatError::Unauthenticated);
        }

        let ttl_expiry = chrono::Duration::from_std(self.cache_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let expires_at = identity
            .expires_at
            .map_or(ttl_expiry, |expiry| expiry.min(ttl_expiry));

        self.cache.insert(
            key,
            CachedSession {
                identity: identity.clone(),
                expires_at,
                last_activity: now,
            },
        );
        log::debug!("Cached session for user {} until {expires_at}", identity.user_id);
        Ok(identity)
    }

    fn cached(&self, key: &str, now: DateTime<Utc>) -> Option<Identity> {
        let mut entry = self.cache.get_mut(key)?;
        if entry.expires_at <= now {
            drop(entry);
            self.cache.remove_if(key, |_, session| session.expires_at <= now);
            return None;
        }
        entry.last_activity = now;
        Some(entry.identity.clone())
    }

    /// Drop the cached session for `token` (explicit logout).
    pub fn invalidate(&self, token: &str) -> bool {
        self.invalidate_key(&Self::hash_token(token))
    }

    /// Same as [`invalidate`](Self::invalidate), keyed by an already hashed token.
    pub fn invalidate_key(&self, key: &str) -> bool {
        self.cache.remove(key).is_some()
    }

    /// Remove every expired cache entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.cache.len();
        self.cache.retain(|_, session| session.expires_at > now);
        before.saturating_sub(self.cache.len())
    }

    /// Last time a cached session for `token` was used.
    pub fn last_activity(&self, token: &str) -> Option<DateTime<Utc>> {
        self.cache
            .get(&Self::hash_token(token))
            .map(|session| session.last_activity)
    }

    pub fn cached_sessions(&self) -> usize {
        self.cache.len()
    }
}

/// Development session seed: `{"token", "userId", "username", "expiresAt"?}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSeed {
    pub token: String,
    #[serde(flatten)]
    pub identity: Identity,
}

/// In-memory session authority for development and tests.
///
/// Can be switched offline to simulate an authority outage.
#[derive(Default)]
pub struct StaticAuthority {
    sessions: DashMap<String, Identity>,
    offline: AtomicBool,
}

impl StaticAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load sessions from a JSON array of [`SessionSeed`]s.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let seeds: Vec<SessionSeed> = serde_json::from_str(json)?;
        let authority = Self::new();
        for seed in seeds {
            authority.insert(seed.token, seed.identity);
        }
        Ok(authority)
    }

    pub fn insert(&self, token: impl Into<String>, identity: Identity) {
        self.sessions.insert(token.into(), identity);
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionAuthority for StaticAuthority {
    async fn validate(&self, token: &str) -> Result<Option<Identity>, AuthorityError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuthorityError::Unreachable("authority offline".into()));
        }
        Ok(self.sessions.get(token).map(|identity| identity.clone()))
    }
}
