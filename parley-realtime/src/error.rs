//! Error taxonomy for the realtime core.
//!
//! Lifecycle errors (authentication) terminate the connection, request
//! errors are answered with an `error` event on the originating connection
//! only. [`ChatError::is_fatal`] draws that line.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{ConnectionId, GroupId, UserId};
use crate::session::AuthorityError;
use crate::storage::StoreError;

/// Stable error codes sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    AuthTimeout,
    NotAuthenticated,
    InvalidTarget,
    NotAMember,
    DeliveryFailure,
    PersistenceFailure,
    InvalidPayload,
    Internal,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid, expired or missing session token")]
    Unauthenticated,

    #[error("No session token received within {0:?}")]
    AuthTimeout(Duration),

    #[error("Connection has not completed authentication")]
    NotAuthenticated,

    #[error("Exactly one of recipientId or groupId must be set")]
    InvalidTarget,

    #[error("User {user} is not a member of group {group}")]
    NotAMember { user: UserId, group: GroupId },

    #[error("Delivery to connection {0} failed")]
    DeliveryFailure(ConnectionId),

    #[error("Failed to persist message: {0}")]
    PersistenceFailure(#[source] StoreError),

    #[error("Session authority unavailable: {0}")]
    AuthorityUnavailable(#[from] AuthorityError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            // An unreachable authority with no cached session is a plain rejection.
            Self::Unauthenticated | Self::AuthorityUnavailable(_) => ErrorCode::Unauthenticated,
            Self::AuthTimeout(_) => ErrorCode::AuthTimeout,
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::InvalidTarget => ErrorCode::InvalidTarget,
            Self::NotAMember { .. } => ErrorCode::NotAMember,
            Self::DeliveryFailure(_) => ErrorCode::DeliveryFailure,
            Self::PersistenceFailure(_) => ErrorCode::PersistenceFailure,
            Self::Protocol(ProtocolError::Decode(_) | ProtocolError::UnexpectedFrame(_)) => {
                ErrorCode::InvalidPayload
            }
            Self::Store(_) | Self::Protocol(_) => ErrorCode::Internal,
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Unauthenticated | Self::AuthTimeout(_) | Self::AuthorityUnavailable(_) => true,
            Self::Protocol(err) => err.is_transport(),
            _ => false,
        }
    }
}

/// Wire and transport errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed event: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,
}

impl ProtocolError {
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_) | Self::ConnectionClosed | Self::Timeout
        )
    }
}
