//! The `error` module defines the error types used within `sessionbus`.
//!
//! `StoreError` covers failures reported by a store backend. `BusError` is
//! what every bus operation returns; it wraps store failures and adds the
//! protocol and precondition errors owned by the bus itself.

use crate::bus::SubscriptionMode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),

    #[error("no script registered under {0}")]
    NoScript(String),

    #[error("script failed: {0}")]
    Script(String),

    #[error("store rejected command: {0}")]
    Rejected(String),

    #[error("connection is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed payload: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("invalid envelope: {0}")]
    Envelope(String),

    #[error("message name is {len} bytes, limit is {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("bus instance is subscribed and cannot issue commands")]
    Subscribed,

    #[error("bus instance is already subscribed in {mode} mode")]
    AlreadySubscribed { mode: SubscriptionMode },

    #[error("claim script has not been loaded; call enable_claims first")]
    ClaimScriptNotLoaded,

    #[error("unexpected reply to {op}: {reply}")]
    UnexpectedReply { op: &'static str, reply: String },
}

impl BusError {
    /// Programmer errors: the call was invalid for the instance's state and
    /// never reached the store.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BusError::Subscribed | BusError::AlreadySubscribed { .. } | BusError::ClaimScriptNotLoaded
        )
    }
}
