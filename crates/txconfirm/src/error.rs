// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for confirmation operations.
//!
//! [`ConfirmError`] is the closed set of outcomes a caller of
//! `await_txid`/`await_match` can observe besides success. Predicate failures
//! never reach callers; they are reported as [`PredicateError`] on the
//! collection's diagnostic channel.

use crate::event::Txid;
use std::fmt;
use thiserror::Error;

/// Result type for confirmation operations
pub type ConfirmResult<T> = Result<T, ConfirmError>;

/// Errors a pending confirmation can complete with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfirmError {
    /// The txid handed to the dynamically typed entry point was not a number.
    #[error("{}Expected number in awaitTxId, received {received}", prefix(.collection_id))]
    InvalidTxIdType {
        received: String,
        collection_id: Option<String>,
    },

    /// No event carrying the txid arrived before the deadline.
    #[error("{}Timeout waiting for txId: {txid}", prefix(.collection_id))]
    TimeoutTxId {
        txid: Txid,
        collection_id: Option<String>,
    },

    /// No event satisfied the custom predicate before the deadline.
    #[error("{}Timeout waiting for custom match function", prefix(.collection_id))]
    TimeoutMatch { collection_id: Option<String> },

    /// The caller's signal (or the collection's stream) was aborted first.
    #[error("{}Stream aborted", prefix(.collection_id))]
    Aborted { collection_id: Option<String> },
}

fn prefix(collection_id: &Option<String>) -> String {
    match collection_id {
        Some(id) => format!("[{}] ", id),
        None => String::new(),
    }
}

/// Coarse classification of a [`ConfirmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller passed invalid input; nothing was registered.
    Precondition,
    /// The system gave up waiting on the caller's behalf.
    Timeout,
    /// The caller (or stream owner) gave up.
    Cancellation,
}

impl ConfirmError {
    /// Stable error name, matching the names used by other clients of the
    /// same sync protocol.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidTxIdType { .. } => "ExpectedNumberInAwaitTxIdError",
            Self::TimeoutTxId { .. } => "TimeoutWaitingForTxIdError",
            Self::TimeoutMatch { .. } => "TimeoutWaitingForMatchError",
            Self::Aborted { .. } => "StreamAbortedError",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTxIdType { .. } => ErrorKind::Precondition,
            Self::TimeoutTxId { .. } | Self::TimeoutMatch { .. } => ErrorKind::Timeout,
            Self::Aborted { .. } => ErrorKind::Cancellation,
        }
    }

    /// Collection the failed request was issued against, if it has an id.
    pub fn collection_id(&self) -> Option<&str> {
        match self {
            Self::InvalidTxIdType { collection_id, .. }
            | Self::TimeoutTxId { collection_id, .. }
            | Self::TimeoutMatch { collection_id }
            | Self::Aborted { collection_id } => collection_id.as_deref(),
        }
    }

    /// The awaited txid, only present on txid timeouts.
    pub fn txid(&self) -> Option<Txid> {
        match self {
            Self::TimeoutTxId { txid, .. } => Some(*txid),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub fn is_aborted(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }
}

/// A custom match function failed while being evaluated.
///
/// Treated as "no match" for the event being dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("match function {cause}: {message}")]
pub struct PredicateError {
    pub cause: PredicateFailure,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateFailure {
    /// The predicate returned an error.
    Errored,
    /// The predicate panicked.
    Panicked,
}

impl fmt::Display for PredicateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Errored => write!(f, "returned an error"),
            Self::Panicked => write!(f, "panicked"),
        }
    }
}

impl PredicateError {
    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            cause: PredicateFailure::Errored,
            message: message.into(),
        }
    }

    /// Build from a `catch_unwind` payload.
    pub fn panicked(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            cause: PredicateFailure::Panicked,
            message,
        }
    }
}
