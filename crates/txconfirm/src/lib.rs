// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Optimistic-write confirmation for synced collections
//!
//! A local-first collection applies writes optimistically, sends them to the
//! backend, and gets a server transaction id (txid) back. The write is only
//! durable once that txid shows up in the replication stream. This crate
//! tracks those pending confirmations per collection.
//!
//! # Features
//!
//! - **Txid waits**: `await_txid` resolves when an event carrying the txid,
//!   or a snapshot making it visible, is dispatched
//! - **Custom matching**: `await_match` resolves on the first event a
//!   predicate accepts; failing predicates are isolated and reported
//! - **Deadlines and cancellation**: per-call timeouts on an injectable
//!   clock, caller abort signals, and stream shutdown
//! - **Late callers**: seen txids, snapshots and recent batches confirm
//!   waits registered after their event
//!
//! # Quick Start
//!
//! ```no_run
//! use serde_json::json;
//! use txconfirm::{AwaitOptions, CollectionConfig, IncomingEvent, ShapeCollection};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let todos = ShapeCollection::new(CollectionConfig::named("todos"))?;
//! let pending = todos.await_txid(42, AwaitOptions::new());
//!
//! // Fed by the replication client.
//! todos.notify_incoming_event(IncomingEvent::insert(json!({"id": 1})).with_txid(42));
//!
//! pending.await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! id = "todos"
//! await_txid_timeout_ms = 5000
//! await_match_timeout_ms = 3000
//! confirm_on = "up_to_date"
//! max_batch_events = 1000
//! ```

pub mod abort;
pub mod collection;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod event;
pub mod matcher;
pub mod registry;
pub mod snapshot;
pub mod stats;
pub mod strategy;
pub mod timer;

pub use abort::{AbortBridge, AbortController, AbortSignal};
pub use collection::{AwaitOptions, Deadline, ShapeCollection, ShapeCollectionBuilder};
pub use config::{CollectionConfig, ConfigError};
pub use confirmation::{Confirmation, PendingConfirmation, WaitOutcome};
pub use error::{ConfirmError, ConfirmResult, ErrorKind, PredicateError, PredicateFailure};
pub use event::{parse_txid, EventKind, IncomingEvent, Operation, Txid};
pub use matcher::{MatchReason, Predicate, WaitMatcher};
pub use registry::{ConfirmOn, DispatchReport, PredicateDiagnostic, TransactionWaitRegistry, WaitHandle};
pub use snapshot::PgSnapshot;
pub use stats::{ConfirmationStats, ConfirmationStatsSnapshot};
pub use strategy::{MatchingStrategy, MutationError};
pub use timer::{Clock, ManualClock, TimeoutController, TokioClock};
