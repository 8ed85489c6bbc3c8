// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Confirming a mutation from its handler's response.
//!
//! A mutation handler talks to the backend and returns a JSON response. If
//! the response carries `txid` (one id or a list), the write is confirmed
//! once every listed txid reached the stream; otherwise it is considered
//! confirmed as soon as the handler returns.

use crate::collection::{AwaitOptions, ShapeCollection};
use crate::confirmation::Confirmation;
use crate::error::{ConfirmError, ConfirmResult};
use crate::event::{parse_txid, Txid};
use serde_json::Value;
use std::future::Future;
use thiserror::Error;

/// What a mutation waits for before it counts as confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MatchingStrategy {
    /// Nothing; the handler returning is enough.
    #[default]
    None,
    /// Every listed txid.
    Txids(Vec<Txid>),
}

impl MatchingStrategy {
    /// Read the strategy from a handler response.
    ///
    /// `{"txid": n}` and `{"txid": [n, ...]}` wait for those txids; any other
    /// shape waits for nothing. A present but non-numeric txid fails with
    /// [`ConfirmError::InvalidTxIdType`].
    pub fn from_response(response: &Value, collection_id: Option<&str>) -> ConfirmResult<Self> {
        let Some(txid) = response.as_object().and_then(|obj| obj.get("txid")) else {
            return Ok(Self::None);
        };
        let txids = match txid {
            Value::Array(items) => items
                .iter()
                .map(|item| parse_txid(item, collection_id))
                .collect::<ConfirmResult<Vec<_>>>()?,
            single => vec![parse_txid(single, collection_id)?],
        };
        Ok(Self::Txids(txids))
    }

    pub fn txids(&self) -> &[Txid] {
        match self {
            Self::None => &[],
            Self::Txids(txids) => txids,
        }
    }
}

/// Failure of [`ShapeCollection::confirm_mutation`].
#[derive(Debug, Error)]
pub enum MutationError<E> {
    /// The handler itself failed; nothing was awaited.
    #[error("mutation handler failed: {0}")]
    Handler(#[source] E),

    /// The handler succeeded but its write was not confirmed.
    #[error(transparent)]
    Confirm(#[from] ConfirmError),
}

impl ShapeCollection {
    /// Wait for every txid of `strategy`.
    ///
    /// All waits are registered before the first one is awaited, so they
    /// share one deadline. The first failure is returned and the remaining
    /// waits are dropped.
    pub async fn await_strategy(
        &self,
        strategy: &MatchingStrategy,
        options: AwaitOptions,
    ) -> ConfirmResult<Vec<Confirmation>> {
        let pending: Vec<_> = strategy
            .txids()
            .iter()
            .map(|txid| self.await_txid(*txid, options.clone()))
            .collect();

        let mut confirmations = Vec::with_capacity(pending.len());
        for wait in pending {
            confirmations.push(wait.await?);
        }
        Ok(confirmations)
    }

    /// Run a mutation handler and wait until its write is confirmed.
    pub async fn confirm_mutation<F, E>(
        &self,
        handler: F,
        options: AwaitOptions,
    ) -> Result<Value, MutationError<E>>
    where
        F: Future<Output = Result<Value, E>>,
    {
        let response = handler.await.map_err(MutationError::Handler)?;
        let strategy = MatchingStrategy::from_response(&response, self.id())
            .inspect_err(|e| self.record_rejected_txid(e))?;
        tracing::debug!(
            collection = self.id().unwrap_or("-"),
            txids = ?strategy.txids(),
            "mutation handler returned"
        );
        self.await_strategy(&strategy, options).await?;
        Ok(response)
    }
}
