// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Replication stream events as seen by the confirmation engine.
//!
//! The stream client (out of scope here) parses shape log entries and turns
//! each one into an [`IncomingEvent`] before handing it to
//! `ShapeCollection::notify_incoming_event`.

use crate::error::{ConfirmError, ConfirmResult};
use crate::snapshot::PgSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-assigned transaction id (Postgres `xid8`).
pub type Txid = u64;

/// Row operation carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// What a stream entry represents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A row change.
    Change { operation: Operation },
    /// End of an initial snapshot, with its visibility boundary.
    SnapshotEnd { snapshot: PgSnapshot },
    /// The client has caught up with the server log.
    UpToDate,
    /// The server asked the client to drop its state and refetch.
    MustRefetch,
}

/// One entry of the replication stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEvent {
    /// Collection the event is addressed to. `None` means "whichever
    /// collection it is handed to".
    #[serde(default)]
    pub collection_id: Option<String>,
    /// Transactions whose effects this entry carries.
    #[serde(default)]
    pub txids: Vec<Txid>,
    pub kind: EventKind,
    /// Row value or control payload, opaque to the engine.
    #[serde(default)]
    pub payload: Value,
}

impl IncomingEvent {
    /// A row change with the given payload and no txids.
    pub fn change(operation: Operation, payload: Value) -> Self {
        Self {
            collection_id: None,
            txids: Vec::new(),
            kind: EventKind::Change { operation },
            payload,
        }
    }

    pub fn insert(payload: Value) -> Self {
        Self::change(Operation::Insert, payload)
    }

    pub fn up_to_date() -> Self {
        Self::control(EventKind::UpToDate)
    }

    pub fn must_refetch() -> Self {
        Self::control(EventKind::MustRefetch)
    }

    pub fn snapshot_end(snapshot: PgSnapshot) -> Self {
        Self::control(EventKind::SnapshotEnd { snapshot })
    }

    fn control(kind: EventKind) -> Self {
        Self {
            collection_id: None,
            txids: Vec::new(),
            kind,
            payload: Value::Null,
        }
    }

    /// Attach a txid (builder style).
    #[must_use]
    pub fn with_txid(mut self, txid: Txid) -> Self {
        self.txids.push(txid);
        self
    }

    /// Address the event to a collection (builder style).
    #[must_use]
    pub fn for_collection(mut self, id: impl Into<String>) -> Self {
        self.collection_id = Some(id.into());
        self
    }

    pub fn carries_txid(&self, txid: Txid) -> bool {
        self.txids.contains(&txid)
    }

    pub fn is_change(&self) -> bool {
        matches!(self.kind, EventKind::Change { .. })
    }

    pub fn is_up_to_date(&self) -> bool {
        matches!(self.kind, EventKind::UpToDate)
    }

    pub fn operation(&self) -> Option<Operation> {
        match self.kind {
            EventKind::Change { operation } => Some(operation),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Option<&PgSnapshot> {
        match &self.kind {
            EventKind::SnapshotEnd { snapshot } => Some(snapshot),
            _ => None,
        }
    }
}

/// Extract a txid from a dynamically typed value.
///
/// Anything other than a non-negative integer fails with
/// [`ConfirmError::InvalidTxIdType`] naming what was received.
pub fn parse_txid(value: &Value, collection_id: Option<&str>) -> ConfirmResult<Txid> {
    if let Some(txid) = value.as_u64() {
        return Ok(txid);
    }
    Err(ConfirmError::InvalidTxIdType {
        received: value_type_name(value).to_string(),
        collection_id: collection_id.map(str::to_string),
    })
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() => "negative number",
        Value::Number(_) => "non-integer number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_txid_accepts_integers() {
        assert_eq!(parse_txid(&json!(42), None), Ok(42));
        assert_eq!(parse_txid(&json!(0), Some("c")), Ok(0));
    }

    #[test]
    fn test_parse_txid_names_received_type() {
        let err = parse_txid(&json!("123"), Some("test")).expect_err("string");
        assert_eq!(
            err,
            ConfirmError::InvalidTxIdType {
                received: "string".into(),
                collection_id: Some("test".into()),
            }
        );

        let cases = [
            (json!(null), "null"),
            (json!(true), "boolean"),
            (json!(-3), "negative number"),
            (json!(1.5), "non-integer number"),
            (json!([1]), "array"),
            (json!({"txid": 1}), "object"),
        ];
        for (value, expected) in cases {
            match parse_txid(&value, None) {
                Err(ConfirmError::InvalidTxIdType { received, .. }) => {
                    assert_eq!(received, expected)
                }
                other => panic!("unexpected {:?} for {}", other, value),
            }
        }
    }

    #[test]
    fn test_event_builders() {
        let ev = IncomingEvent::insert(json!({"id": 1}))
            .with_txid(7)
            .with_txid(8)
            .for_collection("todos");
        assert!(ev.carries_txid(7));
        assert!(ev.carries_txid(8));
        assert!(!ev.carries_txid(9));
        assert_eq!(ev.operation(), Some(Operation::Insert));
        assert_eq!(ev.collection_id.as_deref(), Some("todos"));
        assert!(ev.is_change());

        let ctl = IncomingEvent::up_to_date();
        assert!(ctl.is_up_to_date());
        assert_eq!(ctl.operation(), None);
    }

    #[test]
    fn test_event_deserializes_from_json() {
        let ev: IncomingEvent = serde_json::from_value(json!({
            "txids": [5],
            "kind": {"type": "change", "operation": "update"},
            "payload": {"id": 2}
        }))
        .expect("deserialize");
        assert_eq!(ev.operation(), Some(Operation::Update));
        assert!(ev.carries_txid(5));

        let ev: IncomingEvent = serde_json::from_value(json!({
            "kind": {"type": "snapshot_end", "snapshot": {"xmin": 1, "xmax": 4, "xip_list": [2]}}
        }))
        .expect("deserialize");
        assert_eq!(ev.snapshot(), Some(&PgSnapshot::new(1, 4, vec![2])));
    }
}
