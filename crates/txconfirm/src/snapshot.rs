// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Postgres snapshot visibility.

use crate::event::Txid;
use serde::{Deserialize, Serialize};

/// Snapshot boundary reported by a `snapshot-end` control event.
///
/// Every transaction below `xmin` had committed when the snapshot was taken;
/// none at or above `xmax` had. In between, the ones listed in `xip_list` were
/// still in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgSnapshot {
    pub xmin: Txid,
    pub xmax: Txid,
    #[serde(default)]
    pub xip_list: Vec<Txid>,
}

impl PgSnapshot {
    pub fn new(xmin: Txid, xmax: Txid, xip_list: Vec<Txid>) -> Self {
        Self {
            xmin,
            xmax,
            xip_list,
        }
    }

    /// Whether the effects of `txid` are contained in this snapshot.
    #[must_use]
    pub fn is_visible(&self, txid: Txid) -> bool {
        if txid < self.xmin {
            return true;
        }
        txid < self.xmax && !self.xip_list.contains(&txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_xmin_is_visible() {
        let snap = PgSnapshot::new(100, 110, vec![100, 104]);
        assert!(snap.is_visible(1));
        assert!(snap.is_visible(99));
    }

    #[test]
    fn test_in_progress_is_not_visible() {
        let snap = PgSnapshot::new(100, 110, vec![100, 104]);
        assert!(!snap.is_visible(100));
        assert!(!snap.is_visible(104));
        assert!(snap.is_visible(101));
        assert!(snap.is_visible(109));
    }

    #[test]
    fn test_at_or_above_xmax_is_not_visible() {
        let snap = PgSnapshot::new(100, 110, Vec::new());
        assert!(!snap.is_visible(110));
        assert!(!snap.is_visible(5000));
    }

    #[test]
    fn test_deserialize_without_xip_list() {
        let snap: PgSnapshot =
            serde_json::from_str(r#"{"xmin": 3, "xmax": 9}"#).expect("deserialize");
        assert_eq!(snap, PgSnapshot::new(3, 9, Vec::new()));
    }
}
