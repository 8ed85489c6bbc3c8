// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Collection configuration.
//!
//! Supports both programmatic and file-based configuration.

use crate::registry::ConfirmOn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration of one synced collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Collection id, used to route events and prefix error messages.
    #[serde(default)]
    pub id: Option<String>,

    /// Default `await_txid` deadline (milliseconds, 0 = no deadline).
    #[serde(default = "default_await_txid_timeout_ms")]
    pub await_txid_timeout_ms: u64,

    /// Default `await_match` deadline (milliseconds, 0 = no deadline).
    #[serde(default = "default_await_match_timeout_ms")]
    pub await_match_timeout_ms: u64,

    /// When a matching event confirms a wait.
    #[serde(default)]
    pub confirm_on: ConfirmOn,

    /// Change events kept for late `await_match` callers (0 disables).
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,

    /// Txids remembered for late `await_txid` callers.
    #[serde(default = "default_seen_txid_capacity")]
    pub seen_txid_capacity: usize,

    /// Snapshots remembered for late `await_txid` callers.
    #[serde(default = "default_seen_snapshot_capacity")]
    pub seen_snapshot_capacity: usize,

    /// Buffered predicate failure reports per subscriber.
    #[serde(default = "default_diagnostics_capacity")]
    pub diagnostics_capacity: usize,
}

fn default_await_txid_timeout_ms() -> u64 {
    5000
}

fn default_await_match_timeout_ms() -> u64 {
    3000
}

fn default_max_batch_events() -> usize {
    1000
}

fn default_seen_txid_capacity() -> usize {
    10_000
}

fn default_seen_snapshot_capacity() -> usize {
    64
}

fn default_diagnostics_capacity() -> usize {
    64
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            id: None,
            await_txid_timeout_ms: default_await_txid_timeout_ms(),
            await_match_timeout_ms: default_await_match_timeout_ms(),
            confirm_on: ConfirmOn::default(),
            max_batch_events: default_max_batch_events(),
            seen_txid_capacity: default_seen_txid_capacity(),
            seen_snapshot_capacity: default_seen_snapshot_capacity(),
            diagnostics_capacity: default_diagnostics_capacity(),
        }
    }
}

impl CollectionConfig {
    /// Default configuration for a named collection.
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("Collection id is empty".into()));
            }
        }
        if self.seen_txid_capacity == 0 {
            return Err(ConfigError::Invalid(
                "seen_txid_capacity must be at least 1".into(),
            ));
        }
        if self.seen_snapshot_capacity == 0 {
            return Err(ConfigError::Invalid(
                "seen_snapshot_capacity must be at least 1".into(),
            ));
        }
        if self.diagnostics_capacity == 0 {
            return Err(ConfigError::Invalid(
                "diagnostics_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Default `await_txid` deadline; `None` waits indefinitely.
    pub fn txid_timeout(&self) -> Option<Duration> {
        millis(self.await_txid_timeout_ms)
    }

    /// Default `await_match` deadline; `None` waits indefinitely.
    pub fn match_timeout(&self) -> Option<Duration> {
        millis(self.await_match_timeout_ms)
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
