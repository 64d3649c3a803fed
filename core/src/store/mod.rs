//! Persistence adapter
//!
//! Records are opaque JSON documents addressed by `StateKey`. Every write
//! gets a fresh `ETag`; a write conditioned on a stale tag is rejected with
//! `StoreError::Conflict` and never retried here, since the turn that lost
//! may already have produced side effects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::state::StateKey;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStateStore;
pub use postgres::PgStateStore;

/// Opaque consistency token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(Uuid);

impl ETag {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ETag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored record with the token needed to overwrite it
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub data: JsonValue,
    pub etag: ETag,
    pub updated_at: DateTime<Utc>,
}

/// Condition a write must satisfy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional overwrite
    Any,
    /// The record must not exist yet
    Absent,
    /// The record must still carry this tag
    Matches(ETag),
}

impl Precondition {
    /// The condition that protects a record seen at load time
    pub fn from_loaded(loaded: Option<&Versioned>) -> Self {
        match loaded {
            Some(record) => Precondition::Matches(record.etag),
            None => Precondition::Absent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub key: StateKey,
    pub data: JsonValue,
    pub precondition: Precondition,
}

impl Write {
    pub fn new(key: StateKey, data: JsonValue, precondition: Precondition) -> Self {
        Self {
            key,
            data,
            precondition,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict on {key}: record changed since it was loaded")]
    Conflict { key: StateKey },

    #[error("storage backend failure: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Storage collaborator for conversation state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load records, one result per key in the same order
    async fn load(&self, keys: &[StateKey]) -> Result<Vec<Option<Versioned>>, StoreError>;

    /// Apply all writes or none of them
    ///
    /// Returns the new tag of each written record, in order.
    async fn save(&self, writes: Vec<Write>) -> Result<Vec<ETag>, StoreError>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, key: &StateKey) -> Result<bool, StoreError>;
}

/// Whether a record in its current state satisfies `precondition`
pub(crate) fn satisfies(current: Option<&ETag>, precondition: Precondition) -> bool {
    match (precondition, current) {
        (Precondition::Any, _) => true,
        (Precondition::Absent, None) => true,
        (Precondition::Absent, Some(_)) => false,
        (Precondition::Matches(expected), Some(actual)) => expected == *actual,
        (Precondition::Matches(_), None) => false,
    }
}
