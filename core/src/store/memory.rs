//! In-process store for tests and the console connector

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::{satisfies, ETag, StateStore, StoreError, Versioned, Write};
use crate::state::StateKey;

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: Mutex<HashMap<StateKey, Versioned>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, keys: &[StateKey]) -> Result<Vec<Option<Versioned>>, StoreError> {
        let records = self.records.lock().await;
        Ok(keys.iter().map(|k| records.get(k).cloned()).collect())
    }

    async fn save(&self, writes: Vec<Write>) -> Result<Vec<ETag>, StoreError> {
        let mut records = self.records.lock().await;

        // Check everything before touching anything
        for write in &writes {
            let current = records.get(&write.key).map(|r| &r.etag);
            if !satisfies(current, write.precondition) {
                debug!(key = %write.key, "Conditional write rejected");
                return Err(StoreError::Conflict {
                    key: write.key.clone(),
                });
            }
        }

        let now = Utc::now();
        let mut etags = Vec::with_capacity(writes.len());
        for write in writes {
            let etag = ETag::new();
            records.insert(
                write.key,
                Versioned {
                    data: write.data,
                    etag,
                    updated_at: now,
                },
            );
            etags.push(etag);
        }
        Ok(etags)
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.remove(key).is_some())
    }
}
