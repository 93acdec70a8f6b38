//! In-process storage backend.
//!
//! [`MemoryStorage`] keeps records in a [`DashMap`] and hands out
//! monotonically increasing eTags. Nothing survives a restart, which makes it
//! the natural backend for tests and samples.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::storage::{Storage, StoreItem, StoreItems, check_e_tag};

/// Volatile [`Storage`] backed by a concurrent hash map.
///
/// Cheaply cloneable; clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    records: Arc<DashMap<String, StoreItem>>,
    next_e_tag: Arc<AtomicU64>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Return every stored key.
    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|e| e.key().clone()).collect()
    }

    fn issue_e_tag(&self) -> String {
        (self.next_e_tag.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, keys: &[String]) -> StoreResult<StoreItems> {
        let items: StoreItems = keys
            .iter()
            .filter_map(|key| {
                self.records
                    .get(key)
                    .map(|entry| (key.clone(), entry.value().clone()))
            })
            .collect();
        debug!(requested = keys.len(), found = items.len(), "memory storage read");
        Ok(items)
    }

    async fn write(&self, changes: StoreItems) -> StoreResult<()> {
        // Validate the whole batch before touching anything.
        for (key, item) in &changes {
            let current = self.records.get(key).and_then(|e| e.value().e_tag.clone());
            if let Err(err) = check_e_tag(key, item.e_tag.as_deref(), current.as_deref()) {
                warn!(key = %key, %err, "memory storage write rejected");
                return Err(err);
            }
        }

        let count = changes.len();
        for (key, mut item) in changes {
            item.e_tag = Some(self.issue_e_tag());
            self.records.insert(key, item);
        }
        debug!(count, "memory storage write");
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            self.records.remove(key);
        }
        debug!(count = keys.len(), "memory storage delete");
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────
