/*!
 * # Recovery Storage
 *
 * Checkout-recovery records survive the round trip to the external payment
 * page in a key/value store with two redundant areas: a primary Redis area
 * and a secondary in-process area. Writes try the primary first and fall
 * back to the secondary silently; reads prefer the primary. The data is a
 * self-expiring cache, not a source of truth, so last-write-wins semantics
 * are acceptable.
 */

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Storage backend errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage area unavailable: {0}")]
    Unavailable(String),
}

/// Which redundant storage area a write landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    Primary,
    Secondary,
}

/// Minimal capability set for a recovery storage area: read, write, remove,
/// plus a key scan used by forced cleanup.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    async fn contains(&self, key: &str) -> Result<bool, StoreError>;
    /// Keys whose name contains the given fragment.
    async fn keys_containing(&self, fragment: &str) -> Result<Vec<String>, StoreError>;
}

/// In-process storage area backed by a concurrent map.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.contains_key(key))
    }

    async fn keys_containing(&self, fragment: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().contains(fragment))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

/// Redis-backed storage area. Keys are namespaced and written with a TTL so
/// state abandoned mid-checkout ages out on its own.
pub struct RedisStore {
    client: Arc<redis::Client>,
    namespace: String,
    ttl_secs: usize,
}

impl RedisStore {
    pub fn new(client: Arc<redis::Client>, namespace: String, ttl_secs: u64) -> Self {
        Self {
            client,
            namespace,
            ttl_secs: ttl_secs as usize,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl RecoveryStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        conn.get::<_, Option<String>>(self.full_key(key))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(self.full_key(key), value, self.ttl_secs)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.full_key(key))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        conn.exists::<_, bool>(self.full_key(key))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn keys_containing(&self, fragment: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:*{}*", self.namespace, fragment);
        let keys: Vec<String> = conn
            .keys(pattern)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let prefix = format!("{}:", self.namespace);
        Ok(keys
            .into_iter()
            .map(|k| k.strip_prefix(&prefix).map(str::to_string).unwrap_or(k))
            .collect())
    }
}

/// Composite over two storage areas. The primary is tried first; a failed
/// write falls back to the secondary and reports where the record landed.
pub struct RedundantStore {
    primary: Arc<dyn RecoveryStore>,
    secondary: Arc<dyn RecoveryStore>,
}

impl RedundantStore {
    pub fn new(primary: Arc<dyn RecoveryStore>, secondary: Arc<dyn RecoveryStore>) -> Self {
        Self { primary, secondary }
    }

    /// Read-through: primary preferred, secondary consulted when the primary
    /// errors or holds nothing.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.primary.get(key).await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {}
            Err(e) => debug!(key, error = %e, "primary storage read failed"),
        }
        match self.secondary.get(key).await {
            Ok(value) => value,
            Err(e) => {
                debug!(key, error = %e, "secondary storage read failed");
                None
            }
        }
    }

    /// Per-area read, primary first. For readers that can judge a record's
    /// validity themselves: a corrupt record in one area must not mask a
    /// usable record in the other.
    pub async fn get_all(&self, key: &str) -> Vec<String> {
        let mut values = Vec::new();
        match self.primary.get(key).await {
            Ok(Some(value)) => values.push(value),
            Ok(None) => {}
            Err(e) => debug!(key, error = %e, "primary storage read failed"),
        }
        match self.secondary.get(key).await {
            Ok(Some(value)) => {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            Ok(None) => {}
            Err(e) => debug!(key, error = %e, "secondary storage read failed"),
        }
        values
    }

    /// Write to the primary area, falling back to the secondary on error.
    /// Reports which area the record landed in.
    pub async fn put_recording(&self, key: &str, value: &str) -> Result<StorageArea, StoreError> {
        match self.primary.put(key, value).await {
            Ok(()) => Ok(StorageArea::Primary),
            Err(e) => {
                warn!(key, error = %e, "primary storage write failed, using secondary");
                self.secondary.put(key, value).await?;
                Ok(StorageArea::Secondary)
            }
        }
    }

    /// Write the record to both areas. Succeeds if at least one write lands.
    pub async fn put_both(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let primary = self.primary.put(key, value).await;
        let secondary = self.secondary.put(key, value).await;
        match (primary, secondary) {
            (Err(p), Err(s)) => {
                warn!(key, primary = %p, secondary = %s, "both storage areas rejected write");
                Err(s)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => {
                debug!(key, error = %e, "one storage area rejected write");
                Ok(())
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Best-effort removal from both areas. Removing an absent key is not an
    /// error, so cleanup stays idempotent.
    pub async fn remove(&self, key: &str) {
        if let Err(e) = self.primary.remove(key).await {
            debug!(key, error = %e, "primary storage remove failed");
        }
        if let Err(e) = self.secondary.remove(key).await {
            debug!(key, error = %e, "secondary storage remove failed");
        }
    }

    /// Existence check across both areas.
    pub async fn contains(&self, key: &str) -> bool {
        match self.primary.contains(key).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => debug!(key, error = %e, "primary storage contains failed"),
        }
        self.secondary.contains(key).await.unwrap_or(false)
    }

    /// Union of matching keys across both areas.
    pub async fn keys_containing(&self, fragment: &str) -> Vec<String> {
        let mut keys = self.primary.keys_containing(fragment).await.unwrap_or_default();
        for key in self
            .secondary
            .keys_containing(fragment)
            .await
            .unwrap_or_default()
        {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Storage area that rejects every operation, standing in for an
    /// unavailable backend.
    struct BrokenStore;

    #[async_trait]
    impl RecoveryStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("broken".into()))
        }
        async fn put(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("broken".into()))
        }
        async fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("broken".into()))
        }
        async fn contains(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("broken".into()))
        }
        async fn keys_containing(&self, _fragment: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("broken".into()))
        }
    }

    fn memory_pair() -> (Arc<MemoryStore>, Arc<MemoryStore>, RedundantStore) {
        let primary = Arc::new(MemoryStore::new());
        let secondary = Arc::new(MemoryStore::new());
        let store = RedundantStore::new(primary.clone(), secondary.clone());
        (primary, secondary, store)
    }

    #[tokio::test]
    async fn write_lands_in_primary_when_available() {
        let (primary, secondary, store) = memory_pair();
        let area = store.put_recording("k", "v").await.unwrap();
        assert_eq!(area, StorageArea::Primary);
        assert_eq!(primary.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(secondary.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_falls_back_to_secondary_on_primary_failure() {
        let secondary = Arc::new(MemoryStore::new());
        let store = RedundantStore::new(Arc::new(BrokenStore), secondary.clone());
        let area = store.put_recording("k", "v").await.unwrap();
        assert_eq!(area, StorageArea::Secondary);
        assert_eq!(secondary.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn put_both_writes_both_areas() {
        let (primary, secondary, store) = memory_pair();
        store.put_both("k", "v").await.unwrap();
        assert_eq!(primary.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(secondary.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn put_both_tolerates_one_broken_area() {
        let secondary = Arc::new(MemoryStore::new());
        let store = RedundantStore::new(Arc::new(BrokenStore), secondary.clone());
        store.put_both("k", "v").await.unwrap();
        assert!(store.contains("k").await);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_, _, store) = memory_pair();
        store.put_both("k", "v").await.unwrap();
        store.remove("k").await;
        store.remove("k").await;
        assert!(!store.contains("k").await);
    }

    #[tokio::test]
    async fn get_all_yields_distinct_values_primary_first() {
        let (primary, secondary, store) = memory_pair();
        primary.put("k", "from-primary").await.unwrap();
        secondary.put("k", "from-secondary").await.unwrap();
        assert_eq!(store.get_all("k").await, vec!["from-primary", "from-secondary"]);

        secondary.put("k", "from-primary").await.unwrap();
        assert_eq!(store.get_all("k").await, vec!["from-primary"]);
    }

    #[tokio::test]
    async fn keys_containing_unions_both_areas() {
        let (primary, secondary, store) = memory_pair();
        primary.put("checkout:1:paypal_legacy", "a").await.unwrap();
        secondary.put("checkout:2:paypal_legacy", "b").await.unwrap();
        secondary.put("checkout:1:paypal_legacy", "a").await.unwrap();
        let mut keys = store.keys_containing("paypal").await;
        keys.sort();
        assert_eq!(
            keys,
            vec!["checkout:1:paypal_legacy", "checkout:2:paypal_legacy"]
        );
    }
}
