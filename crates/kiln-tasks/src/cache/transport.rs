//! Byte-level cache transports

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::CacheKey;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache network error: {0}")]
    Network(String),

    #[error("cache server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("{0}")]
    Other(String),
}

/// Moves opaque bundle bytes to and from a cache, keyed by digest
#[async_trait]
pub trait CacheTransport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Fetch the bytes stored under `key`; `None` is a clean miss
    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, TransportError>;

    /// Store bytes under `key`, replacing any existing entry
    async fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Transport holding bundles in memory, with call counters
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    entries: Mutex<HashMap<CacheKey, Vec<u8>>>,
    loads: AtomicUsize,
    stores: AtomicUsize,
    fail_loads: AtomicBool,
    fail_stores: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: CacheKey, bytes: Vec<u8>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, bytes);
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    /// Make subsequent loads fail
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent stores fail
    pub fn set_fail_stores(&self, fail: bool) {
        self.fail_stores.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheTransport for InMemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, TransportError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(TransportError::Other("injected load failure".to_string()));
        }
        Ok(self.get(key))
    }

    async fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), TransportError> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(TransportError::Other("injected store failure".to_string()));
        }
        self.insert(key.clone(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Digest;

    #[tokio::test]
    async fn test_in_memory_counts_calls() {
        let transport = InMemoryTransport::new();
        let key = CacheKey::from(Digest::of(b"k"));

        assert_eq!(transport.load(&key).await.unwrap(), None);
        transport.store(&key, b"bytes").await.unwrap();
        assert_eq!(transport.load(&key).await.unwrap(), Some(b"bytes".to_vec()));
        assert_eq!(transport.load_count(), 2);
        assert_eq!(transport.store_count(), 1);

        transport.set_fail_loads(true);
        assert!(transport.load(&key).await.is_err());
        transport.set_fail_stores(true);
        assert!(transport.store(&key, b"other").await.is_err());
        assert_eq!(transport.get(&key), Some(b"bytes".to_vec()));
    }
}
