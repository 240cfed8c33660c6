//! Local directory cache transport

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{debug, info};

use super::transport::{CacheTransport, TransportError};
use super::CacheKey;

const BUNDLE_EXTENSION: &str = "bundle";

/// Stores one bundle file per key in a directory
#[derive(Debug, Clone)]
pub struct LocalDirectoryTransport {
    dir: PathBuf,
}

impl LocalDirectoryTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, BUNDLE_EXTENSION))
    }

    fn bundles(&self) -> Result<Vec<(PathBuf, fs::Metadata)>, TransportError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut bundles = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == BUNDLE_EXTENSION) {
                bundles.push((path, entry.metadata()?));
            }
        }
        Ok(bundles)
    }

    /// Remove entries not written within `max_age`
    pub fn prune(&self, max_age: Duration) -> Result<PruneStats, TransportError> {
        info!(max_age_secs = max_age.as_secs(), dir = %self.dir.display(), "pruning cache");
        let mut stats = PruneStats::default();
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for (path, metadata) in self.bundles()? {
            stats.total += 1;
            let expired = metadata.modified().map(|m| m < cutoff).unwrap_or(false);
            if expired && fs::remove_file(&path).is_ok() {
                stats.removed += 1;
                stats.freed_bytes += metadata.len();
            } else {
                stats.kept += 1;
            }
        }

        info!(total = stats.total, removed = stats.removed, kept = stats.kept, "cache prune complete");
        Ok(stats)
    }

    /// Entry count and total size
    pub fn status(&self) -> Result<CacheStats, TransportError> {
        let mut stats = CacheStats::default();
        for (_, metadata) in self.bundles()? {
            stats.entries += 1;
            stats.total_size += metadata.len();
        }
        Ok(stats)
    }

    /// Remove the whole cache directory
    pub fn clean(&self) -> Result<CacheStats, TransportError> {
        let stats = self.status()?;
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        info!(entries = stats.entries, dir = %self.dir.display(), "cache cleaned");
        Ok(stats)
    }
}

#[async_trait]
impl CacheTransport for LocalDirectoryTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, TransportError> {
        let path = self.entry_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!(key = %key.as_str(), size = bytes.len(), "local cache hit");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = %key.as_str(), "local cache miss");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), TransportError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.entry_path(key);
        let tmp = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(key = %key.as_str(), size = bytes.len(), "stored bundle in local cache");
        Ok(())
    }
}

/// Statistics from a prune operation
#[derive(Debug, Default)]
pub struct PruneStats {
    /// Total entries found
    pub total: usize,
    /// Entries removed
    pub removed: usize,
    /// Entries kept
    pub kept: usize,
    /// Bytes freed by removed entries
    pub freed_bytes: u64,
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache entries
    pub entries: usize,
    /// Total size in bytes
    pub total_size: u64,
}

impl CacheStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        format_size(self.total_size)
    }
}

/// Format a byte count in human-readable form
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
