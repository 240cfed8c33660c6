//! Build cache: keys, bundles and the local/remote load and store protocol

pub mod bundle;
pub mod http;
pub mod key;
pub mod local;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::fingerprint::{EntryKind, FileCollectionFingerprint};
use crate::properties::ResolvedOutput;
use crate::unit::UnitId;

pub use http::HttpTransport;
pub use key::{CacheKey, CacheKeyBuilder};
pub use local::{format_size, CacheStats, LocalDirectoryTransport, PruneStats};
pub use transport::{CacheTransport, InMemoryTransport, TransportError};

/// Where and how a cached result was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    pub build_invocation_id: String,
    pub execution_time_ms: u64,
}

impl OriginMetadata {
    pub fn new(build_invocation_id: impl Into<String>, execution_time: Duration) -> Self {
        Self {
            build_invocation_id: build_invocation_id.into(),
            execution_time_ms: execution_time.as_millis() as u64,
        }
    }

    pub fn execution_time(&self) -> Duration {
        Duration::from_millis(self.execution_time_ms)
    }
}

/// Unpacking failed and the partially written outputs could not be removed
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to unpack cached outputs of {unit} ({key}) and could not remove them: {message}")]
pub struct UnrecoverableUnpackError {
    pub unit: UnitId,
    pub key: CacheKey,
    pub message: String,
}

/// Errors from loading cached outputs
#[derive(Debug, thiserror::Error)]
pub enum CacheLoadError {
    /// Treated as a cache miss
    #[error("could not load {key} from the build cache: {message}")]
    Degraded { key: CacheKey, message: String },

    /// Outputs may be corrupt; the build must stop
    #[error(transparent)]
    Unrecoverable(#[from] UnrecoverableUnpackError),
}

/// Storing outputs failed; never affects the unit's outcome
#[derive(Debug, thiserror::Error)]
#[error("could not store {key} in the build cache: {message}")]
pub struct CacheStoreError {
    pub key: CacheKey,
    pub message: String,
}

/// Local and remote cache transports behind one load/store protocol
#[derive(Clone, Default)]
pub struct BuildCache {
    local: Option<Arc<dyn CacheTransport>>,
    remote: Option<Arc<dyn CacheTransport>>,
    push: bool,
}

impl std::fmt::Debug for BuildCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCache")
            .field("local", &self.local.as_ref().map(|t| t.name().to_string()))
            .field("remote", &self.remote.as_ref().map(|t| t.name().to_string()))
            .field("push", &self.push)
            .finish()
    }
}

impl BuildCache {
    /// A cache with no transports; every load misses
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_local(mut self, transport: Arc<dyn CacheTransport>) -> Self {
        self.local = Some(transport);
        self
    }

    /// Add a remote transport; stores only go there when `push` is set
    pub fn with_remote(mut self, transport: Arc<dyn CacheTransport>, push: bool) -> Self {
        self.remote = Some(transport);
        self.push = push;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.local.is_some() || self.remote.is_some()
    }

    /// Load and unpack the bundle stored under `key` into `outputs`.
    ///
    /// Returns `Ok(None)` on a clean miss.
    #[instrument(skip_all, fields(unit = %unit, key = %key.digest().short()))]
    pub async fn load(
        &self,
        unit: &UnitId,
        key: &CacheKey,
        outputs: &[ResolvedOutput],
    ) -> Result<Option<OriginMetadata>, CacheLoadError> {
        let degraded = |message: String| CacheLoadError::Degraded {
            key: key.clone(),
            message,
        };

        let Some(bytes) = self.fetch(key).await.map_err(|e| degraded(e.to_string()))? else {
            debug!("cache miss");
            return Ok(None);
        };

        let bundle = bundle::read(&bytes).map_err(|e| degraded(e.to_string()))?;
        bundle
            .check_outputs(outputs)
            .map_err(|e| degraded(e.to_string()))?;

        match bundle.write_outputs(outputs) {
            Ok(files) => {
                info!(files, "loaded outputs from build cache");
                Ok(Some(bundle.metadata.origin))
            }
            Err(unpack_error) => {
                warn!(error = %unpack_error, "unpacking cached outputs failed, removing partial outputs");
                let cleanup: Result<(), std::io::Error> = outputs
                    .iter()
                    .filter_map(|o| o.location.path())
                    .try_for_each(bundle::remove_location);
                match cleanup {
                    Ok(()) => Err(degraded(format!(
                        "unpacking failed, partial outputs removed: {}",
                        unpack_error
                    ))),
                    Err(cleanup_error) => Err(UnrecoverableUnpackError {
                        unit: unit.clone(),
                        key: key.clone(),
                        message: format!("{}; cleanup failed: {}", unpack_error, cleanup_error),
                    }
                    .into()),
                }
            }
        }
    }

    async fn fetch(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, TransportError> {
        let mut local_error = None;
        if let Some(local) = &self.local {
            match local.load(key).await {
                Ok(Some(bytes)) => return Ok(Some(bytes)),
                Ok(None) => {}
                Err(e) => {
                    warn!(transport = local.name(), error = %e, "could not read from local cache");
                    local_error = Some(e);
                }
            }
        }
        let Some(remote) = &self.remote else {
            return match local_error {
                Some(e) => Err(e),
                None => Ok(None),
            };
        };
        let Some(bytes) = remote.load(key).await? else {
            return Ok(None);
        };
        debug!(size = bytes.len(), "remote cache hit");
        if let Some(local) = &self.local {
            if let Err(e) = local.store(key, &bytes).await {
                warn!(error = %e, "could not copy remote cache entry to local cache");
            }
        }
        Ok(Some(bytes))
    }

    /// Pack `outputs` and store the bundle under `key`
    #[instrument(skip_all, fields(unit = %unit, key = %key.digest().short()))]
    pub async fn store(
        &self,
        unit: &UnitId,
        key: &CacheKey,
        outputs: &[ResolvedOutput],
        fingerprints: &BTreeMap<String, FileCollectionFingerprint>,
        origin: &OriginMetadata,
    ) -> Result<(), CacheStoreError> {
        let push_remote = self.push && self.remote.is_some();
        if self.local.is_none() && !push_remote {
            return Ok(());
        }
        let failed = |message: String| CacheStoreError {
            key: key.clone(),
            message,
        };

        let bytes = bundle::pack(unit, outputs, origin).map_err(|e| failed(e.to_string()))?;
        let files: usize = fingerprints
            .values()
            .map(|fp| fp.entries.iter().filter(|e| e.kind == EntryKind::File).count())
            .sum();

        let mut targets: Vec<&Arc<dyn CacheTransport>> = Vec::new();
        targets.extend(self.local.as_ref());
        if self.push {
            targets.extend(self.remote.as_ref());
        }

        let mut errors = Vec::new();
        for transport in targets {
            match transport.store(key, &bytes).await {
                Ok(()) => {
                    info!(transport = transport.name(), files, size = bytes.len(), "stored outputs in build cache");
                }
                Err(e) => {
                    warn!(transport = transport.name(), error = %e, "could not store outputs in build cache");
                    errors.push(format!("{}: {}", transport.name(), e));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(failed(errors.join("; ")))
        }
    }
}
