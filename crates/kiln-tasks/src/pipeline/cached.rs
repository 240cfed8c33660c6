use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cache::CacheLoadError;

use super::{ExecutionContext, ExecutionError, ExecutionOutcome, ExecutionServices, ExecutionStage};

/// Loads outputs from the build cache, and stores freshly produced outputs
/// once execution succeeded. Cache I/O runs without the project lock.
pub struct SkipCachedStage;

#[async_trait]
impl ExecutionStage for SkipCachedStage {
    fn name(&self) -> &'static str {
        "skip-cached"
    }

    async fn attempt(
        &self,
        ctx: &mut ExecutionContext,
        services: &ExecutionServices,
    ) -> Result<Option<ExecutionOutcome>, ExecutionError> {
        if !ctx.caching.is_enabled() {
            return Ok(None);
        }
        let Some(key) = ctx.cache_key.clone() else {
            return Ok(None);
        };
        ctx.cache_consulted = true;

        let unit = ctx.unit.clone();
        let loaded = ctx
            .lease
            .without_lock(services.cache.load(&unit.id, &key, &ctx.resolved.outputs))
            .await;

        match loaded {
            Ok(Some(origin)) => {
                info!(unit = %unit.id, key = %key.digest().short(), "outputs loaded from build cache");
                ctx.output_fingerprints = ctx.fingerprint_outputs(&services.fingerprinter)?;
                ctx.origin = Some(origin);
                ctx.did_work = true;
                Ok(Some(ExecutionOutcome::FromCache))
            }
            Ok(None) => Ok(None),
            Err(CacheLoadError::Degraded { key, message }) => {
                warn!(unit = %unit.id, key = %key.digest().short(), %message, "failed to load cache entry, executing instead");
                Ok(None)
            }
            Err(CacheLoadError::Unrecoverable(e)) => Err(e.into()),
        }
    }

    async fn complete(
        &self,
        ctx: &mut ExecutionContext,
        services: &ExecutionServices,
    ) -> Result<(), ExecutionError> {
        if !ctx.cache_consulted
            || ctx.outcome != Some(ExecutionOutcome::Executed)
            || ctx.failure.is_some()
        {
            return Ok(());
        }
        let (Some(key), Some(origin)) = (ctx.cache_key.clone(), ctx.origin.clone()) else {
            return Ok(());
        };

        let unit = ctx.unit.clone();
        let stored = ctx
            .lease
            .without_lock(services.cache.store(
                &unit.id,
                &key,
                &ctx.resolved.outputs,
                &ctx.output_fingerprints,
                &origin,
            ))
            .await;
        match stored {
            Ok(()) => debug!(unit = %unit.id, key = %key.digest().short(), "stored outputs in build cache"),
            Err(e) => warn!(unit = %unit.id, error = %e, "failed to store cache entry"),
        }
        Ok(())
    }
}
