use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::key::scalar_input_digests;
use crate::cache::CacheKeyBuilder;
use crate::state::{BeforeExecutionState, CachingState};

use super::{ExecutionContext, ExecutionError, ExecutionOutcome, ExecutionServices, ExecutionStage};

/// Fingerprints inputs, derives the cache key and decides whether caching
/// applies to this attempt
pub struct SnapshotInputsStage;

#[async_trait]
impl ExecutionStage for SnapshotInputsStage {
    fn name(&self) -> &'static str {
        "snapshot-inputs"
    }

    async fn attempt(
        &self,
        ctx: &mut ExecutionContext,
        services: &ExecutionServices,
    ) -> Result<Option<ExecutionOutcome>, ExecutionError> {
        let mut input_files = BTreeMap::new();
        for input in &ctx.resolved.input_files {
            let fingerprint = services
                .fingerprinter
                .fingerprint(&input.roots, input.normalization)?;
            input_files.insert(input.name.clone(), fingerprint);
        }

        let key = CacheKeyBuilder::build(&ctx.unit, &ctx.resolved, &input_files);
        debug!(key = %key.digest().short(), "cache key computed");

        ctx.state.set_current(BeforeExecutionState {
            implementation: ctx.unit.implementation.digest(),
            scalar_inputs: scalar_input_digests(&ctx.resolved),
            input_files,
            outputs: ctx.outputs_before.clone(),
        });
        ctx.cache_key = Some(key);

        ctx.caching = ctx.state.caching_state(
            services.cache.is_enabled(),
            &ctx.unit.caching,
            &ctx.resolved,
        );
        if let CachingState::Disabled(reasons) = &ctx.caching {
            for reason in reasons {
                debug!(%reason, "caching disabled");
            }
        }
        Ok(None)
    }
}
