use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::cache::OriginMetadata;
use crate::history::PreviousExecutionState;
use crate::state::{detect_overlapping_outputs, ArtifactStateTracker};

use super::{ExecutionContext, ExecutionError, ExecutionOutcome, ExecutionServices, ExecutionStage};

/// Checks out the unit's previous execution state and snapshots its outputs
/// before anything touches them. On completion, records the new state.
pub struct LoadHistoryStage;

#[async_trait]
impl ExecutionStage for LoadHistoryStage {
    fn name(&self) -> &'static str {
        "load-history"
    }

    async fn attempt(
        &self,
        ctx: &mut ExecutionContext,
        services: &ExecutionServices,
    ) -> Result<Option<ExecutionOutcome>, ExecutionError> {
        let id = ctx.unit.id.clone();
        ctx.checkout = Some(services.checkouts.checkout(&id)?);

        let previous = match services.history.load(&id) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(unit = %id, error = %e, "could not read execution history, treating unit as never executed");
                None
            }
        };
        debug!(has_history = previous.is_some(), "execution history loaded");

        ctx.outputs_before = ctx.fingerprint_outputs(&services.fingerprinter)?;
        let overlap = detect_overlapping_outputs(
            &id,
            &ctx.resolved,
            &services.registry,
            previous.as_ref(),
            &ctx.outputs_before,
        );
        if let Some(overlap) = &overlap {
            debug!(%overlap, "overlapping outputs detected");
        }

        ctx.state = ArtifactStateTracker::new(previous);
        ctx.state.set_overlapping_outputs(overlap);
        Ok(None)
    }

    async fn complete(
        &self,
        ctx: &mut ExecutionContext,
        services: &ExecutionServices,
    ) -> Result<(), ExecutionError> {
        let id = ctx.unit.id.clone();
        if !ctx.succeeded() {
            debug!(unit = %id, "attempt failed, keeping previous execution state");
            return Ok(());
        }

        match ctx.outcome {
            Some(ExecutionOutcome::NoSource) => {
                if ctx.state.previous().is_some() && services.history.remove(&id)? {
                    debug!(unit = %id, "removed execution history of unit without source");
                }
            }
            Some(outcome @ (ExecutionOutcome::Executed
            | ExecutionOutcome::FromCache
            | ExecutionOutcome::UpToDate)) => {
                let Some(current) = ctx.state.current() else {
                    return Ok(());
                };
                if ctx.output_fingerprints.is_empty() && !ctx.resolved.outputs.is_empty() {
                    ctx.output_fingerprints = ctx.fingerprint_outputs(&services.fingerprinter)?;
                }
                let origin = match (outcome, ctx.state.previous(), &ctx.origin) {
                    (_, _, Some(origin)) => origin.clone(),
                    (ExecutionOutcome::UpToDate, Some(previous), None) => previous.origin.clone(),
                    _ => OriginMetadata::new(services.build_id.clone(), ctx.execution_time),
                };
                let record = PreviousExecutionState {
                    unit: id.clone(),
                    implementation: current.implementation.clone(),
                    scalar_inputs: current.scalar_inputs.clone(),
                    input_files: current.input_files.clone(),
                    output_files: ctx.output_fingerprints.clone(),
                    cache_key: ctx.cache_key.clone(),
                    origin,
                    recorded_at: Utc::now(),
                };
                services.history.store(&record)?;
                debug!(unit = %id, %outcome, "recorded execution state");
            }
            _ => {}
        }
        ctx.checkout = None;
        Ok(())
    }
}
