use async_trait::async_trait;
use tracing::info;

use super::{ExecutionContext, ExecutionError, ExecutionOutcome, ExecutionServices, ExecutionStage};

const MAX_REPORTED_CHANGES: usize = 3;

/// Skips units whose implementation, inputs and outputs all match the
/// previous execution
pub struct SkipUpToDateStage;

#[async_trait]
impl ExecutionStage for SkipUpToDateStage {
    fn name(&self) -> &'static str {
        "skip-up-to-date"
    }

    async fn attempt(
        &self,
        ctx: &mut ExecutionContext,
        services: &ExecutionServices,
    ) -> Result<Option<ExecutionOutcome>, ExecutionError> {
        if !(services.up_to_date_checks && ctx.unit.up_to_date_checks) {
            return Ok(None);
        }

        if !ctx.state.has_any_change() {
            info!(unit = %ctx.unit.id, "skipping unit as it is up-to-date");
            ctx.output_fingerprints = ctx.outputs_before.clone();
            return Ok(Some(ExecutionOutcome::UpToDate));
        }

        let changes = ctx.state.changes();
        info!(unit = %ctx.unit.id, changes = changes.len(), "unit is not up-to-date");
        for change in changes.iter().take(MAX_REPORTED_CHANGES) {
            info!(unit = %ctx.unit.id, "  {}", change);
        }
        Ok(None)
    }
}
