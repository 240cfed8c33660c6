use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::action::WorkContext;
use crate::cache::OriginMetadata;

use super::{ExecutionContext, ExecutionError, ExecutionOutcome, ExecutionServices, ExecutionStage};

/// Runs the unit's action
pub struct ExecuteStage;

#[async_trait]
impl ExecutionStage for ExecuteStage {
    fn name(&self) -> &'static str {
        "execute"
    }

    async fn attempt(
        &self,
        ctx: &mut ExecutionContext,
        services: &ExecutionServices,
    ) -> Result<Option<ExecutionOutcome>, ExecutionError> {
        let unit = ctx.unit.clone();
        let work = WorkContext {
            unit: &unit.id,
            project_dir: &unit.project_dir,
            resolved: &ctx.resolved,
            reporter: services.reporter.as_ref(),
        };

        let start = Instant::now();
        let result = unit.action.execute(&work).await;
        ctx.execution_time = start.elapsed();
        ctx.did_work = true;
        result?;
        debug!(elapsed_ms = ctx.execution_time.as_millis() as u64, "action finished");

        ctx.output_fingerprints = ctx.fingerprint_outputs(&services.fingerprinter)?;
        ctx.origin = Some(OriginMetadata::new(services.build_id.clone(), ctx.execution_time));
        Ok(Some(ExecutionOutcome::Executed))
    }
}
