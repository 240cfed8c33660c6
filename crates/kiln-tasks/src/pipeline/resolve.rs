use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionContext, ExecutionError, ExecutionOutcome, ExecutionServices, ExecutionStage};

/// Resolves declared properties and claims the resolved output locations
pub struct ResolvePropertiesStage;

#[async_trait]
impl ExecutionStage for ResolvePropertiesStage {
    fn name(&self) -> &'static str {
        "resolve-properties"
    }

    async fn attempt(
        &self,
        ctx: &mut ExecutionContext,
        services: &ExecutionServices,
    ) -> Result<Option<ExecutionOutcome>, ExecutionError> {
        ctx.resolved = services.resolver.resolve(&ctx.unit)?;

        let permit = ctx.lease.permit()?;
        let paths = ctx.resolved.output_paths().map(|p| p.to_path_buf());
        services.registry.declare(&permit, &ctx.unit.id, paths);

        debug!(outputs = ctx.resolved.outputs.len(), "properties resolved");
        Ok(None)
    }
}
