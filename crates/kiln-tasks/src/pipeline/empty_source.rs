use std::fs;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::fingerprint::EntryKind;

use super::{ExecutionContext, ExecutionError, ExecutionOutcome, ExecutionServices, ExecutionStage};

/// Skips units whose source properties resolved to no files, deleting
/// outputs left over from their previous execution
pub struct SkipEmptySourceStage;

#[async_trait]
impl ExecutionStage for SkipEmptySourceStage {
    fn name(&self) -> &'static str {
        "skip-empty-source"
    }

    async fn attempt(
        &self,
        ctx: &mut ExecutionContext,
        services: &ExecutionServices,
    ) -> Result<Option<ExecutionOutcome>, ExecutionError> {
        if !ctx.resolved.source_files_empty() {
            return Ok(None);
        }
        let id = &ctx.unit.id;

        let Some(previous_outputs) = ctx.state.previous_outputs() else {
            info!(unit = %id, "skipping unit as it has no source files and no previous output files");
            return Ok(Some(ExecutionOutcome::NoSource));
        };

        let cleanup_directories = ctx.state.overlapping_outputs().is_none();
        if !cleanup_directories {
            info!(unit = %id, "no leftover directories will be deleted since overlapping outputs were detected");
        }

        let mut deleted = false;
        for fingerprint in previous_outputs.values() {
            for (path, kind) in fingerprint.existing_paths() {
                if !path.exists() || !services.registry.is_owned_by_build(path) {
                    continue;
                }
                if kind == EntryKind::Directory && !cleanup_directories {
                    continue;
                }
                debug!(path = %path.display(), "deleting stale output");
                force_delete(path).map_err(|e| ExecutionError::cleanup(path, e))?;
                deleted = true;
            }
        }

        if deleted {
            info!(unit = %id, "cleaned previous output of unit as it has no source files");
            ctx.did_work = true;
        }
        Ok(Some(ExecutionOutcome::NoSource))
    }
}

fn force_delete(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
