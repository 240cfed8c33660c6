use super::*;
use crate::action::{WorkContext, WorkAction};
use crate::cache::InMemoryTransport;
use crate::reporter::CollectingReporter;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

struct CompileAction {
    runs: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl WorkAction for CompileAction {
    fn describe(&self) -> String {
        "compile".to_string()
    }

    async fn execute(&self, ctx: &WorkContext<'_>) -> Result<(), WorkError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(WorkError::Failed("compilation failed".to_string()));
        }
        let classes = ctx
            .resolved
            .output("classes")
            .and_then(|o| o.location.path())
            .ok_or_else(|| WorkError::Failed("no classes output".to_string()))?;
        fs::create_dir_all(classes).map_err(|e| WorkError::Failed(e.to_string()))?;
        for source in ctx.resolved.source_files.iter().flatten() {
            let stem = source.file_stem().unwrap_or_default().to_string_lossy();
            let content = fs::read(source).map_err(|e| WorkError::Failed(e.to_string()))?;
            fs::write(classes.join(format!("{}.class", stem)), content)
                .map_err(|e| WorkError::Failed(e.to_string()))?;
        }
        Ok(())
    }
}

struct Project {
    dir: TempDir,
    runs: Arc<AtomicUsize>,
}

impl Project {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/A.java"), "class A {}").unwrap();
        Self {
            dir,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    fn unit(&self, fail: bool) -> Arc<WorkUnit> {
        let action = Arc::new(CompileAction {
            runs: self.runs.clone(),
            fail,
        });
        let unit = WorkUnit::builder(UnitId::new("app", "compileJava"), action)
            .with_project_dir(self.dir.path())
            .with_source_files("sources", vec!["src".to_string()])
            .with_output_dir("classes", "build/classes")
            .build()
            .unwrap();
        Arc::new(unit)
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn services(&self, history: Arc<InMemoryExecutionHistory>) -> ExecutionServices {
        ExecutionServices::new(history)
            .with_registry(OutputRegistry::new(vec![self.path("build")]))
    }
}

fn cache_with(transport: &Arc<InMemoryTransport>) -> BuildCache {
    BuildCache::disabled().with_local(transport.clone())
}

#[test]
fn test_default_stage_order() {
    let pipeline = ExecutionPipeline::new(ExecutionServices::in_memory());
    assert_eq!(
        pipeline.stage_names(),
        vec![
            "resolve-properties",
            "load-history",
            "skip-empty-source",
            "snapshot-inputs",
            "skip-up-to-date",
            "skip-cached",
            "execute",
        ]
    );
}

#[tokio::test]
async fn test_no_source_without_history() {
    let project = Project::new();
    fs::remove_file(project.path("src/A.java")).unwrap();
    let pipeline = ExecutionPipeline::new(project.services(Arc::new(InMemoryExecutionHistory::new())));

    let result = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::NoSource);
    assert!(!result.did_work);
    assert!(result.failure.is_none());
    assert_eq!(project.runs(), 0);
}

#[tokio::test]
async fn test_no_source_cleans_previous_outputs() {
    let project = Project::new();
    let history = Arc::new(InMemoryExecutionHistory::new());
    let pipeline = ExecutionPipeline::new(project.services(history.clone()));

    let first = pipeline.execute(project.unit(false)).await.unwrap();
    assert_eq!(first.outcome, ExecutionOutcome::Executed);
    assert!(project.path("build/classes/A.class").exists());

    fs::remove_file(project.path("src/A.java")).unwrap();
    let second = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(second.outcome, ExecutionOutcome::NoSource);
    assert!(second.did_work);
    assert!(!project.path("build/classes").exists());
    assert!(history.load(&UnitId::new("app", "compileJava")).unwrap().is_none());
    assert_eq!(project.runs(), 1);
}

#[tokio::test]
async fn test_no_source_keeps_directories_with_foreign_content() {
    let project = Project::new();
    let pipeline = ExecutionPipeline::new(project.services(Arc::new(InMemoryExecutionHistory::new())));
    pipeline.execute(project.unit(false)).await.unwrap();

    fs::write(project.path("build/classes/Other.class"), "other").unwrap();
    fs::remove_file(project.path("src/A.java")).unwrap();
    let result = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::NoSource);
    assert!(result.did_work);
    assert!(!project.path("build/classes/A.class").exists());
    assert!(project.path("build/classes/Other.class").exists());
}

#[tokio::test]
async fn test_no_source_never_touches_unowned_paths() {
    let project = Project::new();
    let history = Arc::new(InMemoryExecutionHistory::new());
    // nothing in this project is inside the managed output area
    let services = ExecutionServices::new(history)
        .with_registry(OutputRegistry::new(vec![project.path("elsewhere")]));
    let pipeline = ExecutionPipeline::new(services);
    pipeline.execute(project.unit(false)).await.unwrap();

    fs::remove_file(project.path("src/A.java")).unwrap();
    let result = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::NoSource);
    assert!(!result.did_work);
    assert!(project.path("build/classes/A.class").exists());
}

#[tokio::test]
async fn test_no_source_never_follows_parent_steps_out_of_the_output_area() {
    let temp = TempDir::new().unwrap();
    let app = temp.path().join("app");
    fs::create_dir_all(app.join("src")).unwrap();
    fs::write(app.join("src/A.java"), "class A {}").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let unit = || {
        let action = Arc::new(CompileAction {
            runs: runs.clone(),
            fail: false,
        });
        Arc::new(
            WorkUnit::builder(UnitId::new("app", "compileJava"), action)
                .with_project_dir(&app)
                .with_source_files("sources", vec!["src".to_string()])
                .with_output_dir("classes", "../outside")
                .build()
                .unwrap(),
        )
    };
    let services = ExecutionServices::new(Arc::new(InMemoryExecutionHistory::new()))
        .with_registry(OutputRegistry::new(vec![app.clone()]));
    let pipeline = ExecutionPipeline::new(services);

    let first = pipeline.execute(unit()).await.unwrap();
    assert_eq!(first.outcome, ExecutionOutcome::Executed);
    assert!(temp.path().join("outside/A.class").exists());

    fs::remove_file(app.join("src/A.java")).unwrap();
    let second = pipeline.execute(unit()).await.unwrap();

    assert_eq!(second.outcome, ExecutionOutcome::NoSource);
    assert!(!second.did_work);
    assert!(temp.path().join("outside/A.class").exists());
}

#[tokio::test]
async fn test_cache_miss_executes_and_stores() {
    let project = Project::new();
    let transport = Arc::new(InMemoryTransport::new());
    let services = project
        .services(Arc::new(InMemoryExecutionHistory::new()))
        .with_cache(cache_with(&transport));
    let pipeline = ExecutionPipeline::new(services);

    let result = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Executed);
    assert!(result.did_work);
    let key = result.cache_key.clone().unwrap();
    assert_eq!(transport.keys(), vec![key.clone()]);
    assert_eq!(transport.load_count(), 1);
    assert!(result.origin.is_some());

    let stored = crate::cache::bundle::read(&transport.get(&key).unwrap()).unwrap();
    assert_eq!(stored.metadata.unit, UnitId::new("app", "compileJava"));
    assert_eq!(stored.metadata.outputs, vec!["classes".to_string()]);
    assert_eq!(Some(&stored.metadata.origin), result.origin.as_ref());

    let restored = TempDir::new().unwrap();
    let classes = restored.path().join("classes");
    let outputs = vec![crate::properties::ResolvedOutput {
        name: "classes".to_string(),
        location: crate::properties::OutputLocation::Directory(classes.clone()),
    }];
    stored.write_outputs(&outputs).unwrap();
    let mut files: Vec<_> = fs::read_dir(&classes)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files, vec!["A.class".to_string()]);
    assert_eq!(fs::read_to_string(classes.join("A.class")).unwrap(), "class A {}");
}

#[tokio::test]
async fn test_cache_store_failure_keeps_executed_outcome() {
    let project = Project::new();
    let transport = Arc::new(InMemoryTransport::new());
    transport.set_fail_stores(true);
    let history = Arc::new(InMemoryExecutionHistory::new());
    let services = project
        .services(history.clone())
        .with_cache(cache_with(&transport));
    let pipeline = ExecutionPipeline::new(services);

    let result = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Executed);
    assert!(result.failure.is_none());
    assert_eq!(transport.store_count(), 1);
    assert!(transport.keys().is_empty());
    let recorded = history.load(&UnitId::new("app", "compileJava")).unwrap();
    assert!(recorded.is_some());
}

#[tokio::test]
async fn test_cache_hit_skips_action() {
    let project = Project::new();
    let transport = Arc::new(InMemoryTransport::new());
    let producer = ExecutionPipeline::new(
        project
            .services(Arc::new(InMemoryExecutionHistory::new()))
            .with_cache(cache_with(&transport)),
    );
    let produced = producer.execute(project.unit(false)).await.unwrap();
    assert_eq!(produced.outcome, ExecutionOutcome::Executed);

    fs::remove_dir_all(project.path("build")).unwrap();
    let consumer = ExecutionPipeline::new(
        project
            .services(Arc::new(InMemoryExecutionHistory::new()))
            .with_cache(cache_with(&transport)),
    );
    let result = consumer.execute(project.unit(false)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::FromCache);
    assert!(result.did_work);
    assert_eq!(project.runs(), 1);
    assert_eq!(
        fs::read_to_string(project.path("build/classes/A.class")).unwrap(),
        "class A {}"
    );
    assert_eq!(result.origin, produced.origin);
    assert_eq!(transport.store_count(), 1);
}

#[tokio::test]
async fn test_failure_skips_store_and_keeps_history() {
    let project = Project::new();
    let history = Arc::new(InMemoryExecutionHistory::new());
    let transport = Arc::new(InMemoryTransport::new());
    let pipeline = ExecutionPipeline::new(
        project
            .services(history.clone())
            .with_cache(cache_with(&transport)),
    );
    pipeline.execute(project.unit(false)).await.unwrap();
    let id = UnitId::new("app", "compileJava");
    let recorded = history.load(&id).unwrap().unwrap();

    fs::write(project.path("src/A.java"), "class A { broken").unwrap();
    let result = pipeline.execute(project.unit(true)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Failed);
    assert!(matches!(result.failure, Some(ExecutionError::Work(_))));
    assert_eq!(transport.keys().len(), 1);
    assert_eq!(history.load(&id).unwrap().unwrap(), recorded);
}

#[tokio::test]
async fn test_degraded_cache_load_executes() {
    let project = Project::new();
    let transport = Arc::new(InMemoryTransport::new());
    transport.set_fail_loads(true);
    let pipeline = ExecutionPipeline::new(
        project
            .services(Arc::new(InMemoryExecutionHistory::new()))
            .with_cache(cache_with(&transport)),
    );

    let result = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Executed);
    assert!(result.failure.is_none());
    assert_eq!(project.runs(), 1);
}

#[tokio::test]
async fn test_compile_lifecycle() {
    let project = Project::new();
    let transport = Arc::new(InMemoryTransport::new());
    let reporter = Arc::new(CollectingReporter::default());
    let pipeline = ExecutionPipeline::new(
        project
            .services(Arc::new(InMemoryExecutionHistory::new()))
            .with_cache(cache_with(&transport))
            .with_reporter(reporter.clone()),
    );

    let first = pipeline.execute(project.unit(false)).await.unwrap();
    assert_eq!(first.outcome, ExecutionOutcome::Executed);

    let second = pipeline.execute(project.unit(false)).await.unwrap();
    assert_eq!(second.outcome, ExecutionOutcome::UpToDate);
    assert!(!second.did_work);
    assert_eq!(second.cache_key, first.cache_key);

    fs::remove_dir_all(project.path("build/classes")).unwrap();
    let third = pipeline.execute(project.unit(false)).await.unwrap();
    assert_eq!(third.outcome, ExecutionOutcome::FromCache);
    assert!(project.path("build/classes/A.class").exists());

    fs::remove_file(project.path("src/A.java")).unwrap();
    let fourth = pipeline.execute(project.unit(false)).await.unwrap();
    assert_eq!(fourth.outcome, ExecutionOutcome::NoSource);
    assert!(!project.path("build/classes").exists());

    assert_eq!(project.runs(), 1);
    let finished = reporter
        .events()
        .iter()
        .filter(|e| matches!(e, UnitEvent::Finished { .. }))
        .count();
    assert_eq!(finished, 4);
}

#[tokio::test]
async fn test_up_to_date_checks_can_be_disabled() {
    let project = Project::new();
    let pipeline = ExecutionPipeline::new(
        project
            .services(Arc::new(InMemoryExecutionHistory::new()))
            .with_up_to_date_checks(false),
    );

    pipeline.execute(project.unit(false)).await.unwrap();
    let second = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(second.outcome, ExecutionOutcome::Executed);
    assert_eq!(project.runs(), 2);
}

#[tokio::test]
async fn test_changed_source_reexecutes() {
    let project = Project::new();
    let pipeline = ExecutionPipeline::new(project.services(Arc::new(InMemoryExecutionHistory::new())));
    pipeline.execute(project.unit(false)).await.unwrap();

    fs::write(project.path("src/A.java"), "class A { int x; }").unwrap();
    let result = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Executed);
    assert_eq!(
        fs::read_to_string(project.path("build/classes/A.class")).unwrap(),
        "class A { int x; }"
    );
}

#[tokio::test]
async fn test_overlapping_outputs_disable_caching() {
    let project = Project::new();
    let transport = Arc::new(InMemoryTransport::new());
    fs::create_dir_all(project.path("build/classes")).unwrap();
    fs::write(project.path("build/classes/Stale.class"), "stale").unwrap();
    let pipeline = ExecutionPipeline::new(
        project
            .services(Arc::new(InMemoryExecutionHistory::new()))
            .with_cache(cache_with(&transport)),
    );

    let result = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Executed);
    assert_eq!(transport.load_count(), 0);
    assert!(transport.keys().is_empty());
}

#[tokio::test]
async fn test_missing_output_value_fails_unit() {
    let project = Project::new();
    let action = Arc::new(CompileAction {
        runs: project.runs.clone(),
        fail: false,
    });
    let unit = WorkUnit::builder(UnitId::new("app", "jar"), action)
        .with_project_dir(project.dir.path())
        .with_output(crate::unit::OutputProperty {
            name: "archive".to_string(),
            kind: crate::unit::OutputKind::File,
            location: PropertyValue::Missing,
            optional: false,
        })
        .build()
        .unwrap();
    let pipeline = ExecutionPipeline::new(project.services(Arc::new(InMemoryExecutionHistory::new())));

    let result = pipeline.execute(Arc::new(unit)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Failed);
    assert!(matches!(
        result.failure,
        Some(ExecutionError::PropertyResolution(_))
    ));
    assert_eq!(project.runs(), 0);
}

struct CorruptUnpackStage;

#[async_trait]
impl ExecutionStage for CorruptUnpackStage {
    fn name(&self) -> &'static str {
        "corrupt-unpack"
    }

    async fn attempt(
        &self,
        ctx: &mut ExecutionContext,
        _services: &ExecutionServices,
    ) -> Result<Option<ExecutionOutcome>, ExecutionError> {
        Err(UnrecoverableUnpackError {
            unit: ctx.unit.id.clone(),
            key: CacheKey::from(crate::hash::Digest::of(b"key")),
            message: "cleanup failed".to_string(),
        }
        .into())
    }
}

#[tokio::test]
async fn test_unrecoverable_unpack_aborts_build() {
    let project = Project::new();
    let reporter = Arc::new(CollectingReporter::default());
    let pipeline = ExecutionPipeline::with_stages(
        project
            .services(Arc::new(InMemoryExecutionHistory::new()))
            .with_reporter(reporter.clone()),
        vec![Box::new(ResolvePropertiesStage), Box::new(CorruptUnpackStage)],
    );

    let abort = pipeline.execute(project.unit(false)).await.unwrap_err();

    assert_eq!(abort.unit, UnitId::new("app", "compileJava"));
    assert!(reporter
        .events()
        .iter()
        .any(|e| matches!(e, UnitEvent::Failed { .. })));
}

#[tokio::test]
async fn test_no_outcome_is_failure() {
    let project = Project::new();
    let pipeline = ExecutionPipeline::with_stages(
        project.services(Arc::new(InMemoryExecutionHistory::new())),
        vec![Box::new(ResolvePropertiesStage)],
    );

    let result = pipeline.execute(project.unit(false)).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Failed);
    assert!(matches!(result.failure, Some(ExecutionError::NoOutcome)));
}

#[tokio::test]
async fn test_declare_outputs_claims_fixed_locations() {
    let project = Project::new();
    let pipeline = ExecutionPipeline::new(project.services(Arc::new(InMemoryExecutionHistory::new())));

    pipeline.declare_outputs(&[project.unit(false)]).await.unwrap();

    let claims = pipeline.services().registry.claims();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].path, project.path("build/classes"));
}
