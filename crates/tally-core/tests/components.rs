//! Pluggable components wired through the registry: reporters, stores,
//! broadcasters, processors and custom middleware.

use async_trait::async_trait;
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_core::cache::ResponseCache;
use tally_core::config::EvalConfig;
use tally_core::dataset::InMemoryDataset;
use tally_core::engine::{Engine, MetricCall, Middleware, Next};
use tally_core::errors::{RegistryError, ScoringError};
use tally_core::metrics_api::{Metric, MetricContext, MetricRef};
use tally_core::model::{Sample, SampleResult};
use tally_core::plugins::{
    BroadcastEvent, ChannelBroadcaster, JsonFileStore, MemoryStore, Processor, Reporter,
    RunContext,
};
use tally_core::registry::{self, Component, ComponentKind, ComponentRegistry};
use tally_core::result::EvalResult;

const WAIT: Duration = Duration::from_secs(10);

struct Half;

#[async_trait]
impl Metric for Half {
    fn name(&self) -> &str {
        "half"
    }

    async fn evaluate(&self, _s: &Sample, _c: &MetricContext) -> Result<f64, ScoringError> {
        Ok(0.5)
    }
}

#[derive(Default)]
struct CollectingReporter {
    samples: Mutex<Vec<String>>,
    summaries: Mutex<usize>,
}

impl Reporter for CollectingReporter {
    fn name(&self) -> &str {
        "collecting"
    }

    fn handle_sample(&self, result: &SampleResult, _ctx: &RunContext) -> anyhow::Result<()> {
        self.samples.lock().unwrap().push(result.sample_id.clone());
        Ok(())
    }

    fn handle_summary(&self, _result: &EvalResult, _ctx: &RunContext) -> anyhow::Result<()> {
        *self.summaries.lock().unwrap() += 1;
        Ok(())
    }
}

struct FailingReporter;

impl Reporter for FailingReporter {
    fn name(&self) -> &str {
        "failing"
    }

    fn handle_sample(&self, _r: &SampleResult, _c: &RunContext) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
}

/// Tags the run in pre-processing and stamps the result in post-processing.
struct Stamp;

impl Processor for Stamp {
    fn name(&self) -> &str {
        "stamp"
    }

    fn pre_process(&self, ctx: &mut RunContext) -> anyhow::Result<()> {
        ctx.metadata
            .insert("suite".into(), serde_json::json!("nightly"));
        Ok(())
    }

    fn post_process(&self, result: &mut EvalResult, _ctx: &RunContext) -> anyhow::Result<()> {
        result
            .metadata
            .insert("stamped".into(), serde_json::json!(true));
        Ok(())
    }
}

/// Doubles every score on the way out.
struct Doubler;

#[async_trait]
impl Middleware for Doubler {
    fn name(&self) -> &str {
        "doubler"
    }

    async fn call(&self, call: &MetricCall<'_>, next: Next<'_>) -> Result<f64, ScoringError> {
        next.run(call).await.map(|s| s * 2.0)
    }
}

fn dataset(n: usize) -> Arc<InMemoryDataset> {
    Arc::new(InMemoryDataset::new(
        (0..n)
            .map(|i| Sample::new(format!("s{}", i)).with_tag("split", if i % 2 == 0 { "a" } else { "b" }))
            .collect(),
    ))
}

fn isolated(registry: Arc<ComponentRegistry>) -> Engine {
    Engine::builder()
        .registry(registry)
        .cache(Arc::new(ResponseCache::new()))
        .build()
}

#[tokio::test]
async fn test_components_run_in_configured_order() {
    let registry = Arc::new(ComponentRegistry::new());
    let reporter = Arc::new(CollectingReporter::default());
    let store = MemoryStore::new();
    let broadcaster = ChannelBroadcaster::new("events", 64);
    let mut events = broadcaster.subscribe();

    registry
        .register(ComponentKind::Reporter, Component::Reporter(reporter.clone()))
        .unwrap();
    registry
        .register(ComponentKind::Reporter, Component::Reporter(Arc::new(FailingReporter)))
        .unwrap();
    registry
        .register(ComponentKind::Store, Component::Store(Arc::new(store.clone())))
        .unwrap();
    registry
        .register(ComponentKind::Broadcaster, Component::Broadcaster(Arc::new(broadcaster)))
        .unwrap();
    registry
        .register(ComponentKind::Processor, Component::Processor(Arc::new(Stamp)))
        .unwrap();

    let mut cfg = EvalConfig::default();
    cfg.reporters = vec!["failing".into(), "collecting".into()];
    cfg.stores = vec!["memory".into()];
    cfg.broadcasters = vec!["events".into()];
    cfg.processors = vec!["stamp".into()];

    let engine = isolated(registry);
    let result = engine
        .evaluate(dataset(4), cfg, vec![MetricRef::Direct(Arc::new(Half))], WAIT)
        .await
        .unwrap();

    assert_eq!(reporter.samples.lock().unwrap().len(), 4);
    assert_eq!(*reporter.summaries.lock().unwrap(), 1);
    assert_eq!(result.metadata["suite"], "nightly");
    assert_eq!(result.metadata["stamped"], true);

    let stored = store.results();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].run_id, result.run_id);

    let mut progress = 0;
    let mut completed = 0;
    while let Ok((event, data)) = events.try_recv() {
        match event {
            BroadcastEvent::Progress => progress += 1,
            BroadcastEvent::Completed => {
                completed += 1;
                assert_eq!(data["sample_count"], 4);
            }
        }
    }
    assert_eq!(progress, 4);
    assert_eq!(completed, 1);

    assert_eq!(result.by_tag["split"]["a"].sample_count, 2);
    assert_eq!(result.by_tag["split"]["b"].pass_rate, Some(1.0));
}

#[tokio::test]
async fn test_json_file_store_writes_result() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("runs"));
    let registry = Arc::new(ComponentRegistry::new());
    registry
        .register(ComponentKind::Store, Component::Store(Arc::new(store.clone())))
        .unwrap();

    let mut cfg = EvalConfig::default();
    cfg.stores = vec!["json_file".into()];
    let engine = isolated(registry);
    let result = engine
        .evaluate(dataset(2), cfg, vec![MetricRef::Direct(Arc::new(Half))], WAIT)
        .await
        .unwrap();

    let raw = std::fs::read_to_string(store.path_for(&result.run_id)).unwrap();
    let written: EvalResult = serde_json::from_str(&raw).unwrap();
    assert_eq!(written.run_id, result.run_id);
    assert_eq!(written.sample_count, 2);
    assert_eq!(written.summary_stats["half"].mean, 0.5);
}

#[tokio::test]
async fn test_cancelled_run_skips_stores() {
    struct Slow;

    #[async_trait]
    impl Metric for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn evaluate(&self, _s: &Sample, _c: &MetricContext) -> Result<f64, ScoringError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1.0)
        }
    }

    let store = MemoryStore::new();
    let registry = Arc::new(ComponentRegistry::new());
    registry
        .register(ComponentKind::Store, Component::Store(Arc::new(store.clone())))
        .unwrap();
    let mut cfg = EvalConfig::default();
    cfg.stores = vec!["memory".into()];

    let engine = isolated(registry);
    let run_id = engine
        .start_run(dataset(3), cfg, vec![MetricRef::Direct(Arc::new(Slow))])
        .await
        .unwrap();
    engine.cancel(&run_id).await.unwrap();
    let result = engine.await_result(&run_id, WAIT).await.unwrap();

    assert!(result.cancelled);
    assert!(store.results().is_empty());
}

#[tokio::test]
async fn test_configured_middleware_replaces_default() {
    let registry = Arc::new(ComponentRegistry::new());
    registry
        .register(ComponentKind::Middleware, Component::Middleware(Arc::new(Doubler)))
        .unwrap();
    let mut cfg = EvalConfig::default();
    cfg.middleware = vec!["doubler".into()];

    let engine = isolated(registry);
    let result = engine
        .evaluate(dataset(1), cfg, vec![MetricRef::Direct(Arc::new(Half))], WAIT)
        .await
        .unwrap();
    assert_eq!(result.sample_results[0].scores["half"], 1.0);
}

#[test]
#[serial]
fn test_global_registry_lookup_and_clear() {
    let global = registry::global();
    global.clear();

    global
        .register_as(ComponentKind::Metric, "halfway", Component::Metric(Arc::new(Half)))
        .unwrap();
    assert!(global.metric("half").is_ok());
    assert!(global.metric("halfway").is_ok());
    assert_eq!(global.list(ComponentKind::Metric).len(), 1);

    let err = global
        .register(ComponentKind::Reporter, Component::Metric(Arc::new(Half)))
        .unwrap_err();
    assert!(matches!(err, RegistryError::MissingCapability { .. }));

    global.clear();
    assert!(global.is_empty());
}

#[tokio::test]
#[serial]
async fn test_default_engine_uses_global_registry() {
    let global = registry::global();
    global.clear();
    global
        .register(ComponentKind::Metric, Component::Metric(Arc::new(Half)))
        .unwrap();

    let engine = Engine::new();
    let result = engine
        .evaluate(dataset(2), EvalConfig::default(), vec![MetricRef::named("half")], WAIT)
        .await
        .unwrap();
    assert_eq!(result.summary_stats["half"].count, 2);

    global.clear();
}

#[tokio::test]
#[serial]
async fn test_default_engines_share_run_table() {
    struct Slow;

    #[async_trait]
    impl Metric for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn evaluate(&self, _s: &Sample, _c: &MetricContext) -> Result<f64, ScoringError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1.0)
        }
    }

    let starter = Engine::new();
    let observer = Engine::new();
    let run_id = starter
        .start_run(dataset(2), EvalConfig::default(), vec![MetricRef::Direct(Arc::new(Slow))])
        .await
        .unwrap();

    let progress = observer.get_progress(&run_id).await.unwrap();
    assert_eq!(progress.run_id, run_id);
    assert!(!progress.finished);
    assert!(observer.list_running().await.iter().any(|p| p.run_id == run_id));

    observer.cancel(&run_id).await.unwrap();
    let result = starter.await_result(&run_id, WAIT).await.unwrap();
    assert!(result.cancelled);

    let private = isolated(Arc::new(ComponentRegistry::new()));
    assert!(private.get_progress(&run_id).await.is_err());
}
