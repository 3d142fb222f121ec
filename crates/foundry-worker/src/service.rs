//! Service assembly: store, queue, bus, router, invoker, debate runner and
//! orchestrator wired from one [`FoundryConfig`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foundry_coordination::agents::{ModelAgentInvoker, SharedProvider};
use foundry_coordination::config::{FoundryConfig, StoreBackend};
use foundry_coordination::debate::{DebateRunner, ModelSynthesizer, ProviderResponder};
use foundry_coordination::events::{EventBus, SharedEventBus, Subscription};
use foundry_coordination::queue::{
    CleanupLoop, MemoryStore, NewTask, QueueStats, SharedTaskQueue, SharedTaskStore, TaskId, TaskQueue,
    TaskSubmission,
};
use foundry_coordination::router::{ComplexityClassifier, ModelRouter};
use foundry_coordination::workflow::{Orchestrator, SharedOrchestrator, StepSpec, WorkerReport};

use crate::provider::build_provider;

/// One entry of a `--tasks` seed file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedTask {
    #[serde(flatten)]
    pub submission: TaskSubmission,
    /// Explicit step list, validated against the registry on submit
    #[serde(default)]
    pub workflow: Option<Vec<StepSpec>>,
}

/// Read a JSON array of [`SeedTask`]s
pub fn read_seed_file(path: &Path) -> Result<Vec<SeedTask>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse task file {}", path.display()))
}

/// Summary printed when `run` exits
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub workers: Vec<WorkerReport>,
    pub queue: QueueStats,
}

/// Fully wired service
pub struct Service {
    pub queue: SharedTaskQueue,
    pub events: SharedEventBus,
    pub router: ModelRouter,
    pub debate: Arc<DebateRunner>,
    pub orchestrator: SharedOrchestrator,
    workers: usize,
}

fn open_store(config: &FoundryConfig) -> Result<SharedTaskStore> {
    match config.store.backend {
        StoreBackend::Memory => Ok(MemoryStore::new().shared()),
        #[cfg(feature = "durable")]
        StoreBackend::Rocksdb => {
            let store = foundry_coordination::queue::RocksStore::open(&config.store.path)
                .with_context(|| {
                    format!("Failed to open task store at {}", config.store.path.display())
                })?;
            Ok(store.shared())
        }
        #[cfg(not(feature = "durable"))]
        StoreBackend::Rocksdb => {
            bail!("store.backend = \"rocksdb\" requires building with the `durable` feature")
        }
    }
}

impl Service {
    /// Wire the service using the provider described by `config`
    pub fn build(config: &FoundryConfig) -> Result<Self> {
        let provider =
            build_provider(&config.provider).context("Failed to create HTTP client")?;
        Self::with_provider(config, provider)
    }

    /// Wire the service around an explicit provider
    pub fn with_provider(config: &FoundryConfig, provider: SharedProvider) -> Result<Self> {
        config.validate()?;

        let store = open_store(config)?;
        let queue = TaskQueue::new(store, config.queue_config()).shared();
        let events = EventBus::new().shared();

        let registry = Arc::new(config.agent_registry()?);
        let router = ModelRouter::new(ComplexityClassifier::new(&config.classifier), registry.clone());
        let invoker = ModelAgentInvoker::new(router.clone(), provider.clone());

        let mut debate = DebateRunner::new(Arc::new(ProviderResponder::new(provider.clone())))
            .with_events(events.clone())
            .with_default_rounds(config.debate.max_rounds);
        if let Some(model) = &config.debate.coordinator_model {
            debate = debate.with_synthesizer(Arc::new(ModelSynthesizer::new(provider, model.clone())));
        }
        let debate = Arc::new(debate);

        let orchestrator = Orchestrator::new(queue.clone(), events.clone(), Arc::new(invoker), registry)
            .with_debate(debate.clone())
            .with_config(config.orchestrator_config())
            .shared();

        Ok(Self {
            queue,
            events,
            router,
            debate,
            orchestrator,
            workers: config.worker.workers,
        })
    }

    /// Submit seed tasks; invalid entries are logged and skipped
    pub fn seed(&self, tasks: Vec<SeedTask>) -> Vec<TaskId> {
        let mut ids = Vec::new();
        for (index, seed) in tasks.into_iter().enumerate() {
            let new = match NewTask::try_from(seed.submission) {
                Ok(new) => new,
                Err(e) => {
                    warn!(index, error = %e, "Skipping invalid task");
                    continue;
                }
            };
            let id = match self.orchestrator.submit(new) {
                Ok(id) => id,
                Err(e) => {
                    warn!(index, error = %e, "Task submission failed");
                    continue;
                }
            };
            if let Some(steps) = seed.workflow {
                if let Err(e) = self.orchestrator.submit_workflow(&id, steps) {
                    warn!(index, task_id = %id, error = %e, "Invalid workflow, cancelling task");
                    if let Err(e) = self.orchestrator.cancel(&id) {
                        warn!(task_id = %id, error = %e, "Cancel failed");
                    }
                    continue;
                }
            }
            ids.push(id);
        }
        ids
    }

    /// Log task lifecycle events at info level
    pub fn log_task_events(&self) -> Subscription {
        self.events.subscribe("task.*", |event| async move {
            info!(
                topic = %event.topic,
                task_id = event.correlation_id.as_deref().unwrap_or("-"),
                "{}",
                event.payload
            );
            Ok(())
        })
    }

    /// Run workers and the cleanup loop until `shutdown` fires, or, with
    /// `exit_when_idle`, until no task is pending or in progress.
    pub async fn run(&self, shutdown: CancellationToken, exit_when_idle: bool) -> Result<RunSummary> {
        let cleanup = CleanupLoop::new(self.queue.clone(), self.events.clone()).spawn(shutdown.clone());
        let workers = self.orchestrator.spawn_workers(self.workers, "worker", &shutdown);
        info!(workers = self.workers, "Workers started");

        if exit_when_idle {
            let mut ticker = tokio::time::interval(Duration::from_millis(250));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.queue.stats() {
                    Ok(stats) if stats.pending == 0 && stats.in_progress == 0 => {
                        info!("Queue drained");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Queue stats unavailable"),
                }
            }
            shutdown.cancel();
        } else {
            shutdown.cancelled().await;
        }

        let mut reports = Vec::with_capacity(workers.len());
        for worker in workers {
            reports.push(worker.await.context("Worker task panicked")?);
        }
        cleanup.await.context("Cleanup task panicked")?;

        let summary = RunSummary {
            workers: reports,
            queue: self.queue.stats()?,
        };
        info!(
            completed = summary.queue.completed,
            failed = summary.queue.failed,
            pending = summary.queue.pending,
            "Service stopped"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foundry_coordination::agents::{GenerateOptions, Generation, ModelProvider, ProviderError};
    use foundry_coordination::queue::TaskStatus;

    struct CannedProvider;

    #[async_trait]
    impl ModelProvider for CannedProvider {
        async fn generate(
            &self,
            model: &str,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<Generation, ProviderError> {
            Ok(Generation::Real(format!("done by {}", model)))
        }
    }

    fn config() -> FoundryConfig {
        let mut config = FoundryConfig::default();
        config.worker.workers = 2;
        config.worker.poll_interval_ms = 20;
        config
    }

    #[test]
    fn test_seed_file_format() {
        let seeds: Vec<SeedTask> = serde_json::from_str(
            r#"[
                {"title": "Add caching layer", "priority": "medium"},
                {"title": "Ship feature", "priority": "high",
                 "workflow": [{"role": "developer", "action": "code_implementation"}]}
            ]"#,
        )
        .unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].submission.title.as_deref(), Some("Add caching layer"));
        assert_eq!(seeds[1].workflow.as_ref().unwrap()[0].role, "developer");
    }

    #[tokio::test]
    async fn test_seed_skips_invalid_entries() {
        let service = Service::with_provider(&config(), Arc::new(CannedProvider)).unwrap();
        let seeds: Vec<SeedTask> = serde_json::from_str(
            r#"[
                {"title": "ok", "priority": "low"},
                {"title": "", "priority": "low"},
                {"title": "bad priority", "priority": "urgent"},
                {"title": "bad workflow", "priority": "low",
                 "workflow": [{"role": "wizard", "action": "magic"}]}
            ]"#,
        )
        .unwrap();
        let ids = service.seed(seeds);
        assert_eq!(ids.len(), 1);

        let stats = service.queue.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_until_idle() {
        let service = Service::with_provider(&config(), Arc::new(CannedProvider)).unwrap();
        let ids = service.seed(vec![
            SeedTask {
                submission: TaskSubmission {
                    title: Some("Add caching layer".into()),
                    priority: Some("medium".into()),
                    ..Default::default()
                },
                workflow: None,
            },
            SeedTask {
                submission: TaskSubmission {
                    title: Some("Fix typo".into()),
                    priority: Some("low".into()),
                    ..Default::default()
                },
                workflow: Some(vec![StepSpec::new("documenter", "documentation")]),
            },
        ]);

        let summary = tokio::time::timeout(
            Duration::from_secs(10),
            service.run(CancellationToken::new(), true),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(summary.queue.completed, 2);
        assert_eq!(summary.workers.iter().map(|w| w.completed).sum::<usize>(), 2);
        for id in ids {
            assert_eq!(service.queue.get(&id).unwrap().status, TaskStatus::Completed);
        }
    }

    #[test]
    fn test_read_seed_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, r#"[{"title": "Add caching layer", "priority": "medium"}]"#).unwrap();
        let seeds = read_seed_file(&path).unwrap();
        assert_eq!(seeds.len(), 1);

        std::fs::write(&path, "not json").unwrap();
        let err = read_seed_file(&path).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse task file"));
        assert!(read_seed_file(&dir.path().join("missing.json")).is_err());
    }

    #[cfg(feature = "durable")]
    #[test]
    fn test_rocksdb_backend_opens_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = config();
        config.store.backend = StoreBackend::Rocksdb;
        config.store.path = dir.path().join("tasks");
        let service = Service::with_provider(&config, Arc::new(CannedProvider)).unwrap();
        assert_eq!(service.queue.stats().unwrap().pending, 0);
    }

    #[cfg(not(feature = "durable"))]
    #[test]
    fn test_rocksdb_requires_feature() {
        let mut config = config();
        config.store.backend = StoreBackend::Rocksdb;
        assert!(Service::with_provider(&config, Arc::new(CannedProvider)).is_err());
    }
}
