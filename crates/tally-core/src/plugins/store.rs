use super::RunContext;
use crate::result::EvalResult;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Persistent store for finalized results. `init` opens a session whose state
/// is threaded through `persist` and closed by `finalize`.
#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self, ctx: &RunContext) -> anyhow::Result<Box<dyn StoreSession>>;
}

#[async_trait]
pub trait StoreSession: Send {
    async fn persist(&mut self, result: &EvalResult) -> anyhow::Result<()>;

    async fn finalize(self: Box<Self>) -> anyhow::Result<()>;
}

/// Writes the finalized result as pretty JSON to `<dir>/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }
}

struct JsonFileSession {
    path: PathBuf,
    body: Option<String>,
}

#[async_trait]
impl Store for JsonFileStore {
    fn name(&self) -> &str {
        "json_file"
    }

    async fn init(&self, ctx: &RunContext) -> anyhow::Result<Box<dyn StoreSession>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(Box::new(JsonFileSession {
            path: self.path_for(&ctx.run_id),
            body: None,
        }))
    }
}

#[async_trait]
impl StoreSession for JsonFileSession {
    async fn persist(&mut self, result: &EvalResult) -> anyhow::Result<()> {
        self.body = Some(serde_json::to_string_pretty(result)?);
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> anyhow::Result<()> {
        let JsonFileSession { path, body } = *self;
        if let Some(body) = body {
            tokio::fs::write(&path, body).await?;
        }
        Ok(())
    }
}

/// Keeps finalized results in memory, in completion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    results: Arc<Mutex<Vec<EvalResult>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<EvalResult> {
        self.results.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

struct MemorySession {
    sink: Arc<Mutex<Vec<EvalResult>>>,
    pending: Vec<EvalResult>,
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn init(&self, _ctx: &RunContext) -> anyhow::Result<Box<dyn StoreSession>> {
        Ok(Box::new(MemorySession {
            sink: self.results.clone(),
            pending: Vec::new(),
        }))
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn persist(&mut self, result: &EvalResult) -> anyhow::Result<()> {
        self.pending.push(result.clone());
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> anyhow::Result<()> {
        let MemorySession { sink, pending } = *self;
        sink.lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?
            .extend(pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvalConfig;

    fn ctx(run_id: &str) -> RunContext {
        RunContext {
            run_id: run_id.to_string(),
            config: EvalConfig::default(),
            metric_names: vec![],
            total: Some(0),
            started_at: chrono::Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn json_session_creates_nested_dir_and_writes_on_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("a").join("b"));

        let session = store.init(&ctx("r1")).await.unwrap();
        assert!(dir.path().join("a").join("b").is_dir());
        session.finalize().await.unwrap();
        assert!(!store.path_for("r1").exists());

        let mut session = store.init(&ctx("r2")).await.unwrap();
        let result = crate::result::ResultAccumulator::new("r2", Some(0))
            .finalize(false, serde_json::Map::new());
        session.persist(&result).await.unwrap();
        assert!(!store.path_for("r2").exists());
        session.finalize().await.unwrap();

        let raw = tokio::fs::read_to_string(store.path_for("r2")).await.unwrap();
        let written: EvalResult = serde_json::from_str(&raw).unwrap();
        assert_eq!(written.run_id, "r2");
    }

    #[tokio::test]
    async fn json_init_fails_when_dir_is_a_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = JsonFileStore::new(file.path().join("runs"));
        assert!(store.init(&ctx("r")).await.is_err());
    }
}
