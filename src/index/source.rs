//! Fragment Sources
//!
//! Where fragment payloads come from. The index tier only ever asks for a
//! whole fragment by id; partial reads are answered from the loaded payload.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// Durable source of fragment payloads
#[async_trait]
pub trait FragmentSource: Send + Sync {
    /// Materialize one fragment
    async fn load(&self, fragment: &str) -> anyhow::Result<Value>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Reads `<dir>/<fragment>.json`
pub struct JsonDirSource {
    dir: PathBuf,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, fragment: &str) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(
            !fragment.is_empty() && !fragment.contains(['/', '\\']) && fragment != "..",
            "invalid fragment id '{fragment}'"
        );
        Ok(self.dir.join(format!("{fragment}.json")))
    }
}

#[async_trait]
impl FragmentSource for JsonDirSource {
    async fn load(&self, fragment: &str) -> anyhow::Result<Value> {
        let path = self.path_for(fragment)?;
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn describe(&self) -> String {
        format!("json-dir:{}", self.dir.display())
    }
}

/// In-memory source for tests and embedding
#[derive(Default)]
pub struct InMemoryFragmentSource {
    fragments: DashMap<String, Value>,
    failures: DashMap<String, String>,
    loads: DashMap<String, u64>,
    total_loads: AtomicU64,
    delay: parking_lot::RwLock<Option<Duration>>,
}

impl InMemoryFragmentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fragment(self, id: impl Into<String>, payload: Value) -> Self {
        self.insert(id, payload);
        self
    }

    pub fn insert(&self, id: impl Into<String>, payload: Value) {
        self.fragments.insert(id.into(), payload);
    }

    pub fn remove(&self, id: &str) -> Option<Value> {
        self.fragments.remove(id).map(|(_, v)| v)
    }

    /// Make loads of `id` fail with `reason` until cleared
    pub fn fail(&self, id: impl Into<String>, reason: impl Into<String>) {
        self.failures.insert(id.into(), reason.into());
    }

    pub fn clear_failure(&self, id: &str) {
        self.failures.remove(id);
    }

    /// Delay every load (simulates a slow disk)
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// Loads attempted for `id`
    pub fn load_count(&self, id: &str) -> u64 {
        self.loads.get(id).map(|c| *c).unwrap_or(0)
    }

    pub fn total_loads(&self) -> u64 {
        self.total_loads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FragmentSource for InMemoryFragmentSource {
    async fn load(&self, fragment: &str) -> anyhow::Result<Value> {
        *self.loads.entry(fragment.to_string()).or_insert(0) += 1;
        self.total_loads.fetch_add(1, Ordering::Relaxed);

        // Read first, then stall: a slow load returns what it read at the start
        let result = match self.failures.get(fragment) {
            Some(reason) => Err(anyhow::anyhow!("{}", reason.value())),
            None => self
                .fragments
                .get(fragment)
                .map(|v| v.value().clone())
                .with_context(|| format!("fragment '{fragment}' not present")),
        };

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    fn describe(&self) -> String {
        format!("in-memory ({} fragments)", self.fragments.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_json_dir_source_reads_fragment_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("concepts_index.json"),
            r#"{"concept_index": {"love": [1, 2]}}"#,
        )
        .unwrap();

        let source = JsonDirSource::new(dir.path());
        let value = source.load("concepts_index").await.unwrap();
        assert_eq!(value["concept_index"]["love"], json!([1, 2]));

        let missing = source.load("lesson_mapper").await.unwrap_err();
        assert!(format!("{missing:#}").contains("lesson_mapper.json"));
        assert!(source.load("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_json_dir_source_rejects_invalid_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ nope").unwrap();
        let err = JsonDirSource::new(dir.path()).load("broken").await.unwrap_err();
        assert!(format!("{err:#}").contains("parsing"));
    }

    #[tokio::test]
    async fn test_in_memory_source_failures_and_counts() {
        let source = InMemoryFragmentSource::new().with_fragment("a", json!({"x": 1}));
        assert_eq!(source.load("a").await.unwrap(), json!({"x": 1}));

        source.fail("a", "disk on fire");
        let err = source.load("a").await.unwrap_err();
        assert_eq!(err.to_string(), "disk on fire");

        source.clear_failure("a");
        assert!(source.load("a").await.is_ok());
        assert!(source.load("b").await.is_err());
        assert_eq!(source.load_count("a"), 3);
        assert_eq!(source.total_loads(), 4);
    }
}
