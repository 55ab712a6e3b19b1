//! In-memory engine backend for tests and dry runs.
//!
//! Implements [`ContainerEngine`] over a mutex-guarded state table, with
//! hooks to inject the failure modes the pipelines must survive: a failing
//! `nginx -t`, a build that blocks until cancelled, and a build that fails
//! outright. Exec invocations are recorded so tests can assert reload
//! counts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    ContainerEngine, ContainerState, ContainerSummary, ExecOutput, HealthStatus, LABEL_OWNED,
    LineSink, StartSpec,
};
use crate::errors::EngineError;

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    name: String,
    image: String,
    running: bool,
    labels: BTreeMap<String, String>,
    logs: Vec<String>,
}

#[derive(Default)]
struct MockState {
    containers: Vec<MockContainer>,
    images: Vec<String>,
    exec_calls: Vec<(String, Vec<String>)>,
}

/// Test double for the container engine.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
    next_id: AtomicU64,
    /// When set, `exec` of `nginx -t` reports a config error.
    pub fail_nginx_test: AtomicBool,
    /// When set, `build_image` fails with a build error.
    pub fail_build: AtomicBool,
    /// When set, `build_image` parks until the task is cancelled.
    pub hold_build: AtomicBool,
    /// When set, `start_container` fails.
    pub fail_start: AtomicBool,
    /// When set, freshly started containers report `running = false`.
    pub start_dead: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> String {
        format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Seed a running container directly, bypassing `start_container`.
    pub async fn insert_container(
        &self,
        name: &str,
        image: &str,
        labels: BTreeMap<String, String>,
    ) -> String {
        let id = self.fresh_id();
        let mut state = self.state.lock().unwrap();
        state.containers.push(MockContainer {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            running: true,
            labels,
            logs: vec![format!("{name} started")],
        });
        id
    }

    /// All `exec` invocations so far, as `(container, argv)` pairs.
    pub fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().exec_calls.clone()
    }

    /// Number of `nginx -s reload` invocations so far.
    pub fn reload_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .exec_calls
            .iter()
            .filter(|(_, argv)| argv.iter().any(|a| a == "-s"))
            .count()
    }

    pub fn image_exists(&self, tag: &str) -> bool {
        self.state.lock().unwrap().images.iter().any(|i| i == tag)
    }

    pub fn container_by_name(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id.clone())
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    fn find(&self, id_or_name: &str) -> Option<MockContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
            .cloned()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn build_image(
        &self,
        _context_dir: &Path,
        tag: &str,
        on_line: LineSink<'_>,
        cancel: &CancellationToken,
        _timeout: Duration,
    ) -> Result<String, EngineError> {
        on_line(&format!("Step 1/5 : FROM base for {tag}"));
        if self.hold_build.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(EngineError::Cancelled);
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(EngineError::BuildFailed {
                message: "mock build failure".to_string(),
                log: "Step 1/5 : FROM base\nerror: boom".to_string(),
            });
        }
        on_line("Successfully built image");
        let mut state = self.state.lock().unwrap();
        if !state.images.iter().any(|i| i == tag) {
            state.images.push(tag.to_string());
        }
        Ok(format!("sha256:mock-{tag}"))
    }

    async fn start_container(&self, spec: &StartSpec) -> Result<String, EngineError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::StartFailed {
                name: spec.name.clone(),
                message: "mock start failure".to_string(),
            });
        }
        let id = self.fresh_id();
        let running = !self.start_dead.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        // Same-name container is replaced, mirroring the real backend
        state.containers.retain(|c| c.name != spec.name);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            running,
            labels: spec.labels.clone(),
            logs: vec![format!(
                "You can now view your Streamlit app on {}:8501",
                spec.name
            )],
        });
        Ok(id)
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state
            .containers
            .iter_mut()
            .find(|c| c.id == id || c.name == id)
        {
            c.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.containers.retain(|c| c.id != id && c.name != id);
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.images.retain(|i| i != tag);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError> {
        let container = self.find(id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        Ok(ContainerState {
            running: container.running,
            started_at: Some("2024-01-01T00:00:00Z".to_string()),
            networks: vec!["mock-net".to_string()],
            health: HealthStatus::None,
            exit_code: if container.running { None } else { Some(0) },
        })
    }

    async fn stream_logs(&self, id: &str, tail: u32) -> Result<Vec<String>, EngineError> {
        let container = self.find(id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let logs = &container.logs;
        let start = logs.len().saturating_sub(tail as usize);
        Ok(logs[start..].to_vec())
    }

    async fn list_app_containers(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| c.labels.get(LABEL_OWNED).map(|v| v.as_str()) == Some("true"))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                running: c.running,
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<ExecOutput, EngineError> {
        let argv: Vec<String> = cmd.iter().map(|s| s.to_string()).collect();
        self.state
            .lock()
            .unwrap()
            .exec_calls
            .push((container.to_string(), argv));

        let is_config_test = cmd.contains(&"-t");
        if is_config_test && self.fail_nginx_test.load(Ordering::SeqCst) {
            return Ok(ExecOutput {
                exit_code: 1,
                output: "nginx: [emerg] host not found in upstream".to_string(),
            });
        }
        Ok(ExecOutput {
            exit_code: 0,
            output: "nginx: configuration file /etc/nginx/nginx.conf test is successful"
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> StartSpec {
        StartSpec {
            image: "app:test".to_string(),
            name: name.to_string(),
            labels: StartSpec::platform_labels(1, "demo", "demo-1", "app:test"),
            network: "mock-net".to_string(),
            env: vec![],
            restart_policy: "unless-stopped".to_string(),
        }
    }

    #[tokio::test]
    async fn start_replaces_same_name() {
        let engine = MockEngine::new();
        let first = engine.start_container(&spec("app-demo-1")).await.unwrap();
        let second = engine.start_container(&spec("app-demo-1")).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.container_count(), 1);
        assert_eq!(
            engine.container_by_name("app-demo-1").unwrap(),
            second
        );
    }

    #[tokio::test]
    async fn stop_and_remove_are_idempotent() {
        let engine = MockEngine::new();
        let id = engine.start_container(&spec("app-demo-1")).await.unwrap();
        engine
            .stop_container(&id, Duration::from_secs(5))
            .await
            .unwrap();
        engine
            .stop_container(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!engine.inspect_container(&id).await.unwrap().running);

        engine.remove_container(&id).await.unwrap();
        engine.remove_container(&id).await.unwrap();
        assert!(engine.inspect_container(&id).await.is_err());
    }

    #[tokio::test]
    async fn build_registers_image_and_streams_lines() {
        let engine = MockEngine::new();
        let lines = Mutex::new(Vec::new());
        let cancel = CancellationToken::new();
        let sink = |line: &str| lines.lock().unwrap().push(line.to_string());
        let image_id = engine
            .build_image(
                Path::new("/tmp/ctx"),
                "app-demo-1:abc123",
                &sink,
                &cancel,
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert!(image_id.starts_with("sha256:mock-"));
        assert!(engine.image_exists("app-demo-1:abc123"));
        assert_eq!(lines.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn held_build_returns_cancelled() {
        let engine = MockEngine::new();
        engine.hold_build.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sink = |_: &str| {};
        let err = engine
            .build_image(
                Path::new("/tmp/ctx"),
                "app:held",
                &sink,
                &cancel,
                Duration::from_secs(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(!engine.image_exists("app:held"));
    }

    #[tokio::test]
    async fn exec_records_calls_and_honours_failure_flag() {
        let engine = MockEngine::new();
        let ok = engine.exec("nginx", &["nginx", "-t"]).await.unwrap();
        assert!(ok.success());

        engine.fail_nginx_test.store(true, Ordering::SeqCst);
        let bad = engine.exec("nginx", &["nginx", "-t"]).await.unwrap();
        assert_eq!(bad.exit_code, 1);

        assert_eq!(engine.exec_calls().len(), 2);
        assert_eq!(engine.reload_count(), 0);
    }
}
