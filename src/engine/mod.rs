//! Container engine adapter.
//!
//! [`ContainerEngine`] is the single seam between the orchestrator and the
//! container runtime. `DockerEngine` talks to the daemon socket through
//! bollard; `MockEngine` implements the same trait in memory for tests and
//! dry runs. Discovery is label-based: every container the platform owns
//! carries `platform.owned=true` plus identifying labels; no external
//! registry is consulted.

pub mod docker;
pub mod mock;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::errors::EngineError;

pub use docker::DockerEngine;
pub use mock::MockEngine;

/// Marker label present on every container the platform owns.
pub const LABEL_OWNED: &str = "platform.owned";
pub const LABEL_APP_ID: &str = "platform.app_id";
pub const LABEL_APP_NAME: &str = "platform.app_name";
pub const LABEL_SUBDOMAIN: &str = "platform.subdomain";
pub const LABEL_IMAGE: &str = "platform.image";

/// Internal port every app container serves Streamlit on.
pub const APP_PORT: u16 = 8501;

/// Callback fed one build-output line at a time.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Everything needed to start an app container.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub image: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub network: String,
    /// `KEY=VALUE` pairs, in declaration order.
    pub env: Vec<String>,
    pub restart_policy: String,
}

impl StartSpec {
    /// Standard labels for an app container.
    pub fn platform_labels(
        app_id: i64,
        app_name: &str,
        subdomain: &str,
        image: &str,
    ) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_OWNED.to_string(), "true".to_string()),
            (LABEL_APP_ID.to_string(), app_id.to_string()),
            (LABEL_APP_NAME.to_string(), app_name.to_string()),
            (LABEL_SUBDOMAIN.to_string(), subdomain.to_string()),
            (LABEL_IMAGE.to_string(), image.to_string()),
        ])
    }
}

/// Container health as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No healthcheck configured.
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// Snapshot of one container's runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerState {
    pub running: bool,
    pub started_at: Option<String>,
    pub networks: Vec<String>,
    pub health: HealthStatus,
    pub exit_code: Option<i64>,
}

impl ContainerState {
    /// A container is acceptable after deploy when it runs and either has
    /// no healthcheck or reports healthy.
    pub fn is_ready(&self) -> bool {
        self.running && matches!(self.health, HealthStatus::None | HealthStatus::Healthy)
    }
}

/// One row of `list_app_containers`.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSummary {
    pub fn app_id(&self) -> Option<i64> {
        self.labels.get(LABEL_APP_ID)?.parse().ok()
    }

    pub fn subdomain(&self) -> Option<&str> {
        self.labels.get(LABEL_SUBDOMAIN).map(|s| s.as_str())
    }
}

/// Result of an `exec` inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Typed operations over images and containers. All operations marked
/// idempotent in the spec treat "already gone" / "already stopped" as
/// success.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Cheap liveness probe of the engine itself.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Build `context_dir` into an image tagged `tag`, forwarding each
    /// output line through `on_line`. Returns the image id. The partial
    /// log is preserved inside the error on failure.
    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        on_line: LineSink<'_>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<String, EngineError>;

    /// Start a container. Idempotent with respect to the name: an existing
    /// container with the same name is removed first.
    async fn start_container(&self, spec: &StartSpec) -> Result<String, EngineError>;

    /// Graceful stop, then kill after `timeout`. Idempotent.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Remove a container (force). Idempotent.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Remove an image by tag (force). Idempotent.
    async fn remove_image(&self, tag: &str) -> Result<(), EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError>;

    /// Finite, restartable read of the last `tail` log lines.
    async fn stream_logs(&self, id: &str, tail: u32) -> Result<Vec<String>, EngineError>;

    /// All containers carrying the platform marker label, running or not.
    async fn list_app_containers(&self) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Run a command inside a (non-app) container and collect its output.
    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<ExecOutput, EngineError>;
}

/// Outcome of an orphan sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    pub removed: Vec<ContainerSummary>,
    pub failed: Vec<String>,
}

/// Remove platform-labelled containers whose `platform.app_id` is not in
/// `active_ids`. Containers with a listed app id are never touched;
/// containers without a parseable app id are treated as orphans (they
/// carry the platform marker but nothing in the catalog can own them).
pub async fn cleanup_orphans(
    engine: &dyn ContainerEngine,
    active_ids: &HashSet<i64>,
) -> Result<OrphanReport, EngineError> {
    let mut report = OrphanReport::default();
    for container in engine.list_app_containers().await? {
        let keep = container.app_id().is_some_and(|id| active_ids.contains(&id));
        if keep {
            continue;
        }
        tracing::info!(
            container = %container.name,
            app_id = ?container.app_id(),
            "removing orphaned container"
        );
        match engine.remove_container(&container.id).await {
            Ok(()) => report.removed.push(container),
            Err(e) => {
                tracing::warn!(container = %container.name, error = %e, "orphan removal failed");
                report.failed.push(container.name.clone());
            }
        }
    }
    Ok(report)
}
