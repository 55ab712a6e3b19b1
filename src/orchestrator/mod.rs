//! The request surface: everything an HTTP layer (out of scope here)
//! calls to drive the platform.
//!
//! The [`Orchestrator`] wires the catalog, the container engine, the proxy
//! manager, the base-Dockerfile library, the task engine, and the
//! reconciler together, and owns input validation plus the status-gating
//! rules (edits only on stopped/error apps, deploy implies build, and so
//! on). Mutating operations that take time return task ids; everything
//! else answers synchronously.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::analyzer::{Classification, classify_requirements};
use crate::catalog::models::{App, AppStatus, BaseImageChoice, Deployment, EnvVar, TaskKind};
use crate::catalog::{AppPatch, DbHandle, NewApp};
use crate::compose::{
    BaseDescription, BaseLibrary, Composition, Rendered, compose, validate_entry_file,
    validate_overlay,
};
use crate::config::GantryConfig;
use crate::engine::{ContainerEngine, OrphanReport, cleanup_orphans};
use crate::errors::OrchestratorError;
use crate::git::GitFetcher;
use crate::pipeline::{PipelineRunner, SecretResolver};
use crate::proxy::{FragmentListing, FragmentStatus, ProxyManager, ReloadOutcome};
use crate::reconcile::{Reconciler, StatusReport};
use crate::tasks::{TaskEngine, TaskEngineConfig, TaskEvent, TaskParams};

/// Fields accepted when registering an app.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAppRequest {
    pub owner_id: i64,
    pub name: String,
    pub git_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_entry_file")]
    pub entry_file: String,
    #[serde(default)]
    pub base_image_choice: BaseImageChoice,
    #[serde(default)]
    pub custom_base_image: Option<String>,
    #[serde(default)]
    pub custom_overlay: Option<String>,
    #[serde(default)]
    pub credential_id: Option<i64>,
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub is_public: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_entry_file() -> String {
    "streamlit_app.py".to_string()
}

/// An app together with its reconciled runtime status.
#[derive(Debug, Clone, Serialize)]
pub struct AppView {
    #[serde(flatten)]
    pub app: App,
    pub actual_status: StatusReport,
}

/// Composition parameters for `preview_dockerfile`. Stateless: the
/// requirements body is passed inline instead of read from a workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct PreviewRequest {
    #[serde(default = "default_entry_file")]
    pub entry_file: String,
    #[serde(default)]
    pub base_image_choice: BaseImageChoice,
    #[serde(default)]
    pub custom_base_image: Option<String>,
    #[serde(default)]
    pub custom_overlay: Option<String>,
    #[serde(default)]
    pub requirements: Option<String>,
}

/// The platform facade.
pub struct Orchestrator {
    catalog: DbHandle,
    engine: Arc<dyn ContainerEngine>,
    proxy: Arc<ProxyManager>,
    bases: Arc<BaseLibrary>,
    tasks: TaskEngine,
    reconciler: Reconciler,
}

impl Orchestrator {
    /// Wire all components together and start the worker pool. Tasks left
    /// non-terminal by a previous process are failed and their apps
    /// restored before any new work is accepted.
    pub async fn start(
        config: &GantryConfig,
        catalog: DbHandle,
        engine: Arc<dyn ContainerEngine>,
        secrets: SecretResolver,
    ) -> Result<Self, OrchestratorError> {
        let bases = Arc::new(
            BaseLibrary::load(&config.paths.base_dockerfiles).map_err(OrchestratorError::Other)?,
        );
        let proxy = Arc::new(ProxyManager::new(
            config.paths.proxy_fragments.clone(),
            config.proxy.container.clone(),
            config.proxy.system_fragments.clone(),
            engine.clone(),
            Duration::from_secs(config.timeouts.reload_secs),
        ));

        let recovered = catalog.call(|c| c.recover_interrupted()).await?;
        if recovered > 0 {
            info!(recovered, "failed tasks interrupted by a previous shutdown");
        }

        let runner = PipelineRunner::new(
            catalog.clone(),
            engine.clone(),
            proxy.clone(),
            bases.clone(),
            GitFetcher::new(Duration::from_secs(config.timeouts.clone_secs)),
            secrets,
            config.engine.network.clone(),
            config.paths.workspaces.clone(),
            Duration::from_secs(config.timeouts.build_secs),
            Duration::from_secs(config.timeouts.start_secs),
        );
        let tasks = TaskEngine::start(
            catalog.clone(),
            Arc::new(runner),
            TaskEngineConfig {
                workers: config.platform.workers,
                ..TaskEngineConfig::default()
            },
        );
        let reconciler = Reconciler::new(catalog.clone(), engine.clone(), proxy.clone());

        Ok(Self {
            catalog,
            engine,
            proxy,
            bases,
            tasks,
            reconciler,
        })
    }

    async fn require_app(&self, app_id: i64) -> Result<App, OrchestratorError> {
        self.catalog
            .call(move |c| c.get_app(app_id))
            .await?
            .ok_or(OrchestratorError::AppNotFound(app_id))
    }

    // ── App CRUD ──────────────────────────────────────────────────────

    pub async fn create_app(&self, request: CreateAppRequest) -> Result<App, OrchestratorError> {
        if request.name.trim().is_empty() || request.name.len() > 100 {
            return Err(OrchestratorError::InvalidInput(
                "app name must be 1-100 characters".to_string(),
            ));
        }
        if request.git_url.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "git_url must not be empty".to_string(),
            ));
        }
        if request.branch.trim().is_empty() || request.branch.starts_with('-') {
            return Err(OrchestratorError::InvalidInput(format!(
                "invalid branch '{}'",
                request.branch
            )));
        }
        validate_entry_file(&request.entry_file)
            .map_err(|e| OrchestratorError::InvalidInput(e.to_string()))?;
        if let Some(ref overlay) = request.custom_overlay {
            validate_overlay(overlay).map_err(|e| OrchestratorError::InvalidInput(e.to_string()))?;
        }
        if let Some(credential_id) = request.credential_id {
            let exists = self
                .catalog
                .call(move |c| Ok(c.get_credential(credential_id)?.is_some()))
                .await?;
            if !exists {
                return Err(OrchestratorError::InvalidInput(format!(
                    "credential {credential_id} not found"
                )));
            }
        }

        let new = NewApp {
            owner_id: request.owner_id,
            name: request.name.trim().to_string(),
            git_url: request.git_url.trim().to_string(),
            branch: request.branch,
            entry_file: request.entry_file,
            base_image_choice: request.base_image_choice,
            custom_base_image: request.custom_base_image.filter(|s| !s.trim().is_empty()),
            custom_overlay: request.custom_overlay.filter(|s| !s.trim().is_empty()),
            credential_id: request.credential_id,
            env_vars: request.env_vars,
            is_public: request.is_public,
        };
        let app = self.catalog.call(move |c| c.create_app(&new)).await?;
        info!(app_id = app.id, subdomain = %app.subdomain, "app created");
        Ok(app)
    }

    /// Edit an app's declared fields. Only allowed while the app is
    /// stopped or in error.
    pub async fn update_app(&self, app_id: i64, patch: AppPatch) -> Result<App, OrchestratorError> {
        let app = self.require_app(app_id).await?;
        if !app.status.allows_edit() {
            return Err(OrchestratorError::Conflict(format!(
                "app {} is {}; stop it before editing",
                app_id, app.status
            )));
        }
        if let Some(ref entry_file) = patch.entry_file {
            validate_entry_file(entry_file)
                .map_err(|e| OrchestratorError::InvalidInput(e.to_string()))?;
        }
        if let Some(Some(ref overlay)) = patch.custom_overlay {
            validate_overlay(overlay).map_err(|e| OrchestratorError::InvalidInput(e.to_string()))?;
        }
        Ok(self
            .catalog
            .call(move |c| c.update_app(app_id, &patch))
            .await?)
    }

    /// Tear an app down completely: container, image, fragment, rows.
    pub async fn delete_app(&self, app_id: i64) -> Result<(), OrchestratorError> {
        let app = self.require_app(app_id).await?;
        if self.active_task_kind(&app).await?.is_some() {
            return Err(OrchestratorError::Conflict(format!(
                "app {app_id} has a task in flight; cancel it first"
            )));
        }

        let target = app
            .container_id
            .clone()
            .unwrap_or_else(|| app.container_name());
        self.engine
            .stop_container(&target, Duration::from_secs(10))
            .await?;
        self.engine.remove_container(&target).await?;
        if let Some(ref tag) = app.image_tag {
            self.engine.remove_image(tag).await?;
        }
        self.proxy.remove(&app.subdomain).await?;
        self.catalog.call(move |c| c.delete_app(app_id)).await?;
        info!(app_id, "app deleted");
        Ok(())
    }

    async fn active_task_kind(&self, app: &App) -> Result<Option<TaskKind>, OrchestratorError> {
        for kind in [TaskKind::Build, TaskKind::Deploy, TaskKind::Stop] {
            let Some(task_id) = app.task_id_for(kind) else {
                continue;
            };
            let task_id = task_id.to_string();
            let non_terminal = self
                .catalog
                .call(move |c| Ok(c.get_task(&task_id)?.map(|t| !t.state.is_terminal())))
                .await?
                .unwrap_or(false);
            if non_terminal {
                return Ok(Some(kind));
            }
        }
        Ok(None)
    }

    // ── Lifecycle operations ──────────────────────────────────────────

    /// Queue a build. `build_only` skips the automatic deploy chain.
    pub async fn build(&self, app_id: i64, build_only: bool) -> Result<String, OrchestratorError> {
        self.require_app(app_id).await?;
        Ok(self
            .tasks
            .enqueue(TaskKind::Build, app_id, TaskParams { build_only })
            .await?)
    }

    /// Queue a deploy. When no usable image exists this implies a build
    /// (which chains into deploy on success).
    pub async fn deploy(&self, app_id: i64) -> Result<String, OrchestratorError> {
        let app = self.require_app(app_id).await?;
        let kind = if app.image_tag.is_some() {
            TaskKind::Deploy
        } else {
            info!(app_id, "no usable image, deploy implies build");
            TaskKind::Build
        };
        Ok(self
            .tasks
            .enqueue(kind, app_id, TaskParams { build_only: false })
            .await?)
    }

    pub async fn stop(&self, app_id: i64) -> Result<String, OrchestratorError> {
        self.require_app(app_id).await?;
        Ok(self
            .tasks
            .enqueue(TaskKind::Stop, app_id, TaskParams::default())
            .await?)
    }

    /// Cancel the app's task of the given kind, if one is recorded.
    pub async fn cancel_task(&self, app_id: i64, kind: TaskKind) -> Result<(), OrchestratorError> {
        let app = self.require_app(app_id).await?;
        let task_id = app.task_id_for(kind).map(|s| s.to_string()).ok_or_else(|| {
            OrchestratorError::TaskNotFound(format!("{kind} task of app {app_id}"))
        })?;
        self.tasks.cancel(&task_id).await?;
        Ok(())
    }

    pub async fn task_status(
        &self,
        task_id: &str,
    ) -> Result<crate::catalog::models::TaskRecord, OrchestratorError> {
        Ok(self.tasks.status(task_id).await?)
    }

    /// Live task event stream (started / progress / finished).
    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.tasks.subscribe()
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub async fn get_app(&self, app_id: i64) -> Result<AppView, OrchestratorError> {
        let app = self.require_app(app_id).await?;
        let actual_status = self
            .reconciler
            .status_of(&app)
            .await
            .map_err(OrchestratorError::Other)?;
        Ok(AppView { app, actual_status })
    }

    /// List apps (all, by owner, or public only) with reconciled status.
    pub async fn list_apps(
        &self,
        owner_id: Option<i64>,
        public_only: bool,
    ) -> Result<Vec<AppView>, OrchestratorError> {
        let apps: Vec<App> = self
            .catalog
            .call(move |c| match (owner_id, public_only) {
                (Some(owner), _) => c.list_apps_by_owner(owner),
                (None, true) => c.list_public_apps(),
                (None, false) => c.list_apps(),
            })
            .await?;
        let mut views = Vec::with_capacity(apps.len());
        for app in apps {
            let actual_status = self
                .reconciler
                .status_of(&app)
                .await
                .map_err(OrchestratorError::Other)?;
            views.push(AppView { app, actual_status });
        }
        Ok(views)
    }

    pub async fn realtime_status(
        &self,
        app_ids: &[i64],
    ) -> Result<Vec<StatusReport>, OrchestratorError> {
        self.reconciler
            .realtime_status(app_ids)
            .await
            .map_err(OrchestratorError::Other)
    }

    pub async fn list_deployments(
        &self,
        app_id: i64,
    ) -> Result<Vec<Deployment>, OrchestratorError> {
        self.require_app(app_id).await?;
        Ok(self
            .catalog
            .call(move |c| c.list_deployments(app_id))
            .await?)
    }

    /// Tail of the app container's logs.
    pub async fn get_logs(&self, app_id: i64, tail: u32) -> Result<String, OrchestratorError> {
        let app = self.require_app(app_id).await?;
        let Some(container_id) = app.container_id else {
            return Ok(String::new());
        };
        let lines = self.engine.stream_logs(&container_id, tail).await?;
        Ok(lines.join("\n"))
    }

    // ── Dockerfile surface ────────────────────────────────────────────

    pub fn list_base_dockerfiles(&self) -> Vec<BaseDescription> {
        self.bases.describe()
    }

    /// Render a Dockerfile for the given parameters without touching any
    /// app. Deterministic.
    pub fn preview_dockerfile(
        &self,
        request: &PreviewRequest,
    ) -> Result<Rendered, OrchestratorError> {
        validate_entry_file(&request.entry_file)
            .map_err(|e| OrchestratorError::InvalidInput(e.to_string()))?;
        let classification = request
            .requirements
            .as_deref()
            .map(classify_requirements)
            .unwrap_or_else(Classification::default);
        compose(
            &self.bases,
            &Composition {
                app_id: 0,
                entry_file: &request.entry_file,
                base_image_choice: request.base_image_choice,
                custom_base_image: request.custom_base_image.as_deref(),
                custom_overlay: request.custom_overlay.as_deref(),
                has_requirements: request.requirements.is_some(),
                classification: &classification,
            },
        )
        .map_err(|e| OrchestratorError::InvalidInput(e.to_string()))
    }

    // ── Proxy maintenance ─────────────────────────────────────────────

    pub fn proxy_fragments(&self) -> FragmentListing {
        self.proxy.list_fragments()
    }

    /// Fragment health for every app the catalog knows.
    pub async fn proxy_status(&self) -> Result<Vec<FragmentStatus>, OrchestratorError> {
        let apps = self.catalog.call(|c| c.list_apps()).await?;
        Ok(self.proxy.configs_status(&apps).await?)
    }

    /// Remove fragments for apps that are no longer active, taking the
    /// active set from the catalog.
    pub async fn cleanup_auto(&self) -> Result<Vec<String>, OrchestratorError> {
        let active = self.active_subdomains().await?;
        Ok(self.proxy.cleanup(&active).await?)
    }

    /// Remove fragments outside a caller-provided active set.
    pub async fn cleanup_manual(
        &self,
        active: Vec<String>,
    ) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.proxy.cleanup(&active.into_iter().collect()).await?)
    }

    pub async fn remove_fragment(&self, subdomain: &str) -> Result<(), OrchestratorError> {
        self.proxy.remove(subdomain).await?;
        Ok(())
    }

    pub async fn reload_proxy(&self) -> Result<ReloadOutcome, OrchestratorError> {
        Ok(self.proxy.reload().await?)
    }

    async fn active_subdomains(&self) -> Result<HashSet<String>, OrchestratorError> {
        let apps = self.catalog.call(|c| c.list_apps()).await?;
        Ok(apps
            .into_iter()
            .filter(|a| {
                matches!(
                    a.status,
                    AppStatus::Running | AppStatus::Building | AppStatus::Deploying
                )
            })
            .map(|a| a.subdomain)
            .collect())
    }

    // ── Engine maintenance ────────────────────────────────────────────

    pub async fn engine_running(&self) -> bool {
        self.engine.ping().await.is_ok()
    }

    /// Remove containers whose app no longer exists, then sweep their
    /// fragments.
    pub async fn cleanup_orphans(&self) -> Result<OrphanReport, OrchestratorError> {
        let apps = self.catalog.call(|c| c.list_apps()).await?;
        let active_ids: HashSet<i64> = apps.iter().map(|a| a.id).collect();
        let report = cleanup_orphans(self.engine.as_ref(), &active_ids).await?;

        let active = self.active_subdomains().await?;
        let removed_fragments = self.proxy.cleanup(&active).await?;
        if !removed_fragments.is_empty() {
            info!(?removed_fragments, "swept fragments during orphan cleanup");
        }
        Ok(report)
    }

    /// Drain the worker pool. In-flight tasks finish first.
    pub async fn shutdown(self) {
        self.tasks.shutdown().await;
    }
}
