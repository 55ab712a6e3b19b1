//! Build / deploy / stop pipelines.
//!
//! Each pipeline is a fixed, typed list of steps driven by one small
//! interpreter: progress is reported per step, cancellation is checked
//! between steps, and the cleanup block (workspace removal, partial-image
//! removal, deployment bookkeeping) runs on every exit path. Steps check
//! their observable precondition before acting, so a pipeline restarted at
//! any point converges instead of failing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::analyzer;
use crate::catalog::DbHandle;
use crate::catalog::models::{
    App, AppStatus, DeploymentStatus, GitCredential, GitSecret, TaskKind,
};
use crate::compose::{BaseLibrary, Composition, Rendered, compose};
use crate::engine::{ContainerEngine, StartSpec};
use crate::errors::{EngineError, PipelineError};
use crate::git::{GitFetcher, Workspace};
use crate::proxy::ProxyManager;
use crate::tasks::{TaskContext, TaskExecutor};
use crate::util::{LOG_TAIL_LIMIT, short_commit, truncate_log_tail};

/// Decrypts a stored credential into usable secret material. Injected by
/// the embedding layer; the core never sees the encryption scheme.
pub type SecretResolver =
    Arc<dyn Fn(&GitCredential) -> anyhow::Result<GitSecret> + Send + Sync>;

/// Resolver for deployments that never use private repositories.
pub fn no_credentials_resolver() -> SecretResolver {
    Arc::new(|credential| {
        anyhow::bail!(
            "no secret resolver configured, cannot decrypt credential {}",
            credential.id
        )
    })
}

/// Shared dependencies of all three pipelines.
pub struct PipelineRunner {
    catalog: DbHandle,
    engine: Arc<dyn ContainerEngine>,
    proxy: Arc<ProxyManager>,
    bases: Arc<BaseLibrary>,
    fetcher: GitFetcher,
    secrets: SecretResolver,
    network: String,
    workspace_root: PathBuf,
    build_timeout: Duration,
    start_timeout: Duration,
}

/// Build steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildStep {
    Clone,
    Analyze,
    Compose,
    BuildImage,
    Record,
}

impl BuildStep {
    const ALL: [BuildStep; 5] = [
        BuildStep::Clone,
        BuildStep::Analyze,
        BuildStep::Compose,
        BuildStep::BuildImage,
        BuildStep::Record,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::Clone => "Cloning repository",
            Self::Analyze => "Analyzing requirements",
            Self::Compose => "Composing Dockerfile",
            Self::BuildImage => "Building image",
            Self::Record => "Recording deployment",
        }
    }
}

/// Deploy steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeployStep {
    ReplaceContainer,
    AwaitHealthy,
    WireProxy,
    Finalize,
}

impl DeployStep {
    const ALL: [DeployStep; 4] = [
        DeployStep::ReplaceContainer,
        DeployStep::AwaitHealthy,
        DeployStep::WireProxy,
        DeployStep::Finalize,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::ReplaceContainer => "Starting container",
            Self::AwaitHealthy => "Waiting for container health",
            Self::WireProxy => "Updating proxy configuration",
            Self::Finalize => "Finishing deploy",
        }
    }
}

/// Stop steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopStep {
    RemoveFragment,
    RemoveContainer,
    Finalize,
}

impl StopStep {
    const ALL: [StopStep; 3] = [
        StopStep::RemoveFragment,
        StopStep::RemoveContainer,
        StopStep::Finalize,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::RemoveFragment => "Removing proxy fragment",
            Self::RemoveContainer => "Stopping container",
            Self::Finalize => "Finishing stop",
        }
    }
}

/// Mutable state threaded through the build interpreter.
#[derive(Default)]
struct BuildState {
    workspace: Option<Workspace>,
    commit_hash: Option<String>,
    classification: analyzer::Classification,
    rendered: Option<Rendered>,
    image_tag: Option<String>,
    /// True once the image-build step has started; a failure or
    /// cancellation after this point removes the partial image.
    image_build_started: bool,
    build_log: String,
    deployment_id: Option<i64>,
}

impl PipelineRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: DbHandle,
        engine: Arc<dyn ContainerEngine>,
        proxy: Arc<ProxyManager>,
        bases: Arc<BaseLibrary>,
        fetcher: GitFetcher,
        secrets: SecretResolver,
        network: String,
        workspace_root: PathBuf,
        build_timeout: Duration,
        start_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            engine,
            proxy,
            bases,
            fetcher,
            secrets,
            network,
            workspace_root,
            build_timeout,
            start_timeout,
        }
    }

    async fn load_app(&self, app_id: i64) -> Result<App, PipelineError> {
        self.catalog
            .call(move |c| c.get_app(app_id))
            .await?
            .ok_or_else(|| PipelineError::Other(anyhow::anyhow!("app {app_id} no longer exists")))
    }

    async fn resolve_secret(&self, app: &App) -> Result<Option<GitSecret>, PipelineError> {
        let Some(credential_id) = app.credential_id else {
            return Ok(None);
        };
        let credential = self
            .catalog
            .call(move |c| c.get_credential(credential_id))
            .await?
            .ok_or_else(|| {
                PipelineError::Other(anyhow::anyhow!("credential {credential_id} not found"))
            })?;
        let secret = (self.secrets)(&credential)
            .map_err(|e| PipelineError::Other(e.context("secret resolution failed")))?;
        Ok(Some(secret))
    }

    // ── Build ─────────────────────────────────────────────────────────

    /// Run the build pipeline; on success, chain into deploy unless the
    /// task asked for build only.
    pub async fn run_build(&self, ctx: &TaskContext) -> Result<(), PipelineError> {
        let app = self.load_app(ctx.app_id).await?;
        let mut state = BuildState::default();

        let deployment = {
            let app_id = ctx.app_id;
            self.catalog.call(move |c| c.create_deployment(app_id)).await?
        };
        state.deployment_id = Some(deployment.id);

        let result = self.run_build_steps(ctx, &app, &mut state).await;
        self.finish_build(ctx, &app, state, result).await
    }

    async fn run_build_steps(
        &self,
        ctx: &TaskContext,
        app: &App,
        state: &mut BuildState,
    ) -> Result<(), PipelineError> {
        let total = BuildStep::ALL.len() as u32;
        for (index, step) in BuildStep::ALL.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.progress
                .begin_step(index as u32, total, step.name())
                .await;
            match step {
                BuildStep::Clone => {
                    let secret = self.resolve_secret(app).await?;
                    let workspace = Workspace::create(&self.workspace_root, &ctx.task_id)?;
                    let outcome = self
                        .fetcher
                        .clone_into(
                            &workspace,
                            &app.git_url,
                            &app.branch,
                            secret.as_ref(),
                            &ctx.cancel,
                        )
                        .await?;
                    state.commit_hash = Some(outcome.commit_hash);
                    state.workspace = Some(workspace);
                }
                BuildStep::Analyze => {
                    let repo = state.workspace.as_ref().unwrap().repo_dir();
                    state.classification = analyzer::analyze(&repo);
                }
                BuildStep::Compose => {
                    let repo = state.workspace.as_ref().unwrap().repo_dir();
                    let has_requirements = repo.join("requirements.txt").is_file();
                    let rendered = compose(
                        &self.bases,
                        &Composition {
                            app_id: app.id,
                            entry_file: &app.entry_file,
                            base_image_choice: app.base_image_choice,
                            custom_base_image: app.custom_base_image.as_deref(),
                            custom_overlay: app.custom_overlay.as_deref(),
                            has_requirements,
                            classification: &state.classification,
                        },
                    )?;
                    std::fs::write(repo.join("Dockerfile"), &rendered.dockerfile).map_err(
                        |e| PipelineError::Other(anyhow::anyhow!("failed to write Dockerfile: {e}")),
                    )?;
                    state.rendered = Some(rendered);
                }
                BuildStep::BuildImage => {
                    let commit = state.commit_hash.as_deref().unwrap();
                    let tag = format!("app-{}:{}", app.subdomain, short_commit(commit));
                    let repo = state.workspace.as_ref().unwrap().repo_dir();
                    state.image_build_started = true;

                    // Build output streams through an unbounded channel so
                    // the synchronous sink can feed async progress updates;
                    // line count advances `current`, total stays unknown.
                    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
                    let progress = ctx.progress.clone();
                    progress.begin_phase(0, "Building image").await;
                    let forwarder = tokio::spawn(async move {
                        let mut lines: u32 = 0;
                        let mut log = String::new();
                        while let Some(line) = line_rx.recv().await {
                            lines += 1;
                            log.push_str(&line);
                            log.push('\n');
                            progress.update(lines, 0, &line).await;
                        }
                        log
                    });

                    let sink = move |line: &str| {
                        let _ = line_tx.send(line.to_string());
                    };
                    let build_result = self
                        .engine
                        .build_image(&repo, &tag, &sink, &ctx.cancel, self.build_timeout)
                        .await;
                    drop(sink);
                    state.build_log = forwarder.await.unwrap_or_default();
                    match build_result {
                        Ok(image_id) => {
                            info!(tag = %tag, image_id = %image_id, "image built");
                            state.image_tag = Some(tag);
                        }
                        Err(EngineError::BuildFailed { message, log }) => {
                            state.build_log.push_str(&log);
                            state.image_tag = Some(tag);
                            return Err(EngineError::BuildFailed { message, log }.into());
                        }
                        Err(EngineError::BuildTimeout { seconds, log }) => {
                            state.build_log.push_str(&log);
                            state.image_tag = Some(tag);
                            return Err(EngineError::BuildTimeout { seconds, log }.into());
                        }
                        Err(e) => {
                            state.image_tag = Some(tag);
                            return Err(e.into());
                        }
                    }
                }
                BuildStep::Record => {
                    let deployment_id = state.deployment_id.unwrap();
                    let commit = state.commit_hash.clone();
                    let log = truncate_log_tail(&state.build_log, LOG_TAIL_LIMIT);
                    let rendered = state.rendered.as_ref().unwrap();
                    let variant = rendered.variant.map(|v| v.as_str().to_string());
                    let hash = rendered.content_hash.clone();
                    let image_tag = state.image_tag.clone().unwrap();
                    let app_id = app.id;
                    self.catalog
                        .call(move |c| {
                            c.finish_deployment(
                                deployment_id,
                                DeploymentStatus::Success,
                                commit.as_deref(),
                                Some(&log),
                                None,
                                variant.as_deref(),
                                Some(&hash),
                            )?;
                            c.set_app_image(app_id, &image_tag)?;
                            Ok(())
                        })
                        .await?;
                }
            }
        }
        ctx.progress
            .update(total, total, "Build complete")
            .await;
        Ok(())
    }

    /// Cleanup block for the build pipeline. Runs on success, failure and
    /// cancellation alike: the workspace always goes away, a partially
    /// built image is removed, and a non-success leaves a failed
    /// Deployment row.
    async fn finish_build(
        &self,
        ctx: &TaskContext,
        app: &App,
        mut state: BuildState,
        result: Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        if let Some(mut workspace) = state.workspace.take() {
            workspace.cleanup();
        }

        match result {
            Ok(()) => {
                if ctx.params.build_only {
                    // No deploy chain: put the app back where it was
                    let prior = self.task_prior_status(ctx).await;
                    let app_id = ctx.app_id;
                    self.catalog
                        .call(move |c| c.set_app_status(app_id, prior))
                        .await?;
                    return Ok(());
                }
                info!(app_id = app.id, "build complete, chaining into deploy");
                self.run_deploy(ctx).await
            }
            Err(e) => {
                let cancelled = e.is_cancelled() || ctx.cancel.is_cancelled();
                // A partial image only exists once the build step ran
                if state.image_build_started {
                    if let Some(tag) = &state.image_tag {
                        if let Err(remove_err) = self.engine.remove_image(tag).await {
                            warn!(tag = %tag, error = %remove_err, "partial image removal failed");
                        }
                    }
                }
                if let Some(deployment_id) = state.deployment_id {
                    let message = if cancelled {
                        "build cancelled".to_string()
                    } else {
                        e.to_string()
                    };
                    let log = truncate_log_tail(&state.build_log, LOG_TAIL_LIMIT);
                    let variant = state
                        .rendered
                        .as_ref()
                        .and_then(|r| r.variant)
                        .map(|v| v.as_str().to_string());
                    let finish = self
                        .catalog
                        .call(move |c| {
                            c.finish_deployment(
                                deployment_id,
                                DeploymentStatus::Failed,
                                None,
                                Some(&log),
                                Some(&message),
                                variant.as_deref(),
                                None,
                            )
                        })
                        .await;
                    if let Err(record_err) = finish {
                        warn!(error = %record_err, "failed to record failed deployment");
                    }
                }
                Err(e)
            }
        }
    }

    async fn task_prior_status(&self, ctx: &TaskContext) -> AppStatus {
        let task_id = ctx.task_id.clone();
        self.catalog
            .call(move |c| Ok(c.get_task(&task_id)?.map(|t| t.prior_status)))
            .await
            .ok()
            .flatten()
            .unwrap_or(AppStatus::Stopped)
    }

    // ── Deploy ────────────────────────────────────────────────────────

    /// Run the deploy pipeline: replace the container, wait for health,
    /// wire the proxy (with rollback on an invalid reload), finalize.
    pub async fn run_deploy(&self, ctx: &TaskContext) -> Result<(), PipelineError> {
        let app = self.load_app(ctx.app_id).await?;
        let image_tag = app.image_tag.clone().ok_or_else(|| {
            PipelineError::InvalidInput(format!("app {} has no built image", app.id))
        })?;

        {
            let app_id = app.id;
            self.catalog
                .call(move |c| c.set_app_status(app_id, AppStatus::Deploying))
                .await?;
        }

        let container_name = app.container_name();
        let fragment_backup = self.proxy.read_fragment(&app.subdomain);
        let mut new_container_id: Option<String> = None;

        let result = self
            .run_deploy_steps(ctx, &app, &image_tag, &mut new_container_id, &fragment_backup)
            .await;

        if let Err(ref e) = result {
            // Roll back: the new container must not linger, the previous
            // container (if one was serving) is restored, and a backed up
            // fragment is put back before the final reload
            warn!(app_id = app.id, error = %e, "deploy failed, rolling back");
            if let Some(id) = &new_container_id {
                if let Err(remove_err) = self.engine.remove_container(id).await {
                    warn!(container = %id, error = %remove_err, "rollback container removal failed");
                }
            } else {
                let _ = self.engine.remove_container(&container_name).await;
            }
            if app.container_id.is_some() {
                self.restore_previous_container(&app, &image_tag).await;
            }
            match &fragment_backup {
                Some(content) => {
                    if let Err(restore_err) =
                        self.proxy.restore_fragment(&app.subdomain, content)
                    {
                        warn!(error = %restore_err, "fragment restore failed");
                    }
                }
                None => self.proxy.remove_file_only(&app.subdomain),
            }
            if let Err(reload_err) = self.proxy.reload().await {
                warn!(error = %reload_err, "reload after rollback failed");
            }

            if !(e.is_cancelled() || ctx.cancel.is_cancelled()) {
                let app_id = app.id;
                let message = e.to_string();
                let record = self
                    .catalog
                    .call(move |c| {
                        let deployment = c.create_deployment(app_id)?;
                        c.finish_deployment(
                            deployment.id,
                            DeploymentStatus::Failed,
                            None,
                            None,
                            Some(&message),
                            None,
                            None,
                        )
                    })
                    .await;
                if let Err(record_err) = record {
                    warn!(error = %record_err, "failed to record failed deployment");
                }
            }
        }
        result
    }

    /// Start a replacement for the container a failed deploy tore down,
    /// from the app's last recorded image. Best effort: the app still
    /// ends up in `error`, but the previous deployment keeps serving.
    async fn restore_previous_container(&self, app: &App, image_tag: &str) {
        let spec = StartSpec {
            image: image_tag.to_string(),
            name: app.container_name(),
            labels: StartSpec::platform_labels(app.id, &app.name, &app.subdomain, image_tag),
            network: self.network.clone(),
            env: app
                .env_vars
                .iter()
                .map(|v| format!("{}={}", v.key, v.value))
                .collect(),
            restart_policy: "unless-stopped".to_string(),
        };
        match self.engine.start_container(&spec).await {
            Ok(restored) => {
                info!(container = %spec.name, id = %restored, "previous container restored");
                let app_id = app.id;
                let tag = image_tag.to_string();
                let record = self
                    .catalog
                    .call(move |c| c.set_app_container(app_id, Some(&restored), Some(&tag)))
                    .await;
                if let Err(e) = record {
                    warn!(app_id = app.id, error = %e, "failed to record restored container");
                }
            }
            Err(e) => {
                warn!(container = %spec.name, error = %e, "previous container restore failed");
            }
        }
    }

    async fn run_deploy_steps(
        &self,
        ctx: &TaskContext,
        app: &App,
        image_tag: &str,
        new_container_id: &mut Option<String>,
        _fragment_backup: &Option<String>,
    ) -> Result<(), PipelineError> {
        let total = DeployStep::ALL.len() as u32;
        let container_name = app.container_name();
        for (index, step) in DeployStep::ALL.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.progress
                .begin_step(index as u32, total, step.name())
                .await;
            match step {
                DeployStep::ReplaceContainer => {
                    // start_container removes a same-name leftover itself;
                    // listed here as its own step so restarts converge
                    let spec = StartSpec {
                        image: image_tag.to_string(),
                        name: container_name.clone(),
                        labels: StartSpec::platform_labels(
                            app.id,
                            &app.name,
                            &app.subdomain,
                            image_tag,
                        ),
                        network: self.network.clone(),
                        env: app
                            .env_vars
                            .iter()
                            .map(|v| format!("{}={}", v.key, v.value))
                            .collect(),
                        restart_policy: "unless-stopped".to_string(),
                    };
                    let id = self.engine.start_container(&spec).await?;
                    info!(container = %container_name, id = %id, "container started");
                    *new_container_id = Some(id);
                }
                DeployStep::AwaitHealthy => {
                    let id = new_container_id.as_deref().unwrap();
                    self.await_healthy(ctx, id).await?;
                }
                DeployStep::WireProxy => {
                    let outcome = self.proxy.write(app).await?;
                    if !outcome.valid {
                        return Err(PipelineError::Proxy(
                            crate::errors::ProxyError::ReloadInvalid {
                                errors: if outcome.errors.is_empty() {
                                    "proxy reload invalid".to_string()
                                } else {
                                    outcome.errors.join("; ")
                                },
                            },
                        ));
                    }
                }
                DeployStep::Finalize => {
                    let app_id = app.id;
                    let container_id = new_container_id.clone().unwrap();
                    let tag = image_tag.to_string();
                    self.catalog
                        .call(move |c| {
                            c.set_app_container(app_id, Some(&container_id), Some(&tag))?;
                            c.set_last_deployed(app_id, Utc::now())?;
                            c.set_app_status(app_id, AppStatus::Running)?;
                            Ok(())
                        })
                        .await?;
                }
            }
        }
        ctx.progress.update(total, total, "Deploy complete").await;
        Ok(())
    }

    /// Poll the container until it runs and (absent a healthcheck)
    /// reports healthy, up to the configured start window.
    async fn await_healthy(&self, ctx: &TaskContext, container_id: &str) -> Result<(), PipelineError> {
        let deadline = tokio::time::Instant::now() + self.start_timeout;
        loop {
            ctx.check_cancelled()?;
            let state = self.engine.inspect_container(container_id).await?;
            if state.is_ready() {
                return Ok(());
            }
            if !state.running && state.exit_code.is_some() {
                return Err(PipelineError::Engine(EngineError::StartFailed {
                    name: container_id.to_string(),
                    message: format!(
                        "container exited with code {} during startup",
                        state.exit_code.unwrap_or(-1)
                    ),
                }));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PipelineError::HealthTimeout {
                    seconds: self.start_timeout.as_secs(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = ctx.cancel.cancelled() => return Err(PipelineError::Cancelled),
            }
        }
    }

    // ── Stop ──────────────────────────────────────────────────────────

    /// Run the stop pipeline. Tolerates a missing container and a missing
    /// fragment; running it twice leaves the same end state.
    pub async fn run_stop(&self, ctx: &TaskContext) -> Result<(), PipelineError> {
        let app = self.load_app(ctx.app_id).await?;
        {
            let app_id = app.id;
            self.catalog
                .call(move |c| c.set_app_status(app_id, AppStatus::Stopping))
                .await?;
        }

        let total = StopStep::ALL.len() as u32;
        for (index, step) in StopStep::ALL.iter().enumerate() {
            // No cancellation point here on purpose: stop's remaining work
            // IS cleanup, and cleanup must run even after a cancel request
            ctx.progress
                .begin_step(index as u32, total, step.name())
                .await;
            match step {
                StopStep::RemoveFragment => {
                    let outcome = self.proxy.remove(&app.subdomain).await?;
                    if !outcome.valid {
                        warn!(errors = ?outcome.errors, "reload after fragment removal invalid");
                    }
                }
                StopStep::RemoveContainer => {
                    let target = app
                        .container_id
                        .clone()
                        .unwrap_or_else(|| app.container_name());
                    self.engine
                        .stop_container(&target, Duration::from_secs(10))
                        .await?;
                    self.engine.remove_container(&target).await?;
                }
                StopStep::Finalize => {
                    let app_id = app.id;
                    self.catalog
                        .call(move |c| {
                            c.clear_app_container(app_id)?;
                            c.set_app_status(app_id, AppStatus::Stopped)?;
                            Ok(())
                        })
                        .await?;
                }
            }
        }
        ctx.progress.update(total, total, "Stop complete").await;
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for PipelineRunner {
    async fn execute(&self, ctx: &TaskContext) -> Result<(), PipelineError> {
        match ctx.kind {
            TaskKind::Build => self.run_build(ctx).await,
            TaskKind::Deploy => self.run_deploy(ctx).await,
            TaskKind::Stop => self.run_stop(ctx).await,
        }
    }
}
