//! State reconciliation: compute what an app is *actually* doing.
//!
//! Joins four signals (declared catalog status, non-terminal task state,
//! container inspection, proxy-fragment validation) into one
//! `actual_status`. Pure decision logic lives in [`resolve`]; the
//! [`Reconciler`] gathers the signals. Read-only and safe to run
//! concurrently with pipelines: drift is reported, never thrown.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::catalog::DbHandle;
use crate::catalog::models::{App, AppStatus, TaskKind, TaskState};
use crate::engine::{ContainerEngine, ContainerState};
use crate::errors::EngineError;
use crate::proxy::ProxyManager;

/// Observed runtime status of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActualStatus {
    Running,
    Stopped,
    NotDeployed,
    ProxyError,
    AppError,
    Building,
    Deploying,
    Stopping,
    Error,
}

impl ActualStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::NotDeployed => "not_deployed",
            Self::ProxyError => "proxy_error",
            Self::AppError => "app_error",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ActualStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActualStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "not_deployed" => Ok(Self::NotDeployed),
            "proxy_error" => Ok(Self::ProxyError),
            "app_error" => Ok(Self::AppError),
            "building" => Ok(Self::Building),
            "deploying" => Ok(Self::Deploying),
            "stopping" => Ok(Self::Stopping),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid actual status: {}", s)),
        }
    }
}

/// The reconciler's answer for one app.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub app_id: i64,
    pub subdomain: String,
    pub declared: AppStatus,
    pub actual: ActualStatus,
    /// Diagnostic from the last deployment when the app is in error.
    pub diagnostic: Option<String>,
}

/// Pure first-match-wins resolution of the four signals.
///
/// `container` is `None` when the app has no container id or the engine
/// no longer knows the container. `proxy_healthy` is only consulted once
/// the container is confirmed running.
pub fn resolve(
    declared: AppStatus,
    has_container_id: bool,
    active_task: Option<TaskKind>,
    container: Option<&ContainerState>,
    proxy_healthy: bool,
) -> ActualStatus {
    if let Some(kind) = active_task {
        return match kind {
            TaskKind::Build => ActualStatus::Building,
            TaskKind::Deploy => ActualStatus::Deploying,
            TaskKind::Stop => ActualStatus::Stopping,
        };
    }
    if declared == AppStatus::Error {
        return ActualStatus::Error;
    }
    if !has_container_id {
        return ActualStatus::NotDeployed;
    }
    let running = container.map(|c| c.running).unwrap_or(false);
    if !running {
        return if declared == AppStatus::Stopped {
            ActualStatus::Stopped
        } else {
            ActualStatus::AppError
        };
    }
    if !proxy_healthy {
        return ActualStatus::ProxyError;
    }
    ActualStatus::Running
}

/// Gathers the signals and applies [`resolve`].
pub struct Reconciler {
    catalog: DbHandle,
    engine: Arc<dyn ContainerEngine>,
    proxy: Arc<ProxyManager>,
}

impl Reconciler {
    pub fn new(catalog: DbHandle, engine: Arc<dyn ContainerEngine>, proxy: Arc<ProxyManager>) -> Self {
        Self {
            catalog,
            engine,
            proxy,
        }
    }

    /// The kind of the first non-terminal task recorded on the app, if any.
    async fn active_task(&self, app: &App) -> Result<Option<TaskKind>> {
        for kind in [TaskKind::Build, TaskKind::Deploy, TaskKind::Stop] {
            let Some(task_id) = app.task_id_for(kind) else {
                continue;
            };
            let task_id = task_id.to_string();
            let state: Option<TaskState> = self
                .catalog
                .call(move |c| Ok(c.get_task(&task_id)?.map(|t| t.state)))
                .await?;
            if let Some(state) = state {
                if !state.is_terminal() {
                    return Ok(Some(kind));
                }
            }
        }
        Ok(None)
    }

    pub async fn status_of(&self, app: &App) -> Result<StatusReport> {
        let active_task = self.active_task(app).await?;

        let container = match &app.container_id {
            Some(id) if active_task.is_none() && app.status != AppStatus::Error => {
                match self.engine.inspect_container(id).await {
                    Ok(state) => Some(state),
                    Err(EngineError::NotFound(_)) => None,
                    Err(e) => return Err(e.into()),
                }
            }
            _ => None,
        };

        // Only pay for proxy validation when the answer can still be
        // "running"
        let proxy_healthy = match &container {
            Some(state) if state.running => self.proxy.validate(app).await?.healthy(),
            _ => false,
        };

        let actual = resolve(
            app.status,
            app.container_id.is_some(),
            active_task,
            container.as_ref(),
            proxy_healthy,
        );

        let diagnostic = if actual == ActualStatus::Error {
            let app_id = app.id;
            self.catalog
                .call(move |c| Ok(c.latest_deployment(app_id)?))
                .await?
                .and_then(|d| d.error_message)
        } else {
            None
        };

        Ok(StatusReport {
            app_id: app.id,
            subdomain: app.subdomain.clone(),
            declared: app.status,
            actual,
            diagnostic,
        })
    }

    /// Batch variant for the request surface.
    pub async fn realtime_status(&self, app_ids: &[i64]) -> Result<Vec<StatusReport>> {
        let ids = app_ids.to_vec();
        let apps: Vec<App> = self
            .catalog
            .call(move |c| {
                let mut out = Vec::new();
                for id in ids {
                    if let Some(app) = c.get_app(id)? {
                        out.push(app);
                    }
                }
                Ok(out)
            })
            .await?;

        let mut reports = Vec::with_capacity(apps.len());
        for app in &apps {
            reports.push(self.status_of(app).await?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HealthStatus;

    fn running_container() -> ContainerState {
        ContainerState {
            running: true,
            started_at: None,
            networks: vec![],
            health: HealthStatus::None,
            exit_code: None,
        }
    }

    fn dead_container() -> ContainerState {
        ContainerState {
            running: false,
            exit_code: Some(137),
            ..running_container()
        }
    }

    #[test]
    fn active_task_wins_over_everything() {
        assert_eq!(
            resolve(
                AppStatus::Error,
                true,
                Some(TaskKind::Build),
                Some(&running_container()),
                true,
            ),
            ActualStatus::Building
        );
        assert_eq!(
            resolve(AppStatus::Running, true, Some(TaskKind::Deploy), None, false),
            ActualStatus::Deploying
        );
        assert_eq!(
            resolve(AppStatus::Running, true, Some(TaskKind::Stop), None, false),
            ActualStatus::Stopping
        );
    }

    #[test]
    fn declared_error_beats_container_signals() {
        assert_eq!(
            resolve(AppStatus::Error, true, None, Some(&running_container()), true),
            ActualStatus::Error
        );
    }

    #[test]
    fn no_container_id_means_not_deployed() {
        assert_eq!(
            resolve(AppStatus::Stopped, false, None, None, false),
            ActualStatus::NotDeployed
        );
    }

    #[test]
    fn dead_container_splits_on_declared_status() {
        assert_eq!(
            resolve(AppStatus::Stopped, true, None, Some(&dead_container()), false),
            ActualStatus::Stopped
        );
        assert_eq!(
            resolve(AppStatus::Running, true, None, Some(&dead_container()), false),
            ActualStatus::AppError
        );
        // Vanished container counts as not running
        assert_eq!(
            resolve(AppStatus::Running, true, None, None, false),
            ActualStatus::AppError
        );
    }

    #[test]
    fn proxy_failure_surfaces_before_running() {
        assert_eq!(
            resolve(AppStatus::Running, true, None, Some(&running_container()), false),
            ActualStatus::ProxyError
        );
        assert_eq!(
            resolve(AppStatus::Running, true, None, Some(&running_container()), true),
            ActualStatus::Running
        );
    }

    #[test]
    fn actual_status_roundtrip() {
        for s in &[
            "running",
            "stopped",
            "not_deployed",
            "proxy_error",
            "app_error",
            "building",
            "deploying",
            "stopping",
            "error",
        ] {
            let parsed: ActualStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("unknown".parse::<ActualStatus>().is_err());
    }
}
