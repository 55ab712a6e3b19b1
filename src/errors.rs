//! Typed error hierarchy for the Gantry orchestrator.
//!
//! One enum per subsystem:
//! - `GitError` — clone and ref-resolution failures
//! - `EngineError` — container engine transport and operation failures
//! - `ProxyError` — fragment and reload failures
//! - `TaskError` — task engine failures
//! - `PipelineError` — pipeline step failures, classified transient vs terminal
//! - `OrchestratorError` — request-surface failures mapped to caller-visible kinds

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the git fetcher.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Repository unreachable: {0}")]
    Unreachable(String),

    #[error("Authentication required or rejected for repository")]
    AuthRequired,

    #[error("Ref '{0}' not found in repository")]
    RefNotFound(String),

    #[error("Clone timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Failed to spawn git: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Workspace error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Clone was cancelled")]
    Cancelled,
}

impl GitError {
    /// Network-shaped failures are retried by the task engine.
    pub fn is_transient(&self) -> bool {
        matches!(self, GitError::Unreachable(_) | GitError::Timeout { .. })
    }
}

/// Errors from the container engine adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    #[error("Image build failed: {message}")]
    BuildFailed {
        message: String,
        /// Build output captured up to the failure.
        log: String,
    },

    #[error("Build timed out after {seconds}s")]
    BuildTimeout { seconds: u64, log: String },

    #[error("Container '{name}' failed to start: {message}")]
    StartFailed { name: String, message: String },

    #[error("Container '{0}' not found")]
    NotFound(String),

    #[error("Exec in '{container}' failed: {message}")]
    ExecFailed { container: String, message: String },

    #[error("Engine transport error: {0}")]
    Transport(String),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_) | EngineError::Unavailable(_)
        )
    }
}

/// Errors from the proxy config manager.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to write fragment {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy reload invalid: {errors}")]
    ReloadInvalid { errors: String },

    #[error("Proxy reload timed out after {seconds}s")]
    ReloadTimeout { seconds: u64 },

    #[error("Fragment '{0}' is protected by the system allowlist")]
    Protected(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors from the task engine.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task {0} not found")]
    NotFound(String),

    #[error("Another {kind} task is already in flight for app {app_id}")]
    Conflict { app_id: i64, kind: String },

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Catalog(#[from] anyhow::Error),
}

/// Pipeline-level failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("Invalid composition input: {0}")]
    InvalidInput(String),

    #[error("Container did not become healthy within {seconds}s")]
    HealthTimeout { seconds: u64 },

    #[error("Pipeline was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Transient failures are retried with backoff by the task engine;
    /// everything else is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Git(e) => e.is_transient(),
            PipelineError::Engine(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Git(GitError::Cancelled)
                | PipelineError::Engine(EngineError::Cancelled)
        )
    }
}

/// Request-surface errors, mapped by the embedding layer onto HTTP-class
/// responses.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("App {0} not found")]
    AppNotFound(i64),

    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_error_transience() {
        assert!(GitError::Unreachable("no route".into()).is_transient());
        assert!(GitError::Timeout { seconds: 120 }.is_transient());
        assert!(!GitError::AuthRequired.is_transient());
        assert!(!GitError::RefNotFound("main".into()).is_transient());
        assert!(!GitError::Cancelled.is_transient());
    }

    #[test]
    fn engine_error_transience() {
        assert!(EngineError::Transport("socket reset".into()).is_transient());
        assert!(
            !EngineError::BuildFailed {
                message: "step 4 failed".into(),
                log: String::new(),
            }
            .is_transient()
        );
    }

    #[test]
    fn pipeline_error_propagates_transience() {
        let e: PipelineError = GitError::Unreachable("down".into()).into();
        assert!(e.is_transient());

        let e: PipelineError = EngineError::BuildFailed {
            message: "x".into(),
            log: String::new(),
        }
        .into();
        assert!(!e.is_transient());
    }

    #[test]
    fn pipeline_error_detects_cancellation_from_subsystems() {
        assert!(PipelineError::Cancelled.is_cancelled());
        let e: PipelineError = GitError::Cancelled.into();
        assert!(e.is_cancelled());
        let e: PipelineError = EngineError::Cancelled.into();
        assert!(e.is_cancelled());
        assert!(!PipelineError::HealthTimeout { seconds: 60 }.is_cancelled());
    }

    #[test]
    fn task_conflict_carries_ids() {
        let err = TaskError::Conflict {
            app_id: 7,
            kind: "build".into(),
        };
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains("build"));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GitError::AuthRequired);
        assert_std_error(&EngineError::NotFound("app-x".into()));
        assert_std_error(&ProxyError::ReloadTimeout { seconds: 10 });
        assert_std_error(&TaskError::QueueClosed);
        assert_std_error(&OrchestratorError::AppNotFound(1));
    }
}
