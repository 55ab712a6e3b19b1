//! Catalog store: apps, deployments, tasks, and git credentials in SQLite.
//!
//! All access goes through [`DbHandle`], which wraps the connection behind
//! `Arc<Mutex>` and runs closures on tokio's blocking pool so synchronous
//! SQLite I/O never ties up async worker threads. The "at most one
//! non-terminal task per kind per app" invariant is enforced here with a
//! compare-and-set inside a single transaction, not with in-memory locks.

pub mod models;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::util::derive_subdomain;
use models::*;

/// Async-safe handle to the catalog.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Catalog>>,
}

impl DbHandle {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(catalog)),
        }
    }

    /// Run a closure with access to the catalog on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Catalog) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow!("catalog lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("catalog task panicked")?
    }

    /// Synchronous access for startup, maintenance loops, and tests. Not
    /// for hot async paths.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Catalog>> {
        self.inner
            .lock()
            .map_err(|e| anyhow!("catalog lock poisoned: {}", e))
    }
}

/// Fields required to register a new app.
#[derive(Debug, Clone)]
pub struct NewApp {
    pub owner_id: i64,
    pub name: String,
    pub git_url: String,
    pub branch: String,
    pub entry_file: String,
    pub base_image_choice: BaseImageChoice,
    pub custom_base_image: Option<String>,
    pub custom_overlay: Option<String>,
    pub credential_id: Option<i64>,
    pub env_vars: Vec<EnvVar>,
    pub is_public: bool,
}

/// Partial update applied by `update_app`. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct AppPatch {
    pub name: Option<String>,
    pub git_url: Option<String>,
    pub branch: Option<String>,
    pub entry_file: Option<String>,
    pub base_image_choice: Option<BaseImageChoice>,
    pub custom_base_image: Option<Option<String>>,
    pub custom_overlay: Option<Option<String>>,
    pub credential_id: Option<Option<i64>>,
    pub env_vars: Option<Vec<EnvVar>>,
    pub is_public: Option<bool>,
}

pub struct Catalog {
    conn: Connection,
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in catalog: {s}"))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}

impl Catalog {
    /// Open (or create) the catalog at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open catalog database")?;
        let catalog = Self { conn };
        catalog.init()?;
        Ok(catalog)
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory catalog database")?;
        let catalog = Self { conn };
        catalog.init()?;
        Ok(catalog)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS git_credentials (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    auth_kind TEXT NOT NULL,
                    secret_blob BLOB NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS apps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    git_url TEXT NOT NULL,
                    branch TEXT NOT NULL DEFAULT 'main',
                    entry_file TEXT NOT NULL DEFAULT 'streamlit_app.py',
                    base_image_choice TEXT NOT NULL DEFAULT 'auto',
                    custom_base_image TEXT,
                    custom_overlay TEXT,
                    credential_id INTEGER REFERENCES git_credentials(id) ON DELETE SET NULL,
                    env_vars TEXT NOT NULL DEFAULT '[]',
                    subdomain TEXT UNIQUE,
                    status TEXT NOT NULL DEFAULT 'stopped',
                    container_id TEXT,
                    image_tag TEXT,
                    build_task_id TEXT,
                    deploy_task_id TEXT,
                    stop_task_id TEXT,
                    is_public INTEGER NOT NULL DEFAULT 0,
                    last_deployed_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    app_id INTEGER NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
                    commit_hash TEXT,
                    status TEXT NOT NULL DEFAULT 'in_progress',
                    build_log TEXT,
                    error_message TEXT,
                    dockerfile_variant TEXT,
                    dockerfile_hash TEXT,
                    deployed_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    app_id INTEGER NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
                    state TEXT NOT NULL DEFAULT 'pending',
                    current INTEGER NOT NULL DEFAULT 0,
                    total INTEGER NOT NULL DEFAULT 0,
                    message TEXT NOT NULL DEFAULT '',
                    error TEXT,
                    prior_status TEXT NOT NULL,
                    started_at TEXT,
                    finished_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_apps_owner ON apps(owner_id);
                CREATE INDEX IF NOT EXISTS idx_apps_status ON apps(status);
                CREATE INDEX IF NOT EXISTS idx_deployments_app ON deployments(app_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_app ON tasks(app_id, kind);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Apps ──────────────────────────────────────────────────────────

    fn row_to_app(row: &Row<'_>) -> rusqlite::Result<App> {
        let env_json: String = row.get("env_vars")?;
        let to_parse_err = |e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.into(),
            )
        };
        Ok(App {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            name: row.get("name")?,
            git_url: row.get("git_url")?,
            branch: row.get("branch")?,
            entry_file: row.get("entry_file")?,
            base_image_choice: row
                .get::<_, String>("base_image_choice")?
                .parse()
                .map_err(|e: String| to_parse_err(anyhow!(e)))?,
            custom_base_image: row.get("custom_base_image")?,
            custom_overlay: row.get("custom_overlay")?,
            credential_id: row.get("credential_id")?,
            env_vars: serde_json::from_str(&env_json)
                .map_err(|e| to_parse_err(anyhow!("bad env_vars json: {e}")))?,
            subdomain: row
                .get::<_, Option<String>>("subdomain")?
                .unwrap_or_default(),
            status: row
                .get::<_, String>("status")?
                .parse()
                .map_err(|e: String| to_parse_err(anyhow!(e)))?,
            container_id: row.get("container_id")?,
            image_tag: row.get("image_tag")?,
            build_task_id: row.get("build_task_id")?,
            deploy_task_id: row.get("deploy_task_id")?,
            stop_task_id: row.get("stop_task_id")?,
            is_public: row.get::<_, i64>("is_public")? != 0,
            last_deployed_at: row
                .get::<_, Option<String>>("last_deployed_at")?
                .map(|s| parse_ts(&s))
                .transpose()
                .map_err(to_parse_err)?,
            created_at: parse_ts(&row.get::<_, String>("created_at")?).map_err(to_parse_err)?,
            updated_at: parse_ts(&row.get::<_, String>("updated_at")?).map_err(to_parse_err)?,
        })
    }

    const APP_COLUMNS: &'static str = "id, owner_id, name, git_url, branch, entry_file, \
         base_image_choice, custom_base_image, custom_overlay, credential_id, env_vars, \
         subdomain, status, container_id, image_tag, build_task_id, deploy_task_id, \
         stop_task_id, is_public, last_deployed_at, created_at, updated_at";

    /// Register a new app. The subdomain is derived from the assigned id
    /// inside the same transaction and never changes afterwards.
    pub fn create_app(&self, new: &NewApp) -> Result<App> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now_str();
        let env_json = serde_json::to_string(&new.env_vars)?;
        tx.execute(
            "INSERT INTO apps (owner_id, name, git_url, branch, entry_file, base_image_choice, \
             custom_base_image, custom_overlay, credential_id, env_vars, is_public, status, \
             created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'stopped', ?12, ?12)",
            params![
                new.owner_id,
                new.name,
                new.git_url,
                new.branch,
                new.entry_file,
                new.base_image_choice.as_str(),
                new.custom_base_image,
                new.custom_overlay,
                new.credential_id,
                env_json,
                new.is_public as i64,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let subdomain = derive_subdomain(&new.name, id);
        tx.execute(
            "UPDATE apps SET subdomain = ?1 WHERE id = ?2",
            params![subdomain, id],
        )?;
        tx.commit()?;
        self.get_app(id)?
            .ok_or_else(|| anyhow!("app {id} vanished after insert"))
    }

    pub fn get_app(&self, id: i64) -> Result<Option<App>> {
        let sql = format!("SELECT {} FROM apps WHERE id = ?1", Self::APP_COLUMNS);
        self.conn
            .query_row(&sql, params![id], Self::row_to_app)
            .optional()
            .context("Failed to load app")
    }

    pub fn find_app_by_subdomain(&self, subdomain: &str) -> Result<Option<App>> {
        let sql = format!(
            "SELECT {} FROM apps WHERE subdomain = ?1",
            Self::APP_COLUMNS
        );
        self.conn
            .query_row(&sql, params![subdomain], Self::row_to_app)
            .optional()
            .context("Failed to look up app by subdomain")
    }

    pub fn list_apps(&self) -> Result<Vec<App>> {
        self.query_apps("SELECT {} FROM apps ORDER BY created_at DESC", params![])
    }

    pub fn list_apps_by_owner(&self, owner_id: i64) -> Result<Vec<App>> {
        self.query_apps(
            "SELECT {} FROM apps WHERE owner_id = ?1 ORDER BY created_at DESC",
            params![owner_id],
        )
    }

    pub fn list_public_apps(&self) -> Result<Vec<App>> {
        self.query_apps(
            "SELECT {} FROM apps WHERE is_public = 1 ORDER BY created_at DESC",
            params![],
        )
    }

    pub fn list_apps_by_status(&self, status: AppStatus) -> Result<Vec<App>> {
        self.query_apps(
            "SELECT {} FROM apps WHERE status = ?1 ORDER BY created_at DESC",
            params![status.as_str()],
        )
    }

    fn query_apps(&self, sql_template: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<App>> {
        let sql = sql_template.replace("{}", Self::APP_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args, Self::row_to_app)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list apps")
    }

    /// Apply a partial update. The caller is responsible for the
    /// status-gating rule (only stopped/error apps may be edited).
    pub fn update_app(&self, id: i64, patch: &AppPatch) -> Result<App> {
        let tx = self.conn.unchecked_transaction()?;
        if let Some(ref v) = patch.name {
            tx.execute("UPDATE apps SET name = ?1 WHERE id = ?2", params![v, id])?;
        }
        if let Some(ref v) = patch.git_url {
            tx.execute("UPDATE apps SET git_url = ?1 WHERE id = ?2", params![v, id])?;
        }
        if let Some(ref v) = patch.branch {
            tx.execute("UPDATE apps SET branch = ?1 WHERE id = ?2", params![v, id])?;
        }
        if let Some(ref v) = patch.entry_file {
            tx.execute(
                "UPDATE apps SET entry_file = ?1 WHERE id = ?2",
                params![v, id],
            )?;
        }
        if let Some(v) = patch.base_image_choice {
            tx.execute(
                "UPDATE apps SET base_image_choice = ?1 WHERE id = ?2",
                params![v.as_str(), id],
            )?;
        }
        if let Some(ref v) = patch.custom_base_image {
            tx.execute(
                "UPDATE apps SET custom_base_image = ?1 WHERE id = ?2",
                params![v, id],
            )?;
        }
        if let Some(ref v) = patch.custom_overlay {
            tx.execute(
                "UPDATE apps SET custom_overlay = ?1 WHERE id = ?2",
                params![v, id],
            )?;
        }
        if let Some(ref v) = patch.credential_id {
            tx.execute(
                "UPDATE apps SET credential_id = ?1 WHERE id = ?2",
                params![v, id],
            )?;
        }
        if let Some(ref v) = patch.env_vars {
            let env_json = serde_json::to_string(v)?;
            tx.execute(
                "UPDATE apps SET env_vars = ?1 WHERE id = ?2",
                params![env_json, id],
            )?;
        }
        if let Some(v) = patch.is_public {
            tx.execute(
                "UPDATE apps SET is_public = ?1 WHERE id = ?2",
                params![v as i64, id],
            )?;
        }
        tx.execute(
            "UPDATE apps SET updated_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )?;
        tx.commit()?;
        self.get_app(id)?.ok_or_else(|| anyhow!("app {id} not found"))
    }

    pub fn set_app_status(&self, id: i64, status: AppStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE apps SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_str(), id],
        )?;
        Ok(())
    }

    /// Record the running container and its image, or clear both.
    pub fn set_app_container(
        &self,
        id: i64,
        container_id: Option<&str>,
        image_tag: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE apps SET container_id = ?1, image_tag = COALESCE(?2, image_tag), \
             updated_at = ?3 WHERE id = ?4",
            params![container_id, image_tag, now_str(), id],
        )?;
        Ok(())
    }

    /// Record the image produced by a successful build.
    pub fn set_app_image(&self, id: i64, image_tag: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE apps SET image_tag = ?1, updated_at = ?2 WHERE id = ?3",
            params![image_tag, now_str(), id],
        )?;
        Ok(())
    }

    pub fn clear_app_container(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE apps SET container_id = NULL, updated_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )?;
        Ok(())
    }

    pub fn set_last_deployed(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE apps SET last_deployed_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![at.to_rfc3339(), now_str(), id],
        )?;
        Ok(())
    }

    /// Delete the app row; deployments and tasks cascade.
    pub fn delete_app(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM apps WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // ── Task reservation (compare-and-set) ────────────────────────────

    /// Atomically create a task and record it on the app's `<kind>_task_id`
    /// slot. Returns `false` without side effects when a task of the same
    /// kind is still non-terminal for the app.
    pub fn reserve_task(&self, app_id: i64, kind: TaskKind, task_id: &str) -> Result<bool> {
        let column = task_column(kind);
        let tx = self.conn.unchecked_transaction()?;

        let app_row: Option<(Option<String>, String)> = tx
            .query_row(
                &format!("SELECT {column}, status FROM apps WHERE id = ?1"),
                params![app_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((existing_task, status)) = app_row else {
            return Err(anyhow!("app {app_id} not found"));
        };

        if let Some(existing) = existing_task {
            let state: Option<String> = tx
                .query_row(
                    "SELECT state FROM tasks WHERE id = ?1",
                    params![existing],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(state) = state {
                let state: TaskState = state.parse().map_err(|e: String| anyhow!(e))?;
                if !state.is_terminal() {
                    return Ok(false);
                }
            }
        }

        let prior: AppStatus = status.parse().map_err(|e: String| anyhow!(e))?;
        tx.execute(
            "INSERT INTO tasks (id, kind, app_id, state, prior_status, created_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
            params![task_id, kind.as_str(), app_id, prior.as_str(), now_str()],
        )?;
        tx.execute(
            &format!("UPDATE apps SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
            params![task_id, now_str(), app_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
        let to_parse_err = |e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.into(),
            )
        };
        Ok(TaskRecord {
            id: row.get("id")?,
            kind: row
                .get::<_, String>("kind")?
                .parse()
                .map_err(|e: String| to_parse_err(anyhow!(e)))?,
            app_id: row.get("app_id")?,
            state: row
                .get::<_, String>("state")?
                .parse()
                .map_err(|e: String| to_parse_err(anyhow!(e)))?,
            progress: TaskProgress {
                current: row.get::<_, i64>("current")? as u32,
                total: row.get::<_, i64>("total")? as u32,
                message: row.get("message")?,
            },
            error_message: row.get("error")?,
            prior_status: row
                .get::<_, String>("prior_status")?
                .parse()
                .map_err(|e: String| to_parse_err(anyhow!(e)))?,
            started_at: parse_opt_ts(row.get("started_at")?).map_err(to_parse_err)?,
            finished_at: parse_opt_ts(row.get("finished_at")?).map_err(to_parse_err)?,
            created_at: parse_ts(&row.get::<_, String>("created_at")?).map_err(to_parse_err)?,
        })
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.conn
            .query_row(
                "SELECT * FROM tasks WHERE id = ?1",
                params![task_id],
                Self::row_to_task,
            )
            .optional()
            .context("Failed to load task")
    }

    /// Transition a task's state. Terminal states are never overwritten,
    /// which makes concurrent finalization (worker vs. cancel) safe: the
    /// first terminal transition wins.
    pub fn set_task_state(&self, task_id: &str, state: TaskState) -> Result<()> {
        let now = now_str();
        const NOT_TERMINAL: &str = "state NOT IN ('success', 'failure', 'revoked')";
        match state {
            TaskState::Running => self.conn.execute(
                &format!(
                    "UPDATE tasks SET state = ?1, started_at = COALESCE(started_at, ?2) \
                     WHERE id = ?3 AND {NOT_TERMINAL}"
                ),
                params![state.as_str(), now, task_id],
            )?,
            s if s.is_terminal() => self.conn.execute(
                &format!(
                    "UPDATE tasks SET state = ?1, finished_at = ?2 \
                     WHERE id = ?3 AND {NOT_TERMINAL}"
                ),
                params![state.as_str(), now, task_id],
            )?,
            _ => self.conn.execute(
                &format!("UPDATE tasks SET state = ?1 WHERE id = ?2 AND {NOT_TERMINAL}"),
                params![state.as_str(), task_id],
            )?,
        };
        Ok(())
    }

    pub fn set_task_error(&self, task_id: &str, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET error = ?1 WHERE id = ?2",
            params![error, task_id],
        )?;
        Ok(())
    }

    pub fn set_task_progress(
        &self,
        task_id: &str,
        current: u32,
        total: u32,
        message: &str,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET current = ?1, total = ?2, message = ?3 WHERE id = ?4",
            params![current as i64, total as i64, message, task_id],
        )?;
        Ok(())
    }

    /// Clear the app's task-id slot, but only if it still points at the
    /// given task.
    pub fn clear_task_slot(&self, app_id: i64, kind: TaskKind, task_id: &str) -> Result<()> {
        let column = task_column(kind);
        self.conn.execute(
            &format!(
                "UPDATE apps SET {column} = NULL, updated_at = ?1 WHERE id = ?2 AND {column} = ?3"
            ),
            params![now_str(), app_id, task_id],
        )?;
        Ok(())
    }

    /// Mark tasks left non-terminal by a previous process as failed and
    /// restore their apps. Returns the number of recovered tasks.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut stmt = tx.prepare(
            "SELECT id, kind, app_id, prior_status FROM tasks \
             WHERE state IN ('pending', 'running', 'retry')",
        )?;
        let rows: Vec<(String, String, i64, String)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let now = now_str();
        for (task_id, kind, app_id, prior) in &rows {
            tx.execute(
                "UPDATE tasks SET state = 'failure', error = 'interrupted by restart', \
                 finished_at = ?1 WHERE id = ?2",
                params![now, task_id],
            )?;
            let kind: TaskKind = kind.parse().map_err(|e: String| anyhow!(e))?;
            let column = task_column(kind);
            tx.execute(
                &format!("UPDATE apps SET {column} = NULL WHERE id = ?1 AND {column} = ?2"),
                params![app_id, task_id],
            )?;
            tx.execute(
                "UPDATE apps SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![prior, now, app_id],
            )?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    // ── Deployments ───────────────────────────────────────────────────

    fn row_to_deployment(row: &Row<'_>) -> rusqlite::Result<Deployment> {
        let to_parse_err = |e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.into(),
            )
        };
        Ok(Deployment {
            id: row.get("id")?,
            app_id: row.get("app_id")?,
            commit_hash: row.get("commit_hash")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .map_err(|e: String| to_parse_err(anyhow!(e)))?,
            build_log: row.get("build_log")?,
            error_message: row.get("error_message")?,
            dockerfile_variant: row.get("dockerfile_variant")?,
            dockerfile_hash: row.get("dockerfile_hash")?,
            deployed_at: parse_ts(&row.get::<_, String>("deployed_at")?).map_err(to_parse_err)?,
        })
    }

    pub fn create_deployment(&self, app_id: i64) -> Result<Deployment> {
        self.conn.execute(
            "INSERT INTO deployments (app_id, status, deployed_at) VALUES (?1, 'in_progress', ?2)",
            params![app_id, now_str()],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_deployment(id)?
            .ok_or_else(|| anyhow!("deployment {id} vanished after insert"))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finish_deployment(
        &self,
        id: i64,
        status: DeploymentStatus,
        commit_hash: Option<&str>,
        build_log: Option<&str>,
        error_message: Option<&str>,
        dockerfile_variant: Option<&str>,
        dockerfile_hash: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE deployments SET status = ?1, commit_hash = COALESCE(?2, commit_hash), \
             build_log = COALESCE(?3, build_log), error_message = ?4, \
             dockerfile_variant = COALESCE(?5, dockerfile_variant), \
             dockerfile_hash = COALESCE(?6, dockerfile_hash) WHERE id = ?7",
            params![
                status.as_str(),
                commit_hash,
                build_log,
                error_message,
                dockerfile_variant,
                dockerfile_hash,
                id
            ],
        )?;
        Ok(())
    }

    pub fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        self.conn
            .query_row(
                "SELECT * FROM deployments WHERE id = ?1",
                params![id],
                Self::row_to_deployment,
            )
            .optional()
            .context("Failed to load deployment")
    }

    pub fn list_deployments(&self, app_id: i64) -> Result<Vec<Deployment>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM deployments WHERE app_id = ?1 ORDER BY deployed_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![app_id], Self::row_to_deployment)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list deployments")
    }

    pub fn latest_deployment(&self, app_id: i64) -> Result<Option<Deployment>> {
        self.conn
            .query_row(
                "SELECT * FROM deployments WHERE app_id = ?1 ORDER BY deployed_at DESC, id DESC \
                 LIMIT 1",
                params![app_id],
                Self::row_to_deployment,
            )
            .optional()
            .context("Failed to load latest deployment")
    }

    /// Retention hook: delete deployment history older than the cutoff.
    pub fn prune_deployments(&self, before: DateTime<Utc>) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM deployments WHERE deployed_at < ?1",
            params![before.to_rfc3339()],
        )?;
        Ok(n)
    }

    // ── Git credentials ───────────────────────────────────────────────

    fn row_to_credential(row: &Row<'_>) -> rusqlite::Result<GitCredential> {
        let to_parse_err = |e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.into(),
            )
        };
        Ok(GitCredential {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            name: row.get("name")?,
            provider: row.get("provider")?,
            auth_kind: row
                .get::<_, String>("auth_kind")?
                .parse()
                .map_err(|e: String| to_parse_err(anyhow!(e)))?,
            secret_blob: row.get("secret_blob")?,
            created_at: parse_ts(&row.get::<_, String>("created_at")?).map_err(to_parse_err)?,
        })
    }

    pub fn create_credential(
        &self,
        owner_id: i64,
        name: &str,
        provider: &str,
        auth_kind: AuthKind,
        secret_blob: &[u8],
    ) -> Result<GitCredential> {
        self.conn.execute(
            "INSERT INTO git_credentials (owner_id, name, provider, auth_kind, secret_blob, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                owner_id,
                name,
                provider,
                auth_kind.as_str(),
                secret_blob,
                now_str()
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_credential(id)?
            .ok_or_else(|| anyhow!("credential {id} vanished after insert"))
    }

    pub fn get_credential(&self, id: i64) -> Result<Option<GitCredential>> {
        self.conn
            .query_row(
                "SELECT * FROM git_credentials WHERE id = ?1",
                params![id],
                Self::row_to_credential,
            )
            .optional()
            .context("Failed to load credential")
    }

    pub fn list_credentials_by_owner(&self, owner_id: i64) -> Result<Vec<GitCredential>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM git_credentials WHERE owner_id = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![owner_id], Self::row_to_credential)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list credentials")
    }

    pub fn delete_credential(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM git_credentials WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}

fn task_column(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Build => "build_task_id",
        TaskKind::Deploy => "deploy_task_id",
        TaskKind::Stop => "stop_task_id",
    }
}
