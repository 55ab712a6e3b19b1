//! Proxy config manager: per-app nginx fragments plus test-and-reload.
//!
//! Each running app owns one `<subdomain>.conf` in the watched fragment
//! directory. Writes are atomic (temp file + rename). The reload cycle,
//! `nginx -t` then `nginx -s reload` exec'd inside the proxy container,
//! is serialized behind one process-wide async mutex so concurrent
//! deploys cannot interleave a test with someone else's reload. A
//! configured allowlist of system fragments is never touched by cleanup.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::catalog::models::App;
use crate::engine::ContainerEngine;
use crate::errors::ProxyError;

/// Result of one proxy test-and-reload cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ReloadOutcome {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }
}

/// Per-app answer of `configs_status`.
#[derive(Debug, Clone, Serialize)]
pub struct FragmentStatus {
    pub subdomain: String,
    pub exists: bool,
    pub syntactically_valid: bool,
    pub upstream_container_exists: bool,
    pub upstream_running: bool,
    pub issues: Vec<String>,
}

impl FragmentStatus {
    pub fn healthy(&self) -> bool {
        self.exists
            && self.syntactically_valid
            && self.upstream_container_exists
            && self.upstream_running
    }
}

/// Listing of the fragment directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FragmentListing {
    pub app_fragments: Vec<String>,
    pub system_fragments: Vec<String>,
}

/// Manages the fragment directory and the proxy container.
pub struct ProxyManager {
    fragment_dir: PathBuf,
    proxy_container: String,
    system_fragments: HashSet<String>,
    engine: Arc<dyn ContainerEngine>,
    reload_timeout: Duration,
    reload_lock: Mutex<()>,
}

impl ProxyManager {
    pub fn new(
        fragment_dir: PathBuf,
        proxy_container: String,
        system_fragments: Vec<String>,
        engine: Arc<dyn ContainerEngine>,
        reload_timeout: Duration,
    ) -> Self {
        Self {
            fragment_dir,
            proxy_container,
            system_fragments: system_fragments.into_iter().collect(),
            engine,
            reload_timeout,
            reload_lock: Mutex::new(()),
        }
    }

    pub fn fragment_path(&self, subdomain: &str) -> PathBuf {
        self.fragment_dir.join(format!("{subdomain}.conf"))
    }

    fn is_system(&self, file_name: &str) -> bool {
        self.system_fragments.contains(file_name)
    }

    /// Render the fragment for a subdomain. Deterministic.
    pub fn render_fragment(subdomain: &str) -> String {
        format!(
            "# Managed fragment for app '{subdomain}'. Regenerated on deploy; do not edit.\n\
             location /{subdomain}/ {{\n\
             \x20   proxy_pass http://app-{subdomain}:8501/;\n\
             \x20   proxy_http_version 1.1;\n\
             \x20   proxy_set_header Host $host;\n\
             \x20   proxy_set_header X-Real-IP $remote_addr;\n\
             \x20   proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
             \x20   proxy_set_header X-Forwarded-Proto $scheme;\n\
             \x20   proxy_set_header X-Script-Name /{subdomain};\n\
             \x20   proxy_set_header Upgrade $http_upgrade;\n\
             \x20   proxy_set_header Connection \"upgrade\";\n\
             \x20   proxy_buffering off;\n\
             \x20   proxy_read_timeout 86400;\n\
             \x20   proxy_send_timeout 86400;\n\
             }}\n"
        )
    }

    /// Write the app's fragment atomically and reload. Re-writing
    /// byte-identical content skips the file write but still reloads
    /// exactly once per call.
    pub async fn write(&self, app: &App) -> Result<ReloadOutcome, ProxyError> {
        let content = Self::render_fragment(&app.subdomain);
        let path = self.fragment_path(&app.subdomain);

        let unchanged = std::fs::read_to_string(&path)
            .map(|existing| existing == content)
            .unwrap_or(false);
        if !unchanged {
            self.write_atomic(&path, &content)?;
            info!(fragment = %path.display(), "wrote proxy fragment");
        }
        self.reload().await
    }

    fn write_atomic(&self, path: &Path, content: &str) -> Result<(), ProxyError> {
        std::fs::create_dir_all(&self.fragment_dir).map_err(|source| ProxyError::WriteFailed {
            path: self.fragment_dir.clone(),
            source,
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.fragment_dir).map_err(|source| {
            ProxyError::WriteFailed {
                path: path.to_path_buf(),
                source,
            }
        })?;
        tmp.write_all(content.as_bytes())
            .map_err(|source| ProxyError::WriteFailed {
                path: path.to_path_buf(),
                source,
            })?;
        tmp.persist(path).map_err(|e| ProxyError::WriteFailed {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Read the current fragment content, if present. Used by the deploy
    /// rollback to back up what it is about to replace.
    pub fn read_fragment(&self, subdomain: &str) -> Option<String> {
        std::fs::read_to_string(self.fragment_path(subdomain)).ok()
    }

    /// Restore a previously backed-up fragment verbatim, without a reload.
    pub fn restore_fragment(&self, subdomain: &str, content: &str) -> Result<(), ProxyError> {
        self.write_atomic(&self.fragment_path(subdomain), content)
    }

    /// Delete the app's fragment (idempotent) and reload.
    pub async fn remove(&self, subdomain: &str) -> Result<ReloadOutcome, ProxyError> {
        let file_name = format!("{subdomain}.conf");
        if self.is_system(&file_name) {
            return Err(ProxyError::Protected(file_name));
        }
        self.remove_file_only(subdomain);
        self.reload().await
    }

    /// Delete the fragment file without reloading. Used during rollback
    /// where the caller reloads once at the end.
    pub fn remove_file_only(&self, subdomain: &str) {
        let path = self.fragment_path(subdomain);
        match std::fs::remove_file(&path) {
            Ok(()) => info!(fragment = %path.display(), "removed proxy fragment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(fragment = %path.display(), error = %e, "fragment removal failed"),
        }
    }

    /// Test the configuration, then reload when it passes. Serialized
    /// process-wide.
    pub async fn reload(&self) -> Result<ReloadOutcome, ProxyError> {
        let _guard = self.reload_lock.lock().await;
        let outcome = tokio::time::timeout(self.reload_timeout, self.test_then_reload())
            .await
            .map_err(|_| ProxyError::ReloadTimeout {
                seconds: self.reload_timeout.as_secs(),
            })??;
        Ok(outcome)
    }

    async fn test_then_reload(&self) -> Result<ReloadOutcome, ProxyError> {
        let test = self
            .engine
            .exec(&self.proxy_container, &["nginx", "-t"])
            .await?;
        if !test.success() {
            warn!(output = %test.output, "nginx config test failed");
            return Ok(ReloadOutcome {
                valid: false,
                errors: test.output.lines().map(|l| l.to_string()).collect(),
            });
        }
        let reload = self
            .engine
            .exec(&self.proxy_container, &["nginx", "-s", "reload"])
            .await?;
        if !reload.success() {
            return Ok(ReloadOutcome {
                valid: false,
                errors: reload.output.lines().map(|l| l.to_string()).collect(),
            });
        }
        Ok(ReloadOutcome::ok())
    }

    /// Cross-check one app's fragment against the live container.
    pub async fn validate(&self, app: &App) -> Result<FragmentStatus, ProxyError> {
        let mut status = FragmentStatus {
            subdomain: app.subdomain.clone(),
            exists: self.fragment_path(&app.subdomain).is_file(),
            syntactically_valid: false,
            upstream_container_exists: false,
            upstream_running: false,
            issues: Vec::new(),
        };
        if !status.exists {
            status.issues.push("fragment file missing".to_string());
        }

        let test = self
            .engine
            .exec(&self.proxy_container, &["nginx", "-t"])
            .await?;
        status.syntactically_valid = test.success();
        if !test.success() {
            status.issues.push("nginx config test failed".to_string());
        }

        let expected_name = app.container_name();
        let containers = self.engine.list_app_containers().await?;
        match containers.iter().find(|c| c.name == expected_name) {
            Some(container) => {
                status.upstream_container_exists = true;
                status.upstream_running = container.running;
                if !container.running {
                    status.issues.push("upstream container not running".to_string());
                }
                if container.subdomain() != Some(app.subdomain.as_str()) {
                    status
                        .issues
                        .push("upstream container subdomain label mismatch".to_string());
                    status.upstream_container_exists = false;
                }
            }
            None => {
                status
                    .issues
                    .push(format!("no container named {expected_name}"));
            }
        }
        Ok(status)
    }

    /// Batch validation for the request surface.
    pub async fn configs_status(&self, apps: &[App]) -> Result<Vec<FragmentStatus>, ProxyError> {
        let mut out = Vec::with_capacity(apps.len());
        for app in apps {
            out.push(self.validate(app).await?);
        }
        Ok(out)
    }

    /// What lives in the fragment directory right now.
    pub fn list_fragments(&self) -> FragmentListing {
        let mut listing = FragmentListing::default();
        let Ok(entries) = std::fs::read_dir(&self.fragment_dir) else {
            return listing;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".conf") {
                continue;
            }
            if self.is_system(&name) {
                listing.system_fragments.push(name);
            } else {
                listing
                    .app_fragments
                    .push(name.trim_end_matches(".conf").to_string());
            }
        }
        listing.app_fragments.sort();
        listing.system_fragments.sort();
        listing
    }

    /// Delete app fragments whose subdomain is not in `active`. System
    /// fragments are never removed. Reloads once when anything was
    /// deleted.
    pub async fn cleanup(
        &self,
        active: &HashSet<String>,
    ) -> Result<Vec<String>, ProxyError> {
        let listing = self.list_fragments();
        let mut removed = Vec::new();
        for subdomain in listing.app_fragments {
            if !active.contains(&subdomain) {
                self.remove_file_only(&subdomain);
                removed.push(subdomain);
            }
        }
        if !removed.is_empty() {
            let outcome = self.reload().await?;
            if !outcome.valid {
                warn!(errors = ?outcome.errors, "reload after cleanup reported invalid config");
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::{AppStatus, BaseImageChoice};
    use crate::engine::{MockEngine, StartSpec};
    use chrono::Utc;

    fn test_app(id: i64, subdomain: &str) -> App {
        App {
            id,
            owner_id: 1,
            name: subdomain.to_string(),
            git_url: "https://example.com/repo".to_string(),
            branch: "main".to_string(),
            entry_file: "app.py".to_string(),
            base_image_choice: BaseImageChoice::Auto,
            custom_base_image: None,
            custom_overlay: None,
            credential_id: None,
            env_vars: vec![],
            subdomain: subdomain.to_string(),
            status: AppStatus::Running,
            container_id: None,
            image_tag: None,
            build_task_id: None,
            deploy_task_id: None,
            stop_task_id: None,
            is_public: false,
            last_deployed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn manager(engine: Arc<MockEngine>, dir: &Path) -> ProxyManager {
        ProxyManager::new(
            dir.to_path_buf(),
            "test-nginx".to_string(),
            vec!["default.conf".to_string(), "upstreams.conf".to_string()],
            engine,
            Duration::from_secs(10),
        )
    }

    #[test]
    fn fragment_template_is_deterministic_and_complete() {
        let a = ProxyManager::render_fragment("zone-cleaner-7");
        let b = ProxyManager::render_fragment("zone-cleaner-7");
        assert_eq!(a, b);
        assert!(a.contains("location /zone-cleaner-7/ {"));
        assert!(a.contains("proxy_pass http://app-zone-cleaner-7:8501/;"));
        assert!(a.contains("proxy_http_version 1.1;"));
        assert!(a.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(a.contains("proxy_set_header Connection \"upgrade\";"));
        assert!(a.contains("proxy_buffering off;"));
        assert!(a.contains("proxy_read_timeout 86400;"));
        assert!(a.contains("X-Forwarded-For"));
        assert!(a.contains("X-Forwarded-Proto"));
    }

    #[tokio::test]
    async fn write_creates_fragment_and_reloads() {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let proxy = manager(engine.clone(), dir.path());
        let app = test_app(7, "zone-cleaner-7");

        let outcome = proxy.write(&app).await.unwrap();
        assert!(outcome.valid);
        assert!(proxy.fragment_path("zone-cleaner-7").is_file());
        assert_eq!(engine.reload_count(), 1);
    }

    #[tokio::test]
    async fn rewrite_identical_fragment_still_reloads_once_per_write() {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let proxy = manager(engine.clone(), dir.path());
        let app = test_app(7, "zone-cleaner-7");

        proxy.write(&app).await.unwrap();
        let before = std::fs::metadata(proxy.fragment_path("zone-cleaner-7"))
            .unwrap()
            .modified()
            .unwrap();
        proxy.write(&app).await.unwrap();
        let after = std::fs::metadata(proxy.fragment_path("zone-cleaner-7"))
            .unwrap()
            .modified()
            .unwrap();
        // File untouched, but each write reloaded exactly once
        assert_eq!(before, after);
        assert_eq!(engine.reload_count(), 2);
    }

    #[tokio::test]
    async fn reload_reports_invalid_config() {
        let engine = Arc::new(MockEngine::new());
        engine
            .fail_nginx_test
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let dir = tempfile::tempdir().unwrap();
        let proxy = manager(engine.clone(), dir.path());

        let outcome = proxy.reload().await.unwrap();
        assert!(!outcome.valid);
        assert!(!outcome.errors.is_empty());
        // A failing test must not be followed by a reload signal
        assert_eq!(engine.reload_count(), 0);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_protects_system_files() {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let proxy = manager(engine.clone(), dir.path());
        let app = test_app(7, "zone-cleaner-7");

        proxy.write(&app).await.unwrap();
        proxy.remove("zone-cleaner-7").await.unwrap();
        assert!(!proxy.fragment_path("zone-cleaner-7").is_file());
        // Second remove of a missing fragment is fine
        proxy.remove("zone-cleaner-7").await.unwrap();

        let err = proxy.remove("default").await.unwrap_err();
        assert!(matches!(err, ProxyError::Protected(_)));
    }

    #[tokio::test]
    async fn cleanup_spares_active_and_system_fragments() {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let proxy = manager(engine.clone(), dir.path());

        proxy.write(&test_app(7, "live-7")).await.unwrap();
        proxy.write(&test_app(9, "dead-9")).await.unwrap();
        std::fs::write(dir.path().join("default.conf"), "# system\n").unwrap();

        let active: HashSet<String> = ["live-7".to_string()].into();
        let removed = proxy.cleanup(&active).await.unwrap();
        assert_eq!(removed, vec!["dead-9".to_string()]);
        assert!(proxy.fragment_path("live-7").is_file());
        assert!(dir.path().join("default.conf").is_file());
        assert!(!proxy.fragment_path("dead-9").is_file());
    }

    #[tokio::test]
    async fn validate_cross_checks_container_and_labels() {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let proxy = manager(engine.clone(), dir.path());
        let app = test_app(7, "zone-cleaner-7");

        // No fragment, no container
        let status = proxy.validate(&app).await.unwrap();
        assert!(!status.exists);
        assert!(!status.upstream_container_exists);
        assert!(!status.healthy());

        proxy.write(&app).await.unwrap();
        engine
            .insert_container(
                "app-zone-cleaner-7",
                "app:tag",
                StartSpec::platform_labels(7, "zone-cleaner-7", "zone-cleaner-7", "app:tag"),
            )
            .await;
        let status = proxy.validate(&app).await.unwrap();
        assert!(status.exists);
        assert!(status.upstream_container_exists);
        assert!(status.upstream_running);
        assert!(status.healthy(), "issues: {:?}", status.issues);
    }

    #[tokio::test]
    async fn validate_flags_label_mismatch() {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let proxy = manager(engine.clone(), dir.path());
        let app = test_app(7, "zone-cleaner-7");
        proxy.write(&app).await.unwrap();
        // Container exists under the right name but claims another subdomain
        engine
            .insert_container(
                "app-zone-cleaner-7",
                "app:tag",
                StartSpec::platform_labels(8, "other", "other-8", "app:tag"),
            )
            .await;
        let status = proxy.validate(&app).await.unwrap();
        assert!(!status.healthy());
        assert!(
            status
                .issues
                .iter()
                .any(|i| i.contains("label mismatch"))
        );
    }

    #[test]
    fn list_fragments_partitions_app_and_system() {
        let engine = Arc::new(MockEngine::new());
        let dir = tempfile::tempdir().unwrap();
        let proxy = manager(engine, dir.path());
        std::fs::write(dir.path().join("alpha-1.conf"), "x").unwrap();
        std::fs::write(dir.path().join("default.conf"), "x").unwrap();
        std::fs::write(dir.path().join("README.md"), "x").unwrap();

        let listing = proxy.list_fragments();
        assert_eq!(listing.app_fragments, vec!["alpha-1"]);
        assert_eq!(listing.system_fragments, vec!["default.conf"]);
    }
}
