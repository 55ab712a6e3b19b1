//! Layered configuration for Gantry.
//!
//! Settings are read from `gantry.toml` (all sections optional, every field
//! has a default), then overridden by `GANTRY_*` environment variables for
//! the knobs an operator most often changes at deploy time.
//!
//! # Configuration File Format
//!
//! ```toml
//! [catalog]
//! db_path = "gantry.db"
//!
//! [engine]
//! endpoint = "unix:///var/run/docker.sock"
//! network = "gantry-apps"
//!
//! [paths]
//! base_dockerfiles = "base_dockerfiles"
//! workspaces = "workspaces"
//! proxy_fragments = "proxy_fragments"
//!
//! [proxy]
//! container = "gantry-nginx"
//! system_fragments = ["default.conf", "upstreams.conf"]
//!
//! [platform]
//! public_url = "http://localhost"
//! workers = 2
//!
//! [timeouts]
//! clone_secs = 120
//! build_secs = 1800
//! start_secs = 60
//! reload_secs = 10
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Catalog store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSection {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("gantry.db")
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Container engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Docker daemon endpoint. Only unix sockets are currently dialed;
    /// the value is recorded for diagnostics.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Shared network every app container joins.
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_endpoint() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_network() -> String {
    "gantry-apps".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            network: default_network(),
        }
    }
}

/// On-disk layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    /// Read-only directory holding `Dockerfile.<variant>` files.
    #[serde(default = "default_base_dockerfiles")]
    pub base_dockerfiles: PathBuf,
    /// Root under which per-task workspaces are created.
    #[serde(default = "default_workspaces")]
    pub workspaces: PathBuf,
    /// Watched proxy fragment directory.
    #[serde(default = "default_proxy_fragments")]
    pub proxy_fragments: PathBuf,
}

fn default_base_dockerfiles() -> PathBuf {
    PathBuf::from("base_dockerfiles")
}

fn default_workspaces() -> PathBuf {
    PathBuf::from("workspaces")
}

fn default_proxy_fragments() -> PathBuf {
    PathBuf::from("proxy_fragments")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dockerfiles: default_base_dockerfiles(),
            workspaces: default_workspaces(),
            proxy_fragments: default_proxy_fragments(),
        }
    }
}

/// Reverse-proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    /// Name of the nginx container that `nginx -t` / `nginx -s reload`
    /// are exec'd in.
    #[serde(default = "default_proxy_container")]
    pub container: String,
    /// Fragment filenames that cleanup must never remove.
    #[serde(default = "default_system_fragments")]
    pub system_fragments: Vec<String>,
}

fn default_proxy_container() -> String {
    "gantry-nginx".to_string()
}

fn default_system_fragments() -> Vec<String> {
    vec!["default.conf".to_string(), "upstreams.conf".to_string()]
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            container: default_proxy_container(),
            system_fragments: default_system_fragments(),
        }
    }
}

/// Platform-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSection {
    /// Base public URL apps are reachable under (path-prefixed).
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Task worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_public_url() -> String {
    "http://localhost".to_string()
}

fn default_workers() -> usize {
    2
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            public_url: default_public_url(),
            workers: default_workers(),
        }
    }
}

/// Operation timeouts, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_clone_secs")]
    pub clone_secs: u64,
    #[serde(default = "default_build_secs")]
    pub build_secs: u64,
    /// Container start plus health polling window.
    #[serde(default = "default_start_secs")]
    pub start_secs: u64,
    #[serde(default = "default_reload_secs")]
    pub reload_secs: u64,
}

fn default_clone_secs() -> u64 {
    120
}

fn default_build_secs() -> u64 {
    1800
}

fn default_start_secs() -> u64 {
    60
}

fn default_reload_secs() -> u64 {
    10
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            clone_secs: default_clone_secs(),
            build_secs: default_build_secs(),
            start_secs: default_start_secs(),
            reload_secs: default_reload_secs(),
        }
    }
}

/// The complete gantry.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GantryConfig {
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub platform: PlatformSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

impl GantryConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gantry.toml")
    }

    /// Load from the given file if it exists, otherwise defaults, then
    /// apply `GANTRY_*` environment overrides.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for deploy-time knobs.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("GANTRY_DB_PATH") {
            self.catalog.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GANTRY_DOCKER_NETWORK") {
            self.engine.network = v;
        }
        if let Ok(v) = std::env::var("GANTRY_WORKSPACES") {
            self.paths.workspaces = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GANTRY_PROXY_FRAGMENTS") {
            self.paths.proxy_fragments = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GANTRY_BASE_DOCKERFILES") {
            self.paths.base_dockerfiles = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GANTRY_PROXY_CONTAINER") {
            self.proxy.container = v;
        }
        if let Ok(v) = std::env::var("GANTRY_PUBLIC_URL") {
            self.platform.public_url = v;
        }
        if let Ok(v) = std::env::var("GANTRY_WORKERS")
            && let Ok(n) = v.parse::<usize>()
            && n > 0
        {
            self.platform.workers = n;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.platform.workers == 0 {
            warnings.push("platform.workers must be at least 1".to_string());
        }
        if self.timeouts.start_secs == 0 {
            warnings.push("timeouts.start_secs of 0 disables health polling".to_string());
        }
        for name in &self.proxy.system_fragments {
            if !name.ends_with(".conf") {
                warnings.push(format!(
                    "system fragment '{name}' does not end in .conf and will never match"
                ));
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_yields_defaults() {
        let config = GantryConfig::parse("").unwrap();
        assert_eq!(config.platform.workers, 2);
        assert_eq!(config.timeouts.clone_secs, 120);
        assert_eq!(config.timeouts.build_secs, 1800);
        assert_eq!(config.timeouts.start_secs, 60);
        assert_eq!(config.timeouts.reload_secs, 10);
        assert_eq!(config.engine.network, "gantry-apps");
        assert_eq!(
            config.proxy.system_fragments,
            vec!["default.conf", "upstreams.conf"]
        );
    }

    #[test]
    fn parse_partial_sections() {
        let content = r#"
[platform]
workers = 4

[timeouts]
build_secs = 600
"#;
        let config = GantryConfig::parse(content).unwrap();
        assert_eq!(config.platform.workers, 4);
        assert_eq!(config.timeouts.build_secs, 600);
        // Untouched fields keep defaults
        assert_eq!(config.timeouts.clone_secs, 120);
        assert_eq!(config.catalog.db_path, PathBuf::from("gantry.db"));
    }

    #[test]
    fn parse_proxy_section() {
        let content = r#"
[proxy]
container = "edge-nginx"
system_fragments = ["default.conf"]
"#;
        let config = GantryConfig::parse(content).unwrap();
        assert_eq!(config.proxy.container, "edge-nginx");
        assert_eq!(config.proxy.system_fragments, vec!["default.conf"]);
    }

    #[test]
    fn load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = GantryConfig::load_or_default(&dir.path().join("gantry.toml")).unwrap();
        assert_eq!(config.platform.workers, 2);
    }

    #[test]
    fn load_or_default_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.toml");
        std::fs::write(&path, "[engine]\nnetwork = \"apps-net\"\n").unwrap();
        let config = GantryConfig::load_or_default(&path).unwrap();
        assert_eq!(config.engine.network, "apps-net");
    }

    #[test]
    fn validate_flags_zero_workers() {
        let mut config = GantryConfig::default();
        config.platform.workers = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("workers"));
    }

    #[test]
    fn validate_flags_bad_system_fragment() {
        let mut config = GantryConfig::default();
        config.proxy.system_fragments.push("notaconf".to_string());
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("notaconf"));
    }

    #[test]
    fn validate_default_is_clean() {
        assert!(GantryConfig::default().validate().is_empty());
    }
}
