//! Harness configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::webdriver::WebDriverConfig;
use crate::error::HarnessResult;
use crate::poll::PollPolicy;
use crate::port::DEFAULT_BASE_PORT;

/// Default configuration file name, looked up relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "harness.toml";

/// Harness configuration
///
/// Relative paths are resolved against `project_root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Repository root the app is built from
    pub project_root: PathBuf,

    /// Application sources, copied into each module's scratch context
    pub source_dir: PathBuf,

    /// Last build output, copied (and optionally rebuilt) per module
    pub dist_dir: PathBuf,

    /// Baseline settings document
    pub settings_file: PathBuf,

    /// Shared subprocess log, opened in append mode
    pub log_file: PathBuf,

    /// TLS certificate the static server expects next to the artifact
    pub certificate: PathBuf,

    /// Parent directory for artifact scratch dirs (system temp if unset)
    pub scratch_dir: Option<PathBuf>,

    /// First server port handed out
    pub base_port: u16,

    pub build: BuildConfig,

    pub server: ServerConfig,

    pub clients: ClientConfig,

    pub webdriver: WebDriverConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            source_dir: PathBuf::from("src"),
            dist_dir: PathBuf::from("dist"),
            settings_file: PathBuf::from("dist/settings.json"),
            log_file: PathBuf::from("subprocess_output.log"),
            certificate: PathBuf::from("test/lib/localhost.pem"),
            scratch_dir: None,
            base_port: DEFAULT_BASE_PORT,
            build: BuildConfig::default(),
            server: ServerConfig::default(),
            clients: ClientConfig::default(),
            webdriver: WebDriverConfig::default(),
        }
    }
}

/// External build pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Bundler executable
    pub program: String,

    /// Arguments placed before `--context` / `--output-path`
    pub args: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: "webpack".to_string(),
            args: Vec::new(),
        }
    }
}

/// External static server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server executable, resolved from the project root
    pub program: String,

    /// Arguments placed before `--dir` / `--port`
    pub args: Vec<String>,

    /// Fixed wait after spawning, before any readiness probe
    pub settle_ms: u64,

    /// Poll the port after settling
    pub readiness_probe: bool,

    /// Bound on the readiness probe
    pub startup_timeout_secs: u64,

    pub poll_interval_ms: u64,

    /// How long to wait after SIGINT before killing the group
    pub stop_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: "./build.py".to_string(),
            args: vec!["--no-build".to_string(), "--serve".to_string()],
            settle_ms: 1000,
            readiness_probe: true,
            startup_timeout_secs: 30,
            poll_interval_ms: 100,
            stop_grace_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn readiness(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.startup_timeout_secs),
        )
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Client pool construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum number of sessions started at once
    pub parallelism: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { parallelism: 8 }
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> HarnessResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Resolve a configured path against the project root
    pub fn path(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.project_root.join(relative)
        }
    }

    pub fn source_path(&self) -> PathBuf {
        self.path(&self.source_dir)
    }

    pub fn dist_path(&self) -> PathBuf {
        self.path(&self.dist_dir)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.path(&self.settings_file)
    }

    pub fn log_path(&self) -> PathBuf {
        self.path(&self.log_file)
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.path(&self.certificate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = HarnessConfig::load(Path::new("/nonexistent/harness.toml")).unwrap();
        assert_eq!(config.base_port, 8000);
        assert_eq!(config.server.settle_ms, 1000);
        assert_eq!(config.build.program, "webpack");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(
            &path,
            r#"
project_root = "/srv/app"
base_port = 9100

[server]
settle_ms = 250
readiness_probe = false

[webdriver]
headless = false
"#,
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.base_port, 9100);
        assert_eq!(config.server.settle(), Duration::from_millis(250));
        assert!(!config.server.readiness_probe);
        assert_eq!(config.server.program, "./build.py");
        assert!(!config.webdriver.headless);
        assert_eq!(config.source_path(), PathBuf::from("/srv/app/src"));
        assert_eq!(
            config.path(Path::new("/abs/cert.pem")),
            PathBuf::from("/abs/cert.pem")
        );
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "base_port = \"eight thousand\"").unwrap();

        let err = HarnessConfig::load(&path).unwrap_err();
        assert!(matches!(err, HarnessError::Toml(_)));
        assert!(err.to_string().starts_with("TOML error"));
    }
}
