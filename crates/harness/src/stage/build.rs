//! Build stage - isolated source/artifact copies and the external bundler

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::scope::Scoped;
use crate::settings::Settings;
use crate::stage::log::LogSink;

/// Name of the settings document inside the source tree.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// What a build hands to the server and to tests.
///
/// Cheap to clone; the scratch directories themselves stay owned by the
/// [`BuildStage`] that created them.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    log: LogSink,
    root: PathBuf,
    artifact_dir: PathBuf,
    source_dir: PathBuf,
}

impl BuildOutput {
    /// Shared subprocess log for this module run
    pub fn log(&self) -> &LogSink {
        &self.log
    }

    /// Directory the server serves; holds the artifact and the certificate
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The artifact copy, `<root>/<dist>`
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// The isolated source copy the bundler reads
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Where the resolved settings document was written
    pub fn settings_path(&self) -> PathBuf {
        self.source_dir.join(SETTINGS_FILE_NAME)
    }
}

/// Owns the scratch directories of one module run.
#[derive(Debug)]
pub struct BuildStage {
    output: BuildOutput,
    source_context: Option<TempDir>,
    artifact_root: Option<TempDir>,
    rebuilt: bool,
}

impl BuildStage {
    /// Copy sources and the last artifact into fresh scratch directories,
    /// write `settings` into the source copy, and run the bundler when
    /// `rebuild_required` is set.
    pub async fn enter(
        config: &HarnessConfig,
        rebuild_required: bool,
        settings: &Settings,
    ) -> HarnessResult<Self> {
        let log = LogSink::open(config.log_path())?;

        // The source context lives beside the real sources so the bundler
        // resolves the project's own dependencies from it.
        let source_context = tempfile::Builder::new()
            .prefix("src")
            .tempdir_in(&config.project_root)?;
        let artifact_root = match &config.scratch_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                tempfile::Builder::new().prefix("harness").tempdir_in(dir)?
            }
            None => tempfile::Builder::new().prefix("harness").tempdir()?,
        };

        let source = config.source_path();
        let dist = config.dist_path();
        let source_dir = source_context.path().join(leaf_name(&source)?);
        let artifact_dir = artifact_root.path().join(leaf_name(&dist)?);

        debug!(
            source = %source_dir.display(),
            artifact = %artifact_dir.display(),
            "creating isolated build context"
        );
        copy_tree_blocking(source, source_dir.clone()).await?;
        copy_tree_blocking(dist, artifact_dir.clone()).await?;

        let certificate = config.certificate_path();
        match certificate.file_name() {
            Some(name) if certificate.is_file() => {
                std::fs::copy(&certificate, artifact_root.path().join(name))?;
            }
            _ => warn!(path = %certificate.display(), "certificate not found, server may fail TLS setup"),
        }

        let settings_json = serde_json::to_string_pretty(settings)?;
        std::fs::write(source_dir.join(SETTINGS_FILE_NAME), settings_json)?;

        let output = BuildOutput {
            log,
            root: artifact_root.path().to_path_buf(),
            artifact_dir,
            source_dir,
        };

        if rebuild_required {
            run_build(config, source_context.path(), &output).await?;
        }

        Ok(Self {
            output,
            source_context: Some(source_context),
            artifact_root: Some(artifact_root),
            rebuilt: rebuild_required,
        })
    }

    pub fn output(&self) -> &BuildOutput {
        &self.output
    }

    /// Whether the bundler ran, as opposed to reusing the previous artifact
    pub fn rebuilt(&self) -> bool {
        self.rebuilt
    }

    /// Remove the scratch directories. Idempotent.
    pub fn remove(&mut self) -> HarnessResult<()> {
        let mut first_error = None;
        for dir in [self.artifact_root.take(), self.source_context.take()]
            .into_iter()
            .flatten()
        {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "failed to remove scratch directory");
                first_error.get_or_insert(HarnessError::Io(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Scoped for BuildStage {
    async fn release(&mut self) -> HarnessResult<()> {
        self.remove()
    }
}

async fn run_build(config: &HarnessConfig, context: &Path, output: &BuildOutput) -> HarnessResult<()> {
    let build = &config.build;
    let command_line = format!(
        "{} {} --context {} --output-path {}",
        build.program,
        build.args.join(" "),
        context.display(),
        output.artifact_dir.display()
    );
    info!(command = %command_line, "running build");
    output.log.note(&format!("$ {command_line}"))?;

    let status = Command::new(&build.program)
        .args(&build.args)
        .arg("--context")
        .arg(context)
        .arg("--output-path")
        .arg(&output.artifact_dir)
        .current_dir(&config.project_root)
        .stdin(Stdio::null())
        .stdout(output.log.stdio()?)
        .stderr(output.log.stdio()?)
        .status()
        .await
        .map_err(|e| HarnessError::Build(format!("failed to spawn {}: {}", build.program, e)))?;

    if !status.success() {
        return Err(HarnessError::Build(format!(
            "{} exited with {} (see {})",
            build.program,
            status,
            output.log.path().display()
        )));
    }

    Ok(())
}

fn leaf_name(path: &Path) -> HarnessResult<&std::ffi::OsStr> {
    path.file_name().ok_or_else(|| {
        HarnessError::InvalidConfig(format!("{} has no final path component", path.display()))
    })
}

/// [`copy_tree`] on the blocking pool, so concurrent module runs keep their
/// runtime workers free.
pub async fn copy_tree_blocking(from: PathBuf, to: PathBuf) -> HarnessResult<()> {
    tokio::task::spawn_blocking(move || copy_tree(&from, &to))
        .await
        .map_err(|e| HarnessError::Io(std::io::Error::other(e)))?
}

/// Recursively copy `from` to `to`, creating `to`.
pub fn copy_tree(from: &Path, to: &Path) -> HarnessResult<()> {
    for entry in WalkDir::new(from).follow_links(true) {
        let entry = entry.map_err(|e| {
            HarnessError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop while copying")),
            )
        })?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| HarnessError::Io(std::io::Error::other(e)))?;
        let target = to.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project() -> (TempDir, HarnessConfig) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/components")).unwrap();
        std::fs::write(root.join("src/index.ts"), "export {}").unwrap();
        std::fs::write(root.join("src/components/post.tsx"), "<Post/>").unwrap();
        std::fs::create_dir_all(root.join("dist")).unwrap();
        std::fs::write(root.join("dist/index.html"), "<html/>").unwrap();
        std::fs::write(root.join("dist/settings.json"), "{}").unwrap();
        std::fs::create_dir_all(root.join("test/lib")).unwrap();
        std::fs::write(root.join("test/lib/localhost.pem"), "cert").unwrap();

        let config = HarnessConfig {
            project_root: root.to_path_buf(),
            scratch_dir: Some(root.join("scratch")),
            ..HarnessConfig::default()
        };
        (dir, config)
    }

    fn settings() -> Settings {
        match json!({ "intervals": { "postRefresh": 10 } }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_copy_only_build_isolates_and_cleans_up() {
        let (dir, config) = project();
        let mut stage = BuildStage::enter(&config, false, &settings()).await.unwrap();
        let output = stage.output().clone();

        assert!(!stage.rebuilt());
        assert!(output.artifact_dir().join("index.html").is_file());
        assert!(output.root().join("localhost.pem").is_file());
        assert!(output.source_dir().join("components/post.tsx").is_file());
        assert!(output.root().starts_with(dir.path().join("scratch")));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(output.settings_path()).unwrap()).unwrap();
        assert_eq!(written["intervals"]["postRefresh"], json!(10));

        // Originals are untouched.
        assert!(!dir.path().join("src/settings.json").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("dist/settings.json")).unwrap(), "{}");

        stage.release().await.unwrap();
        assert!(!output.root().exists());
        assert!(!output.source_dir().exists());
        stage.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_stages_get_distinct_scratch() {
        let (_dir, config) = project();
        let (settings_a, settings_b) = (settings(), settings());
        let (a, b) = tokio::join!(
            BuildStage::enter(&config, false, &settings_a),
            BuildStage::enter(&config, false, &settings_b)
        );
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.output().root(), b.output().root());
        assert_ne!(a.output().source_dir(), b.output().source_dir());
        a.remove().unwrap();
        b.remove().unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_tree_copy_runs_off_the_runtime_thread() {
        let (dir, _config) = project();
        let target = dir.path().join("copy/src");
        let runtime_thread = std::thread::current().id();

        let copier = copy_tree_blocking(dir.path().join("src"), target.clone());
        let on_runtime = tokio::spawn(async move { std::thread::current().id() });
        let (copied, seen) = tokio::join!(copier, on_runtime);
        copied.unwrap();
        assert_eq!(seen.unwrap(), runtime_thread);
        assert_eq!(
            std::fs::read_to_string(target.join("components/post.tsx")).unwrap(),
            "<Post/>"
        );

        let missing = copy_tree_blocking(dir.path().join("absent"), dir.path().join("out")).await;
        assert!(matches!(missing, Err(HarnessError::Io(_))));
    }

    #[tokio::test]
    async fn test_failing_bundler_is_build_error() {
        let (_dir, mut config) = project();
        config.build.program = "sh".to_string();
        config.build.args = vec!["-c".to_string(), "echo bundling; exit 3".to_string(), "bundler".to_string()];

        let err = BuildStage::enter(&config, true, &settings()).await.unwrap_err();
        assert!(matches!(err, HarnessError::Build(_)), "{err}");

        let log = std::fs::read_to_string(config.log_path()).unwrap();
        assert!(log.contains("bundling"));
        assert_eq!(std::fs::read_dir(config.project_root.join("scratch")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_bundler_receives_isolated_paths() {
        let (_dir, mut config) = project();
        config.build.program = "sh".to_string();
        config.build.args = vec!["-c".to_string(), "echo \"bundler $@\"".to_string(), "bundler".to_string()];

        let mut stage = BuildStage::enter(&config, true, &settings()).await.unwrap();
        assert!(stage.rebuilt());

        let log = std::fs::read_to_string(config.log_path()).unwrap();
        let artifact = stage.output().artifact_dir().display().to_string();
        assert!(log.contains(&format!("--output-path {artifact}")), "{log}");
        assert!(log.contains("--context "), "{log}");
        stage.remove().unwrap();
    }
}
