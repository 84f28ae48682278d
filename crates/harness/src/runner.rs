//! Module runner: acquires build, server and pool, then runs a suite's tests

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::capture::OutputCapture;
use crate::client::{ClientPool, Session, SessionFactory};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::port::PortAllocator;
use crate::scope::{ScopeEntry, Scopes};
use crate::settings::{Settings, SettingsResolver};
use crate::stage::{BuildOutput, BuildStage, ServerStage};

const TEST_SEPARATOR: &str = "------------------------------";
const OUTPUT_FRAME: &str = "================================";

static PANIC_RECORDER: Once = Once::new();

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Per-suite options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Run the bundler instead of re-serving the previous artifact
    pub rebuild_required: bool,

    /// Start the static server
    pub server_required: bool,

    /// Overrides applied to the baseline settings document
    pub settings_json: Settings,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            rebuild_required: true,
            server_required: true,
            settings_json: Settings::new(),
        }
    }
}

impl TestConfig {
    pub fn without_rebuild(mut self) -> Self {
        self.rebuild_required = false;
        self
    }

    pub fn without_server(mut self) -> Self {
        self.server_required = false;
        self
    }

    pub fn with_settings(mut self, overrides: Settings) -> Self {
        self.settings_json = overrides;
        self
    }
}

/// Signature of a test body.
pub type TestFn<S> = for<'a> fn(TestInput<'a, S>) -> BoxFuture<'a, anyhow::Result<()>>;

/// A registered test and the number of clients it drives
pub struct TestCase<S: Session> {
    pub name: &'static str,
    pub run: TestFn<S>,
    pub clients: usize,
}

impl<S: Session> TestCase<S> {
    pub fn new(name: &'static str, run: TestFn<S>) -> Self {
        Self { name, run, clients: 0 }
    }

    pub fn requires_clients(mut self, clients: usize) -> Self {
        self.clients = clients;
        self
    }
}

impl<S: Session> Clone for TestCase<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            run: self.run,
            clients: self.clients,
        }
    }
}

impl<S: Session> std::fmt::Debug for TestCase<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("clients", &self.clients)
            .finish()
    }
}

/// An ordered set of tests sharing one build, server and pool.
pub struct TestSuite<S: Session> {
    pub name: &'static str,
    pub config: TestConfig,
    pub tests: Vec<TestCase<S>>,
}

impl<S: Session> TestSuite<S> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            config: TestConfig::default(),
            tests: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: TestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn test(mut self, case: TestCase<S>) -> Self {
        self.tests.push(case);
        self
    }

    /// Pool size needed to run every test in the suite
    pub fn max_clients(&self) -> usize {
        self.tests.iter().map(|t| t.clients).max().unwrap_or(0)
    }
}

/// Everything a test body gets to work with.
pub struct TestInput<'a, S: Session> {
    /// Present when the suite needs at least one client
    pub pool: Option<&'a mut ClientPool<S>>,
    pub build: &'a BuildOutput,
    /// Diagnostics, shown only if the test fails
    pub out: &'a mut OutputCapture,
    /// Port of the running server, if the suite started one
    pub server_port: Option<u16>,
}

impl<'a, S: Session> TestInput<'a, S> {
    /// Session `index` of the pool.
    pub fn client(&self, index: usize) -> anyhow::Result<&S> {
        let pool = self
            .pool
            .as_deref()
            .ok_or_else(|| anyhow!("no client pool; the test must require at least {} client(s)", index + 1))?;
        pool.client(index)
            .ok_or_else(|| anyhow!("client {} requested but the pool has {}", index, pool.len()))
    }

    pub fn pool(&mut self) -> anyhow::Result<&mut ClientPool<S>> {
        self.pool
            .as_deref_mut()
            .ok_or_else(|| anyhow!("no client pool; the test must require clients"))
    }

    pub fn server_port(&self) -> anyhow::Result<u16> {
        self.server_port
            .ok_or_else(|| anyhow!("the suite does not start a server"))
    }
}

/// Outcome of a single test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    /// Captured output, kept only for failures
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Outcome of one module run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleReport {
    pub module: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl ModuleReport {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TestResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// 0 if every test passed, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.failed() == 0 {
            0
        } else {
            1
        }
    }

    pub fn write_summary<W: Write>(&self, console: &mut W) -> std::io::Result<()> {
        writeln!(console, "-----")?;
        if self.failed() == 0 {
            return writeln!(console, "All tests passed!");
        }

        writeln!(console, "Failures:")?;
        for failure in self.failures() {
            writeln!(console, "     {} {}", failure.name, seconds(failure.duration_ms))?;
        }
        Ok(())
    }
}

/// Write every report as one pretty-printed JSON array.
pub fn write_results(path: &Path, reports: &[ModuleReport]) -> HarnessResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = serde_json::to_string_pretty(reports)?;
    std::fs::write(path, content)?;
    info!(path = %path.display(), modules = reports.len(), "results written");
    Ok(())
}

/// What a module run needs, resolved before anything is acquired.
#[derive(Debug, Clone)]
pub struct ModulePlan {
    pub module: &'static str,
    pub port: u16,
    pub rebuild_required: bool,
    pub server_required: bool,
    pub max_clients: usize,
    pub settings: Settings,
}

/// Runs suites against sessions produced by `F`.
///
/// The runner is shared by concurrent module runs; each run gets its own
/// port from the shared allocator and its own scratch directories.
pub struct TestRunner<F: SessionFactory> {
    config: Arc<HarnessConfig>,
    ports: Arc<PortAllocator>,
    factory: Arc<F>,
}

impl<F: SessionFactory> TestRunner<F> {
    pub fn new(config: Arc<HarnessConfig>, ports: Arc<PortAllocator>, factory: Arc<F>) -> Self {
        Self { config, ports, factory }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Resolve settings and take a port for `suite`.
    ///
    /// Fails with [`HarnessError::Config`] if the baseline settings cannot be
    /// read; nothing has been acquired at that point.
    pub fn plan(&self, suite: &TestSuite<F::Session>) -> HarnessResult<ModulePlan> {
        let resolver = SettingsResolver::new(self.config.settings_path());
        let settings = resolver.resolve(&suite.config.settings_json)?;
        let port = self.ports.allocate()?;

        Ok(ModulePlan {
            module: suite.name,
            port,
            rebuild_required: suite.config.rebuild_required,
            server_required: suite.config.server_required,
            max_clients: suite.max_clients(),
            settings,
        })
    }

    /// The build, server and pool entries for `plan`, in acquisition order.
    pub fn scope_entries(&self, plan: &ModulePlan) -> Vec<ScopeEntry> {
        let mut entries = Vec::with_capacity(3);

        let config = Arc::clone(&self.config);
        let settings = plan.settings.clone();
        let rebuild = plan.rebuild_required;
        entries.push(
            ScopeEntry::new("build", move |_: &Scopes| {
                async move { BuildStage::enter(&config, rebuild, &settings).await }.boxed()
            })
            .on_enter(|scopes| {
                match scopes.get::<BuildStage>() {
                    Some(build) if build.rebuilt() => info!("finished rebuilding"),
                    Some(_) => info!("finished copying built directory"),
                    None => return Err(HarnessError::MissingScope("build")),
                }
                Ok(())
            }),
        );

        if plan.server_required {
            let config = Arc::clone(&self.config);
            let port = plan.port;
            entries.push(
                ScopeEntry::new("server", move |scopes: &Scopes| {
                    async move {
                        let build = scopes
                            .get::<BuildStage>()
                            .ok_or(HarnessError::MissingScope("build"))?
                            .output();
                        ServerStage::start(
                            &config.server,
                            &config.project_root,
                            build.root(),
                            port,
                            build.log(),
                        )
                        .await
                    }
                    .boxed()
                })
                .on_enter(move |_| {
                    info!(port, "server initialized");
                    Ok(())
                }),
            );
        } else {
            entries.push(ScopeEntry::skip("server"));
        }

        if plan.max_clients > 0 {
            let factory = Arc::clone(&self.factory);
            let port = plan.port;
            let count = plan.max_clients;
            let parallelism = self.config.clients.parallelism;
            entries.push(
                ScopeEntry::new("pool", move |_: &Scopes| {
                    async move { ClientPool::connect(factory, port, count, parallelism).await }.boxed()
                })
                .on_enter(move |_| {
                    info!(count, "clients initialized");
                    Ok(())
                }),
            );
        } else {
            entries.push(ScopeEntry::skip("pool"));
        }

        entries
    }

    /// Run every test of `suite` in registration order, writing progress to
    /// `console`.
    ///
    /// Test failures end up in the report. Errors acquiring the build, server
    /// or pool are returned, after whatever was acquired has been released.
    pub async fn run_module<W: Write + Send>(
        &self,
        suite: &TestSuite<F::Session>,
        console: &mut W,
    ) -> HarnessResult<ModuleReport> {
        let started_at = Utc::now();
        let started = Instant::now();

        writeln!(console, "Running {} test(s).", suite.tests.len())?;
        for test in &suite.tests {
            writeln!(console, "\t{}:{}", suite.name, test.name)?;
        }

        let plan = self.plan(suite)?;
        writeln!(console, "{} using port {}", suite.name, plan.port)?;
        info!(
            module = suite.name,
            port = plan.port,
            clients = plan.max_clients,
            rebuild = plan.rebuild_required,
            server = plan.server_required,
            "starting module run"
        );

        let mut scopes = Scopes::enter(self.scope_entries(&plan)).await?;
        let results = execute(suite, &plan, &mut scopes, console).await;
        scopes.exit().await;
        let results = results?;

        let report = ModuleReport {
            module: suite.name.to_string(),
            port: plan.port,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            results,
        };
        report.write_summary(console)?;

        info!(
            module = suite.name,
            passed = report.passed(),
            failed = report.failed(),
            duration_ms = report.duration_ms,
            "module run finished"
        );
        Ok(report)
    }
}

async fn execute<S: Session, W: Write + Send>(
    suite: &TestSuite<S>,
    plan: &ModulePlan,
    scopes: &mut Scopes,
    console: &mut W,
) -> HarnessResult<Vec<TestResult>> {
    let build = scopes
        .get::<BuildStage>()
        .map(|stage| stage.output().clone())
        .ok_or(HarnessError::MissingScope("build"))?;
    let server_port = scopes.get::<ServerStage>().map(ServerStage::port);
    let mut results = Vec::with_capacity(suite.tests.len());
    install_panic_recorder();

    for test in &suite.tests {
        writeln!(console, "{TEST_SEPARATOR}")?;
        writeln!(console, "Running test [{}]", test.name)?;

        let mut pool = scopes.get_mut::<ClientPool<S>>();
        if let Some(pool) = pool.as_mut() {
            if let Err(e) = pool.reset().await {
                warn!(module = plan.module, test = test.name, error = %e, "pool reset failed, continuing");
                writeln!(console, "Reset failed!")?;
            }
        }

        let mut out = OutputCapture::new();
        let input = TestInput {
            pool,
            build: &build,
            out: &mut out,
            server_port,
        };

        debug!(module = plan.module, test = test.name, "running test");
        take_panic_trace();
        let started = Instant::now();
        let outcome = AssertUnwindSafe((test.run)(input)).catch_unwind().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:?}")),
            Err(panic) => {
                let mut message = format!("test panicked: {}", panic_message(panic.as_ref()));
                if let Some(trace) = take_panic_trace() {
                    message.push('\n');
                    message.push_str(&trace);
                }
                Some(message)
            }
        };

        let result = match error {
            None => {
                writeln!(console, "{} passed. ({})", test.name, seconds(duration_ms))?;
                TestResult {
                    name: test.name.to_string(),
                    success: true,
                    duration_ms,
                    output: None,
                    error: None,
                }
            }
            Some(error) => {
                let _ = writeln!(out, "{error}");
                error!(module = plan.module, test = test.name, duration_ms, "test failed");
                writeln!(console, "{} Failed! ({})", test.name, seconds(duration_ms))?;
                writeln!(console, "{OUTPUT_FRAME}")?;
                writeln!(console, "{} Produced stdout:", test.name)?;
                writeln!(console, "{out}")?;
                writeln!(console, "{OUTPUT_FRAME}")?;
                TestResult {
                    name: test.name.to_string(),
                    success: false,
                    duration_ms,
                    output: Some(out.into_string()),
                    error: Some(error),
                }
            }
        };
        results.push(result);
    }

    Ok(results)
}

/// Chain a panic hook that keeps the location and backtrace of the last
/// panic on the panicking thread. A test future that panics unwinds into
/// `catch_unwind` within the same poll, so the runner reads it back there.
fn install_panic_recorder() {
    PANIC_RECORDER.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unknown location".to_string());
            let trace = format!("at {location}\n{}", Backtrace::force_capture());
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn seconds(duration_ms: u64) -> String {
    format!("{:.3}s", Duration::from_millis(duration_ms).as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullSession;

    #[async_trait]
    impl Session for NullSession {
        fn port(&self) -> u16 {
            0
        }

        async fn logged_out(&mut self) -> HarnessResult<bool> {
            Ok(true)
        }

        async fn reset(&mut self) -> HarnessResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> HarnessResult<()> {
            Ok(())
        }
    }

    fn noop(_: TestInput<'_, NullSession>) -> BoxFuture<'_, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn result(name: &str, success: bool, duration_ms: u64) -> TestResult {
        TestResult {
            name: name.to_string(),
            success,
            duration_ms,
            output: None,
            error: None,
        }
    }

    fn report(results: Vec<TestResult>) -> ModuleReport {
        ModuleReport {
            module: "login".to_string(),
            port: 8000,
            started_at: Utc::now(),
            duration_ms: 10,
            results,
        }
    }

    #[test]
    fn test_config_defaults_and_partial_document() {
        let config = TestConfig::default();
        assert!(config.rebuild_required);
        assert!(config.server_required);
        assert!(config.settings_json.is_empty());

        let parsed: TestConfig = serde_json::from_str(r#"{"rebuild_required": false}"#).unwrap();
        assert!(!parsed.rebuild_required);
        assert!(parsed.server_required);
    }

    #[test]
    fn test_max_clients_across_tests() {
        let suite = TestSuite::new("post")
            .test(TestCase::new("a", noop))
            .test(TestCase::new("b", noop).requires_clients(2))
            .test(TestCase::new("c", noop).requires_clients(1));
        assert_eq!(suite.max_clients(), 2);

        let empty: TestSuite<NullSession> = TestSuite::new("empty");
        assert_eq!(empty.max_clients(), 0);
    }

    #[test]
    fn test_report_exit_code_and_summary() {
        let passing = report(vec![result("a", true, 5), result("b", true, 7)]);
        assert_eq!(passing.exit_code(), 0);
        let mut console = Vec::new();
        passing.write_summary(&mut console).unwrap();
        assert_eq!(String::from_utf8(console).unwrap(), "-----\nAll tests passed!\n");

        let failing = report(vec![result("a", true, 5), result("b", false, 1500)]);
        assert_eq!(failing.exit_code(), 1);
        assert_eq!(failing.passed(), 1);
        assert_eq!(failing.failures().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["b"]);
        let mut console = Vec::new();
        failing.write_summary(&mut console).unwrap();
        assert_eq!(
            String::from_utf8(console).unwrap(),
            "-----\nFailures:\n     b 1.500s\n"
        );
    }

    #[test]
    fn test_write_results_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("results.json");
        write_results(&path, &[report(vec![result("a", false, 1)])]).unwrap();

        let written: Vec<ModuleReport> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].module, "login");
        assert_eq!(written[0].exit_code(), 1);
    }

    #[test]
    fn test_panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(format!("formatted {}", 3));
        assert_eq!(panic_message(payload.as_ref()), "formatted 3");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_panic_trace_names_location() {
        install_panic_recorder();
        take_panic_trace();

        let caught = std::panic::catch_unwind(|| panic!("deliberate"));
        assert!(caught.is_err());

        let trace = take_panic_trace().expect("panic was not recorded");
        assert!(trace.starts_with("at "), "{trace}");
        assert!(trace.contains("runner.rs"), "{trace}");
        assert!(take_panic_trace().is_none());
    }
}
