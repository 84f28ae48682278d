//! Self-checks of the harness wiring that need no browser or server

use anyhow::{ensure, Context};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};

use ephemeral_harness::{Settings, TestCase, TestConfig, TestInput, WebDriverSession};

use super::Suite;

const SELF_CHECK_KEY: &str = "harnessSelfCheck";

fn overrides() -> Settings {
    let mut settings = Settings::new();
    settings.insert(SELF_CHECK_KEY.to_string(), json!(true));
    settings
}

pub fn suite() -> Suite {
    Suite::new("harness")
        .with_config(
            TestConfig::default()
                .without_rebuild()
                .without_server()
                .with_settings(overrides()),
        )
        .test(TestCase::new("test_registry_lists_this_suite", registry_lists_this_suite))
        .test(TestCase::new("test_no_server_or_pool", no_server_or_pool))
        .test(TestCase::new("test_settings_reach_source_copy", settings_reach_source_copy))
}

fn registry_lists_this_suite(_: TestInput<'_, WebDriverSession>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        ensure!(
            super::all().iter().any(|suite| suite.name == "harness"),
            "harness suite is not registered"
        );
        Ok(())
    }
    .boxed()
}

fn no_server_or_pool(input: TestInput<'_, WebDriverSession>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        ensure!(input.pool.is_none(), "a pool was started for a suite without clients");
        ensure!(input.server_port.is_none(), "a server was started although not required");
        ensure!(input.client(0).is_err());
        Ok(())
    }
    .boxed()
}

fn settings_reach_source_copy(input: TestInput<'_, WebDriverSession>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        let path = input.build.settings_path();
        let written: Value = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )?;
        ensure!(written[SELF_CHECK_KEY] == json!(true), "override missing from {}", path.display());
        ensure!(
            path.starts_with(input.build.source_dir()),
            "settings written outside the isolated source copy"
        );
        Ok(())
    }
    .boxed()
}
