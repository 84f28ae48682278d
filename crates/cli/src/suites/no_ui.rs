//! Headless client logic driven through the mocked UI test page
//!
//! Reuses the previous artifact and drops a script into the served copy, so
//! nothing is rebuilt.

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{bail, Context};
use futures::future::BoxFuture;
use futures::FutureExt;

use ephemeral_harness::{TestCase, TestConfig, TestInput, WebDriverSession};

use super::Suite;

const SUCCESS_MARKER: &str = "[TEST] SUCCESS";
const LOG_POLLS: usize = 10;
const LOG_POLL_INTERVAL: Duration = Duration::from_secs(1);

const MOCKED_CLIENT_SCRIPT: &str = r#"
(async () => {
    sessionStorage.setItem("name", "guest");
    sessionStorage.setItem("idmgmt", "guest");
    const mockedClient = test.newMockedClient({});
    await mockedClient.client.setupWaiter;
    console.log("[TEST] '" + mockedClient.client.identity.name + "'");
    console.log("[TEST] " + mockedClient.client.identity.id);
    console.log(JSON.stringify(mockedClient.client.identity));
    await mockedClient.client.postCB("hi", null);
    const calls = mockedClient.mockUI.recordedCalls
    const renderPostCalls = calls.get("renderPost");
    if (renderPostCalls.length != 1)
        throw new Error("expected exactly one renderPost call");
    console.log("[TEST] " + renderPostCalls[0][0]);
    console.log("[TEST] SUCCESS");
})();
"#;

pub fn suite() -> Suite {
    Suite::new("no_ui")
        .with_config(TestConfig::default().without_rebuild())
        .test(TestCase::new("test_no_ui_client", no_ui_client).requires_clients(1))
}

fn no_ui_client(mut input: TestInput<'_, WebDriverSession>) -> BoxFuture<'_, anyhow::Result<()>> {
    async move {
        let script = input.build.artifact_dir().join("test").join("mytest.js");
        std::fs::write(&script, MOCKED_CLIENT_SCRIPT)
            .with_context(|| format!("writing {}", script.display()))?;

        let mut seen = Vec::new();
        let found = {
            let guest = input.client(0)?;
            guest.reset_state().await?;
            guest.navigate(&guest.url_for("/dist/test/test.html")).await?;
            guest.capture_console().await?;
            guest.execute("import('./mytest.js');", Vec::new()).await?;

            let mut found = false;
            for _ in 0..LOG_POLLS {
                let logs = guest.console_entries().await?;
                found = logs.iter().any(|log| log.message.contains(SUCCESS_MARKER));
                seen.extend(logs);
                if found {
                    break;
                }
                tokio::time::sleep(LOG_POLL_INTERVAL).await;
            }
            found
        };

        for log in &seen {
            writeln!(input.out, "{} {}", log.level, log.message)?;
        }
        if !found {
            bail!("page never logged {SUCCESS_MARKER:?}");
        }
        Ok(())
    }
    .boxed()
}
