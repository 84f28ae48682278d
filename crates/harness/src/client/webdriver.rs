//! WebDriver-backed browser sessions
//!
//! Each session owns its own `chromedriver` process and drives Chrome through
//! it with `thirtyfour`. On top of that sit the operations tests use against
//! the app: logging in and out, reading identity fields, and creating or
//! listing posts.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thirtyfour::prelude::*;
use thirtyfour::Capabilities;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::{Session, SessionFactory};
use crate::error::{HarnessError, HarnessResult};
use crate::poll::{poll_until, PollPolicy};
use crate::port::find_free_port;

/// Clears the per-user localforage database the app keeps in IndexedDB.
/// Runs as an async script so the command returns only once the clear has
/// settled; resolves to `null` or the error text.
const CLEAR_USER_DB: &str = r#"
const done = arguments[arguments.length - 1];
debug.localforage
    .createInstance({ name: arguments[0] })
    .clear()
    .then(() => done(null), (err) => done(String(err)));
"#;

const CLEAR_STORAGE: &str = "sessionStorage.clear(); localStorage.clear();";

/// Mirrors console output and uncaught errors into a page-global buffer.
const CAPTURE_CONSOLE: &str = r#"
if (!window.__harnessConsole) {
    window.__harnessConsole = [];
    const record = (level, args) =>
        window.__harnessConsole.push({ level, message: args.map(String).join(" ") });
    for (const level of ["log", "info", "warn", "error", "debug"]) {
        const original = console[level].bind(console);
        console[level] = (...args) => {
            record(level, args);
            original(...args);
        };
    }
    window.addEventListener("error", (e) => record("error", [e.message]));
    window.addEventListener("unhandledrejection", (e) => record("error", [e.reason]));
}
"#;

const DRAIN_CONSOLE: &str = r#"
const entries = window.__harnessConsole || [];
window.__harnessConsole = [];
return entries;
"#;

/// Configuration for browser sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriverConfig {
    pub driver_binary: String,
    pub headless: bool,
    /// Host the browser uses to reach the server
    pub host: String,
    /// Path of the app, opened when a session starts and after every reset
    pub app_path: String,
    /// Page under `app_path` the app moves to once logged in
    pub session_page: String,
    pub startup_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Wait after submitting the login form
    pub login_settle_ms: u64,
    /// Extra Chrome arguments
    pub browser_args: Vec<String>,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            driver_binary: "chromedriver".to_string(),
            headless: true,
            host: "localhost".to_string(),
            app_path: "/dist/".to_string(),
            session_page: "ephemeral.html".to_string(),
            startup_timeout_secs: 30,
            poll_interval_ms: 500,
            login_settle_ms: 1000,
            browser_args: Vec::new(),
        }
    }
}

impl WebDriverConfig {
    pub fn polling(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.startup_timeout_secs),
        )
    }

    fn capabilities(&self) -> Capabilities {
        let mut args = vec!["ignore-certificate-errors".to_string()];
        if self.headless {
            args.push("headless".to_string());
        }
        args.extend(self.browser_args.iter().cloned());

        let mut caps: Capabilities = DesiredCapabilities::chrome().into();
        caps.insert("acceptInsecureCerts".to_string(), json!(true));
        caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));
        caps
    }
}

/// How the login form acquires an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityMode {
    /// Ephemeral guest identity
    #[default]
    Guest,
    /// Create and persist a new identity
    CreateId,
    /// Reuse the identity stored under the given name
    ReuseId,
}

impl IdentityMode {
    fn element_id(&self) -> &'static str {
        match self {
            IdentityMode::Guest => "guest",
            IdentityMode::CreateId => "createid",
            IdentityMode::ReuseId => "reuseid",
        }
    }
}

/// Which part of the app a session is looking at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Login,
    Session,
    /// Any other page, such as the headless test page
    Elsewhere,
}

impl Page {
    fn classify(url: &str, app_url: &str, session_page: &str) -> Self {
        let Some(rest) = url.strip_prefix(app_url) else {
            return Page::Elsewhere;
        };
        let path = rest.split(['?', '#']).next().unwrap_or_default();
        match path {
            "" | "index.html" => Page::Login,
            p if p == session_page => Page::Session,
            _ => Page::Elsewhere,
        }
    }
}

/// What a reset has to undo for a session found on `page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResetPlan {
    logout: bool,
    clear_user_db: bool,
}

impl ResetPlan {
    fn for_page(page: Page) -> Self {
        let signed_in = page == Page::Session;
        Self {
            logout: signed_in,
            clear_user_db: signed_in,
        }
    }
}

/// A browser console entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: String,
    pub message: String,
}

/// A rendered post and the ids of its direct replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: String,
    pub contents: String,
    pub children: Vec<String>,
}

/// Launches one `chromedriver` per session.
#[derive(Debug, Clone)]
pub struct WebDriverFactory {
    config: WebDriverConfig,
    http: reqwest::Client,
}

impl WebDriverFactory {
    pub fn new(config: WebDriverConfig) -> HarnessResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl SessionFactory for WebDriverFactory {
    type Session = WebDriverSession;

    async fn create(&self, index: usize, port: u16) -> HarnessResult<WebDriverSession> {
        let driver_port = find_free_port()?;
        let chromedriver = Command::new(&self.config.driver_binary)
            .arg(format!("--port={driver_port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessError::WebDriver(format!("failed to spawn {}: {}", self.config.driver_binary, e))
            })?;

        let driver_url = format!("http://127.0.0.1:{driver_port}");
        let status_url = format!("{driver_url}/status");
        let http = &self.http;
        let status_url = &status_url;
        poll_until(
            &format!("webdriver for client {index}"),
            self.config.polling(),
            move || driver_ready(http, status_url),
        )
        .await?;

        let driver = WebDriver::new(driver_url.as_str(), self.config.capabilities()).await?;
        let mut session = WebDriverSession {
            index,
            port,
            driver: Some(driver),
            chromedriver: Some(chromedriver),
            config: self.config.clone(),
        };

        if let Err(e) = session.open_app().await {
            if let Err(close_err) = session.close().await {
                warn!(client = index, error = %close_err, "failed to close session after navigation error");
            }
            return Err(e);
        }

        info!(client = index, port, driver_port, "browser session ready");
        Ok(session)
    }
}

/// One browser session driven through its own `chromedriver`.
pub struct WebDriverSession {
    index: usize,
    port: u16,
    driver: Option<WebDriver>,
    chromedriver: Option<Child>,
    config: WebDriverConfig,
}

impl WebDriverSession {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Absolute URL of `path` on the server this session is bound to
    pub fn url_for(&self, path: &str) -> String {
        format!("https://{}:{}{}", self.config.host, self.port, path)
    }

    /// The underlying driver, for anything the helpers below do not cover
    pub fn driver(&self) -> HarnessResult<&WebDriver> {
        self.driver
            .as_ref()
            .ok_or_else(|| HarnessError::WebDriver(format!("client {} is closed", self.index)))
    }

    pub async fn navigate(&self, url: &str) -> HarnessResult<()> {
        debug!(client = self.index, url, "navigating");
        Ok(self.driver()?.goto(url).await?)
    }

    async fn open_app(&self) -> HarnessResult<()> {
        self.navigate(&self.url_for(&self.config.app_path)).await
    }

    pub async fn current_url(&self) -> HarnessResult<String> {
        Ok(self.driver()?.current_url().await?.to_string())
    }

    pub async fn page(&self) -> HarnessResult<Page> {
        let url = self.current_url().await?;
        let app_url = self.url_for(&self.config.app_path);
        Ok(Page::classify(&url, &app_url, &self.config.session_page))
    }

    pub async fn find_all(&self, css: &str) -> HarnessResult<Vec<WebElement>> {
        Ok(self.driver()?.find_all(By::Css(css)).await?)
    }

    /// First element matching `css`, or an error naming the selector
    pub async fn first(&self, css: &str) -> HarnessResult<WebElement> {
        self.find_all(css)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::WebDriver(format!("no element matches {css}")))
    }

    /// Run `script` in the page; `arguments[i]` maps to `args[i]`.
    pub async fn execute(&self, script: &str, args: Vec<Value>) -> HarnessResult<Value> {
        Ok(self.driver()?.execute(script, args).await?.convert::<Value>()?)
    }

    /// Run `script` and wait for it to call the callback passed as its last
    /// argument.
    pub async fn execute_async(&self, script: &str, args: Vec<Value>) -> HarnessResult<Value> {
        Ok(self
            .driver()?
            .execute_async(script, args)
            .await?
            .convert::<Value>()?)
    }

    /// Start recording console output on the current page. Navigation
    /// discards the recording.
    pub async fn capture_console(&self) -> HarnessResult<()> {
        self.execute(CAPTURE_CONSOLE, Vec::new()).await.map(drop)
    }

    /// Console entries recorded since the last call
    pub async fn console_entries(&self) -> HarnessResult<Vec<ConsoleEntry>> {
        let entries = self.execute(DRAIN_CONSOLE, Vec::new()).await?;
        Ok(serde_json::from_value(entries)?)
    }

    pub async fn is_logged_out(&self) -> HarnessResult<bool> {
        Ok(self.page().await? == Page::Login)
    }

    pub async fn login(&self, name: &str, mode: IdentityMode) -> HarnessResult<()> {
        if !self.is_logged_out().await? {
            return Err(HarnessError::WebDriver(format!(
                "client {} is already logged in",
                self.index
            )));
        }

        let field = self.first("input#name").await?;
        field.clear().await?;
        field.send_keys(name).await?;

        // The login form only registers the identity mode on the second click.
        let mode_selector = format!("#{}", mode.element_id());
        self.first(&mode_selector).await?.click().await?;
        self.first(&mode_selector).await?.click().await?;

        self.first("#start").await?.click().await?;
        sleep(Duration::from_millis(self.config.login_settle_ms)).await;

        if self.is_logged_out().await? {
            return Err(HarnessError::WebDriver(format!(
                "client {} is still on the login page after logging in as {}",
                self.index, name
            )));
        }
        debug!(client = self.index, name, ?mode, "logged in");
        Ok(())
    }

    pub async fn logout(&self) -> HarnessResult<()> {
        if self.page().await? != Page::Session {
            return Err(HarnessError::WebDriver(format!("client {} is not logged in", self.index)));
        }

        let mut logout_link = None;
        for link in self.find_all("a").await? {
            if link.text().await? == "Logout" {
                logout_link = Some(link);
                break;
            }
        }
        let logout_link =
            logout_link.ok_or_else(|| HarnessError::WebDriver("no Logout link on the page".into()))?;
        logout_link.click().await?;

        self.wait_logged_out().await
    }

    async fn wait_logged_out(&self) -> HarnessResult<()> {
        poll_until(
            &format!("client {} to log out", self.index),
            self.config.polling(),
            move || self.is_logged_out(),
        )
        .await
    }

    async fn field(&self, element_id: &str) -> HarnessResult<String> {
        if self.page().await? != Page::Session {
            return Err(HarnessError::WebDriver(format!(
                "client {} must be logged in to read #{}",
                self.index, element_id
            )));
        }
        let element = self.first(&format!("#{element_id}")).await?;
        Ok(element.text().await?)
    }

    pub async fn identity_id(&self) -> HarnessResult<String> {
        self.field("id").await
    }

    pub async fn name(&self) -> HarnessResult<String> {
        self.field("name").await
    }

    pub async fn peer_id(&self) -> HarnessResult<String> {
        self.field("peerid").await
    }

    pub async fn active_connections(&self) -> HarnessResult<String> {
        self.field("activeconnections").await
    }

    pub async fn total_connections(&self) -> HarnessResult<String> {
        self.field("totalconnections").await
    }

    /// Wait until the app has finished generating the identity.
    pub async fn wait_for_user_setup(&self) -> HarnessResult<()> {
        poll_until(
            &format!("client {} identity setup", self.index),
            self.config.polling(),
            move || async move { Ok(!self.identity_id().await?.contains('?')) },
        )
        .await
    }

    /// Submit a post through the top-level editor on the current page.
    pub async fn new_post(&self, contents: &str) -> HarnessResult<()> {
        let page = self.first("#page").await?;

        let mut editor = None;
        for candidate in self.find_all("#new-post").await? {
            if candidate.find(By::XPath("./..")).await?.element_id() == page.element_id() {
                editor = Some(candidate);
                break;
            }
        }
        let editor = editor.ok_or_else(|| HarnessError::WebDriver("post editor not found".into()))?;

        let textarea = editor.find(By::Css("textarea")).await?;
        textarea.send_keys(contents.replace('\n', "<br>").as_str()).await?;
        Ok(textarea.send_keys("\n").await?)
    }

    /// Every rendered post in document order.
    pub async fn posts(&self) -> HarnessResult<Vec<Post>> {
        let mut posts: Vec<Post> = Vec::new();

        for element in self.find_all(".post").await? {
            let Some(id) = element.attr("id").await? else {
                continue;
            };
            if posts.iter().any(|p| p.id == id) {
                continue;
            }

            let mut children = Vec::new();
            for child in element.find_all(By::Css(".post")).await? {
                // Only direct replies, not replies to replies.
                if child.find(By::XPath("./..")).await?.element_id() != element.element_id() {
                    continue;
                }
                if let Some(child_id) = child.attr("id").await? {
                    children.push(child_id);
                }
            }

            let contents = match element.find_all(By::Css(".post-contents")).await?.first() {
                Some(body) => body.text().await?,
                None => String::new(),
            };

            posts.push(Post { id, contents, children });
        }

        Ok(posts)
    }

    /// Return to the login page of a freshly loaded app with every kind of
    /// client-side storage cleared, wherever the session was left.
    pub async fn reset_state(&self) -> HarnessResult<()> {
        let page = self.page().await?;
        let plan = ResetPlan::for_page(page);
        debug!(client = self.index, ?page, ?plan, "resetting session");

        if plan.clear_user_db {
            // `debug.localforage` only exists on the session page.
            let name = self.name().await?;
            let failure = self.execute_async(CLEAR_USER_DB, vec![json!(name)]).await?;
            if let Some(reason) = failure.as_str() {
                return Err(HarnessError::Reset(format!(
                    "client {}: clearing data for {}: {}",
                    self.index, name, reason
                )));
            }
        }
        if plan.logout {
            self.logout().await?;
        }

        self.execute(CLEAR_STORAGE, Vec::new()).await?;
        self.open_app().await?;
        self.wait_logged_out().await
    }
}

#[async_trait]
impl Session for WebDriverSession {
    fn port(&self) -> u16 {
        self.port
    }

    async fn logged_out(&mut self) -> HarnessResult<bool> {
        self.is_logged_out().await
    }

    async fn reset(&mut self) -> HarnessResult<()> {
        self.reset_state().await
    }

    async fn close(&mut self) -> HarnessResult<()> {
        let quit = match self.driver.take() {
            Some(driver) => driver.quit().await.map_err(HarnessError::from),
            None => Ok(()),
        };

        if let Some(mut chromedriver) = self.chromedriver.take() {
            if let Err(e) = chromedriver.start_kill() {
                debug!(client = self.index, error = %e, "chromedriver already exited");
            }
            chromedriver.wait().await?;
        }

        quit
    }
}

async fn driver_ready(http: &reqwest::Client, status_url: &str) -> HarnessResult<bool> {
    match http.get(status_url).send().await {
        Ok(response) => {
            let status: Value = response.json().await?;
            Ok(status["value"]["ready"].as_bool().unwrap_or(false))
        }
        // Connection refused is expected while the driver is starting
        Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const APP: &str = "https://localhost:8003/dist/";

    #[test]
    fn test_capabilities_follow_config() {
        let headless = WebDriverConfig::default().capabilities();
        assert_eq!(headless["browserName"], json!("chrome"));
        assert_eq!(headless["acceptInsecureCerts"], json!(true));
        assert_eq!(
            headless["goog:chromeOptions"]["args"],
            json!(["ignore-certificate-errors", "headless"])
        );

        let headed = WebDriverConfig {
            headless: false,
            browser_args: vec!["window-size=800,600".to_string()],
            ..WebDriverConfig::default()
        }
        .capabilities();
        assert_eq!(
            headed["goog:chromeOptions"]["args"],
            json!(["ignore-certificate-errors", "window-size=800,600"])
        );
    }

    #[test_case("https://localhost:8003/dist/", Page::Login ; "app root")]
    #[test_case("https://localhost:8003/dist/index.html", Page::Login ; "index page")]
    #[test_case("https://localhost:8003/dist/?name=guest", Page::Login ; "root with query")]
    #[test_case("https://localhost:8003/dist/ephemeral.html", Page::Session ; "session page")]
    #[test_case("https://localhost:8003/dist/ephemeral.html#feed", Page::Session ; "session with fragment")]
    #[test_case("https://localhost:8003/dist/test/test.html", Page::Elsewhere ; "headless test page")]
    #[test_case("https://localhost:8004/dist/", Page::Elsewhere ; "other server")]
    #[test_case("about:blank", Page::Elsewhere ; "blank")]
    fn test_page_classification(url: &str, expected: Page) {
        assert_eq!(Page::classify(url, APP, "ephemeral.html"), expected);
    }

    #[test]
    fn test_reset_plan_only_signs_out_of_the_app() {
        let signed_in = ResetPlan::for_page(Page::Session);
        assert!(signed_in.logout && signed_in.clear_user_db);

        // The test page has no identity fields, so reset must not try to read
        // them before navigating back to the app.
        for page in [Page::Login, Page::Elsewhere] {
            let plan = ResetPlan::for_page(page);
            assert!(!plan.logout && !plan.clear_user_db, "{page:?}");
        }
    }

    #[test]
    fn test_identity_mode_buttons() {
        assert_eq!(IdentityMode::Guest.element_id(), "guest");
        assert_eq!(IdentityMode::CreateId.element_id(), "createid");
        assert_eq!(IdentityMode::ReuseId.element_id(), "reuseid");
    }

    #[test]
    fn test_console_entries_deserialize() {
        let entries: Vec<ConsoleEntry> = serde_json::from_value(json!([
            { "level": "log", "message": "[TEST] SUCCESS" },
            { "level": "error", "message": "boom" }
        ]))
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].message.contains("[TEST] SUCCESS"));
        assert_eq!(entries[1].level, "error");
    }

    #[test]
    fn test_clear_script_waits_on_callback() {
        assert!(CLEAR_USER_DB.contains("arguments[arguments.length - 1]"));
        assert!(CLEAR_USER_DB.contains(".then("));
    }
}
