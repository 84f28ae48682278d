//! Error types for the orchestration harness

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Settings document {path} is invalid: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("Invalid harness configuration: {0}")]
    InvalidConfig(String),

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Server failed to start: {0}")]
    ServerStart(String),

    #[error("Client setup failed: {0}")]
    ClientSetup(String),

    #[error("Client reset failed: {0}")]
    Reset(String),

    #[error("WebDriver error: {0}")]
    WebDriver(String),

    #[error("Scope '{0}' is not available")]
    MissingScope(&'static str),

    #[error("Timeout waiting for {what} after {elapsed:?}")]
    Timeout { what: String, elapsed: Duration },

    #[error("Port range exhausted")]
    PortsExhausted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Browser error: {0}")]
    Browser(#[from] thirtyfour::error::WebDriverError),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
