//! Ephemeral E2E Orchestration Harness
//!
//! This crate stands up everything an end-to-end test module needs and tears
//! it down again, whatever happens in between:
//! - Copies sources and the last artifact into private scratch directories,
//!   injects the resolved settings document and optionally runs the bundler
//! - Serves the artifact from a static server in its own process group
//! - Connects a pool of WebDriver browser sessions concurrently
//! - Runs each registered test with its own output capture and reports
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TestRunner::run_module(suite)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  plan()          settings (baseline + overrides), port      │
//! │  Scopes::enter   ┌────────────┬─────────────┬─────────────┐ │
//! │                  │ BuildStage │ ServerStage │ ClientPool  │ │
//! │                  │ scratch +  │ process     │ N sessions, │ │
//! │                  │ bundler    │ group       │ concurrent  │ │
//! │                  └────────────┴─────────────┴─────────────┘ │
//! │  for test:       reset pool → run(TestInput) → record       │
//! │  Scopes::exit    pool → server → build (reverse order)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ModuleReport    per-test results, summary, exit code       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod poll;
pub mod port;
pub mod runner;
pub mod scope;
pub mod settings;
pub mod stage;

pub use capture::OutputCapture;
pub use client::{ClientPool, Session, SessionFactory, WebDriverFactory, WebDriverSession};
pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult};
pub use port::PortAllocator;
pub use runner::{
    write_results, ModuleReport, TestCase, TestConfig, TestFn, TestInput, TestResult, TestRunner,
    TestSuite,
};
pub use scope::{ScopeEntry, Scoped, Scopes};
pub use settings::{Settings, SettingsResolver};
pub use stage::{BuildOutput, BuildStage, ServerStage};
