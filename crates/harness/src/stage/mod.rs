//! Build and server stages of a module run

pub mod build;
pub mod log;
pub mod server;

pub use build::{BuildOutput, BuildStage};
pub use log::LogSink;
pub use server::ServerStage;
