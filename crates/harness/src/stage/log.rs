//! Shared subprocess log

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::HarnessResult;

/// Append-only log file that every subprocess of a module run writes into.
///
/// Clones share the same file handle, so build and server output interleave
/// into one stream. The file is never truncated.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogSink {
    pub fn open(path: impl Into<PathBuf>) -> HarnessResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one marker line, e.g. to label which module a block of output belongs to.
    pub fn note(&self, line: &str) -> HarnessResult<()> {
        let mut file = self.file.lock();
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    /// A handle suitable for a child's stdout or stderr.
    pub fn stdio(&self) -> HarnessResult<Stdio> {
        let file = self.file.lock().try_clone()?;
        Ok(Stdio::from(file))
    }
}
