//! Per-test output capture

use std::fmt;

/// Text a single test writes while it runs.
///
/// Each test gets its own buffer through its `TestInput`; the runner only
/// prints it when the test fails.
#[derive(Debug, Default, Clone)]
pub struct OutputCapture {
    buf: String,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

impl fmt::Write for OutputCapture {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.push_str(s);
        Ok(())
    }
}

impl fmt::Display for OutputCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_collects_written_text() {
        let mut out = OutputCapture::new();
        assert!(out.is_empty());
        writeln!(out, "hello {}", 1).unwrap();
        write!(out, "world").unwrap();
        assert_eq!(out.as_str(), "hello 1\nworld");
        assert_eq!(out.into_string(), "hello 1\nworld");
    }
}
