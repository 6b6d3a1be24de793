//! Helpers shared by the unit tests: scratch directories and fake converters.

use std::path::{Path, PathBuf};

use crate::command::ConverterCommand;

pub struct TestDir {
    inner: tempfile::TempDir,
}

impl TestDir {
    pub fn new() -> Self {
        TestDir {
            inner: tempfile::TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn write(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

/// A converter backed by a shell script. Positional arguments arrive as
/// `$1` (input), then either `$2` (output) or the sub-command and its args.
pub fn fake_converter(dir: &TestDir, name: &str, body: &str) -> ConverterCommand {
    let script = dir.write(name, format!("#!/bin/sh\n{body}\n").as_bytes());
    ConverterCommand::new("sh", vec![script.to_string_lossy().into_owned()])
}
