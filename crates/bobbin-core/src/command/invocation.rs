//! What a callable sees when it is invoked.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Echo {
    Stdout,
    Stderr,
}

/// In-memory output stream.
///
/// Clones share the same buffer. A tee sink also forwards every write to the
/// process stdout/stderr.
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    buffer: Arc<Mutex<Vec<u8>>>,
    echo: Option<Echo>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tee_stdout() -> Self {
        Self {
            echo: Some(Echo::Stdout),
            ..Self::default()
        }
    }

    pub fn tee_stderr() -> Self {
        Self {
            echo: Some(Echo::Stderr),
            ..Self::default()
        }
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
        // the captured copy is authoritative; echo is best-effort
        let _ = match self.echo {
            Some(Echo::Stdout) => io::stdout().write_all(bytes),
            Some(Echo::Stderr) => io::stderr().write_all(bytes),
            None => Ok(()),
        };
    }

    pub fn write_line(&self, line: &str) {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write_bytes(&bytes);
    }

    /// Drain everything written so far.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Where a command executes and where its output goes.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub workdir: PathBuf,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl ExecContext {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            stdout: OutputSink::new(),
            stderr: OutputSink::new(),
        }
    }
}

/// Arguments and streams handed to a native callable.
///
/// `args` and `kwargs` are copies; the command's stored values are never
/// touched, so a command can be run again with the same inputs.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub workdir: PathBuf,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl Invocation {
    /// Decode positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, CommandError> {
        let value = self.args.get(index).ok_or_else(|| {
            CommandError::InvalidArgument(format!(
                "missing positional argument {index} (got {})",
                self.args.len()
            ))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| CommandError::InvalidArgument(format!("argument {index}: {e}")))
    }

    /// Decode keyword argument `name`, if present.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CommandError> {
        self.kwargs
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| CommandError::InvalidArgument(format!("keyword '{name}': {e}")))
            })
            .transpose()
    }

    pub fn println(&self, line: impl AsRef<str>) {
        self.stdout.write_line(line.as_ref());
    }

    pub fn eprintln(&self, line: impl AsRef<str>) {
        self.stderr.write_line(line.as_ref());
    }
}
