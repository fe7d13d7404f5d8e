//! Script execution.
//!
//! A script symbol runs as a child process:
//! `<program> <args...> <script> <symbol> <arg>...` with the working
//! directory set to the task folder and kwargs as JSON in `BOBBIN_KWARGS`.
//! Scripts dispatch on their first argument (for `sh`, end the file with
//! `"$@"`). The last non-empty stdout line is the result: JSON when it parses,
//! a string otherwise.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::invocation::ExecContext;
use crate::error::CommandError;

pub const KWARGS_ENV: &str = "BOBBIN_KWARGS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interpreter {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Interpreter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// Script suffix (without the dot) to interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interpreters(BTreeMap<String, Interpreter>);

impl Default for Interpreters {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        map.insert("sh".to_string(), Interpreter::new("sh"));
        Self(map)
    }
}

impl Interpreters {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, suffix: &str, interpreter: Interpreter) {
        self.0
            .insert(suffix.trim_start_matches('.').to_string(), interpreter);
    }

    pub fn for_path(&self, path: &Path) -> Option<&Interpreter> {
        let suffix = path.extension()?.to_str()?;
        self.0.get(suffix)
    }

    /// Whether `path` ends in a recognized script suffix.
    pub fn recognizes(&self, path: &str) -> bool {
        self.for_path(Path::new(path)).is_some()
    }
}

fn render_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_result(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    match text.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string())),
        None => Value::Null,
    }
}

/// Run `symbol` from the script at `script`.
pub async fn run_script(
    interpreters: &Interpreters,
    script: &Path,
    symbol: &str,
    args: &[Value],
    kwargs: &Map<String, Value>,
    ctx: &ExecContext,
) -> Result<Value, CommandError> {
    let interpreter = interpreters
        .for_path(script)
        .ok_or_else(|| CommandError::NoInterpreter(script.display().to_string()))?;

    debug!(script = %script.display(), symbol, program = %interpreter.program, "running script");
    let output = tokio::process::Command::new(&interpreter.program)
        .args(&interpreter.args)
        .arg(script)
        .arg(symbol)
        .args(args.iter().map(render_arg))
        .env(KWARGS_ENV, Value::Object(kwargs.clone()).to_string())
        .current_dir(&ctx.workdir)
        .stdin(std::process::Stdio::null())
        .output()
        .await?;

    ctx.stdout.write_bytes(&output.stdout);
    ctx.stderr.write_bytes(&output.stderr);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string();
        return Err(CommandError::Script {
            script: script
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| script.display().to_string()),
            symbol: symbol.to_string(),
            status: output.status.to_string(),
            message,
        });
    }

    Ok(parse_result(&output.stdout))
}

/// Run `symbol` from script text held in memory (a static snapshot).
///
/// The text is written under its original file name into a scratch directory
/// so the interpreter sees the same suffix.
pub async fn run_snapshot(
    interpreters: &Interpreters,
    file_name: &str,
    source: &[u8],
    symbol: &str,
    args: &[Value],
    kwargs: &Map<String, Value>,
    ctx: &ExecContext,
) -> Result<Value, CommandError> {
    let scratch = tempfile::tempdir()?;
    let path = scratch.path().join(file_name);
    tokio::fs::write(&path, source).await?;
    run_script(interpreters, &path, symbol, args, kwargs, ctx).await
}
