//! Command: a persisted, replayable description of code plus arguments.
//!
//! - **static**: build 時にソースを store の blob として snapshot する。後からファイルを
//!   編集しても再実行には影響しない
//! - **dynamic**: locator だけを保存し、run のたびに解決し直す。投入後の編集が反映される

pub mod invocation;
pub mod registry;
pub mod script;
pub mod spec;

pub use invocation::{ExecContext, Invocation, OutputSink};
pub use registry::{Callable, DEFAULT_ENTRY, FnCallable, Module, ModuleRegistry, RegistryError};
pub use script::{Interpreter, Interpreters};
pub use spec::{CommandSpec, ModuleLocator, Symbol};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::CommandError;
use crate::ports::{FileHandle, FileRef};
use crate::session::Session;

/// Code reference: where the code lives plus an optional frozen copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRef {
    pub locator: ModuleLocator,
    pub snapshot: Option<FileRef>,
}

/// Calls a symbol from a module or script with stored arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCommand {
    code: CodeRef,
    entry: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    dynamic: bool,
}

/// Command variants. New kinds are added here without touching `Task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
    Function(FunctionCommand),
}

impl Command {
    pub const FUNCTION: &'static str = "function";

    /// Resolve `spec` into a function command.
    pub async fn build(
        session: &Session,
        spec: impl Into<CommandSpec>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        dynamic: bool,
    ) -> Result<Self, CommandError> {
        FunctionCommand::build(session, spec.into(), args, kwargs, dynamic)
            .await
            .map(Command::Function)
    }

    /// Factory keyed by command kind name.
    pub async fn of_kind(
        session: &Session,
        kind: &str,
        spec: impl Into<CommandSpec>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        dynamic: bool,
    ) -> Result<Self, CommandError> {
        match kind {
            Self::FUNCTION => Self::build(session, spec, args, kwargs, dynamic).await,
            other => Err(CommandError::UnknownCommandKind(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::Function(_) => Self::FUNCTION,
        }
    }

    pub fn args(&self) -> &[Value] {
        match self {
            Command::Function(cmd) => &cmd.args,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        match self {
            Command::Function(cmd) => cmd.dynamic,
        }
    }

    pub async fn run(&self, session: &Session, ctx: &ExecContext) -> Result<Value, CommandError> {
        match self {
            Command::Function(cmd) => cmd.run(session, ctx).await,
        }
    }

    /// Static commands write their snapshot into `dir`; dynamic ones do nothing.
    pub async fn copy_files_to(
        &self,
        session: &Session,
        dir: &Path,
    ) -> Result<Option<PathBuf>, CommandError> {
        match self {
            Command::Function(cmd) => cmd.copy_files_to(session, dir).await,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Function(cmd) => fmt::Display::fmt(cmd, f),
        }
    }
}

impl FunctionCommand {
    async fn build(
        session: &Session,
        spec: CommandSpec,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        dynamic: bool,
    ) -> Result<Self, CommandError> {
        let interpreters = &session.config().interpreters;
        let resolved = spec.resolve(interpreters, session.work_dir())?;

        // fail fast: an unresolvable spec never reaches a queue
        let source = match &resolved.locator {
            ModuleLocator::Module(name) => {
                let module = session.registry().require(name)?;
                if !module.is_script() && module.resolve(&resolved.entry).is_none() {
                    return Err(CommandError::UnknownSymbol {
                        module: name.clone(),
                        symbol: resolved.entry.clone(),
                    });
                }
                module.source_path().map(|p| session.work_dir().join(p))
            }
            ModuleLocator::Script(path) => {
                if !interpreters.recognizes(&path.to_string_lossy()) {
                    return Err(CommandError::NoInterpreter(path.display().to_string()));
                }
                Some(path.clone())
            }
        };

        let snapshot = match source {
            Some(path) if !dynamic => Some(snapshot_source(session, &path).await?),
            _ => None,
        };

        let mut all_args = Vec::with_capacity(args.len() + 1);
        all_args.extend(resolved.receiver);
        all_args.extend(args);

        Ok(Self {
            code: CodeRef {
                locator: resolved.locator,
                snapshot,
            },
            entry: resolved.entry,
            args: all_args,
            kwargs,
            dynamic,
        })
    }

    pub fn code(&self) -> &CodeRef {
        &self.code
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    async fn run(&self, session: &Session, ctx: &ExecContext) -> Result<Value, CommandError> {
        let interpreters = &session.config().interpreters;

        let script = match &self.code.locator {
            ModuleLocator::Script(path) => path.clone(),
            ModuleLocator::Module(name) => {
                let module = session.registry().require(name)?;
                match module.script_path() {
                    Some(path) => session.work_dir().join(path),
                    None => {
                        let callable = module.resolve(&self.entry).ok_or_else(|| {
                            CommandError::UnknownSymbol {
                                module: name.clone(),
                                symbol: self.entry.clone(),
                            }
                        })?;
                        debug!(module = %name, symbol = %self.entry, "calling native symbol");
                        return callable
                            .call(Invocation {
                                args: self.args.clone(),
                                kwargs: self.kwargs.clone(),
                                workdir: ctx.workdir.clone(),
                                stdout: ctx.stdout.clone(),
                                stderr: ctx.stderr.clone(),
                            })
                            .await;
                    }
                }
            }
        };

        match (&self.code.snapshot, self.dynamic) {
            (Some(snapshot), false) => {
                let source = session.store().read_file(snapshot.id).await?;
                script::run_snapshot(
                    interpreters,
                    &snapshot.name,
                    &source,
                    &self.entry,
                    &self.args,
                    &self.kwargs,
                    ctx,
                )
                .await
            }
            _ => {
                script::run_script(interpreters, &script, &self.entry, &self.args, &self.kwargs, ctx)
                    .await
            }
        }
    }

    async fn copy_files_to(
        &self,
        session: &Session,
        dir: &Path,
    ) -> Result<Option<PathBuf>, CommandError> {
        match (&self.code.snapshot, self.dynamic) {
            (Some(snapshot), false) => {
                let handle = FileHandle::new(Arc::clone(session.store()), snapshot.clone());
                Ok(Some(handle.to_disk(dir).await?))
            }
            _ => Ok(None),
        }
    }
}

impl fmt::Display for FunctionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = Value::Array(self.args.clone());
        write!(f, "{}@{}{}", self.code.locator, self.entry, args)
    }
}

async fn snapshot_source(session: &Session, path: &Path) -> Result<FileRef, CommandError> {
    let bytes = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".to_string());
    let file = session.store().create_file(&name, Some("utf-8")).await?;
    session.store().write_file(file.id, bytes).await?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Session {
        let registry = ModuleRegistry::new();
        registry
            .register(
                Module::native("arith")
                    .function("add", |inv| Ok(json!(inv.arg::<i64>(0)? + inv.arg::<i64>(1)?)))
                    .function("Calculator.scale", |inv| {
                        let calc: Value = inv.arg(0)?;
                        let factor = calc["factor"].as_i64().unwrap_or(1);
                        Ok(json!(factor * inv.arg::<i64>(1)?))
                    })
                    .function("run", |inv| {
                        inv.println("module entry");
                        Ok(json!("ran"))
                    })
                    .function("greet", |inv| {
                        let name: String = inv.kwarg("name")?.unwrap_or_else(|| "world".into());
                        Ok(json!(format!("hello {name}")))
                    }),
            )
            .unwrap();
        Session::in_memory(registry)
    }

    async fn run(session: &Session, cmd: &Command) -> Result<Value, CommandError> {
        let dir = tempfile::tempdir().unwrap();
        cmd.run(session, &ExecContext::new(dir.path())).await
    }

    #[tokio::test]
    async fn function_spec_runs_with_stored_args() {
        let session = session();
        let cmd = Command::build(&session, Symbol::new("arith", "add"), vec![json!(4), json!(5)], Map::new(), false)
            .await
            .unwrap();

        assert_eq!(run(&session, &cmd).await.unwrap(), json!(9));
        // repeatable: stored args untouched
        assert_eq!(run(&session, &cmd).await.unwrap(), json!(9));
        assert_eq!(cmd.args(), &[json!(4), json!(5)]);
    }

    #[tokio::test]
    async fn bound_method_prepends_receiver() {
        let session = session();
        let spec = CommandSpec::method(json!({ "factor": 3 }), Symbol::new("arith", "Calculator.scale"))
            .unwrap();
        let cmd = Command::build(&session, spec, vec![json!(7)], Map::new(), false)
            .await
            .unwrap();

        assert_eq!(cmd.args(), &[json!({ "factor": 3 }), json!(7)]);
        assert_eq!(run(&session, &cmd).await.unwrap(), json!(21));
    }

    #[tokio::test]
    async fn module_spec_enters_run() {
        let session = session();
        let cmd = Command::build(&session, CommandSpec::module("arith"), vec![], Map::new(), true)
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecContext::new(dir.path());

        assert_eq!(cmd.run(&session, &ctx).await.unwrap(), json!("ran"));
        assert_eq!(ctx.stdout.contents(), "module entry\n");
    }

    #[tokio::test]
    async fn module_path_string_and_kwargs() {
        let session = session();
        let kwargs = Map::from_iter([("name".to_string(), json!("bobbin"))]);
        let cmd = Command::build(&session, "arith@greet", vec![], kwargs, false)
            .await
            .unwrap();

        assert_eq!(run(&session, &cmd).await.unwrap(), json!("hello bobbin"));
        assert_eq!(cmd.to_string(), ":mod:arith@greet[]");
    }

    #[tokio::test]
    async fn build_fails_fast_on_bad_specs() {
        let session = session();

        let err = Command::build(&session, "nowhere", vec![], Map::new(), false).await.unwrap_err();
        assert!(matches!(err, CommandError::UnsupportedCommandSpec(_)));

        let err = Command::build(&session, "missing@add", vec![], Map::new(), false).await.unwrap_err();
        assert!(matches!(err, CommandError::ModuleNotFound(_)));

        let err = Command::build(&session, "arith@sub", vec![], Map::new(), false).await.unwrap_err();
        assert!(matches!(err, CommandError::UnknownSymbol { .. }));

        let err = Command::of_kind(&session, "shell", "arith@add", vec![], Map::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommandKind(kind) if kind == "shell"));
    }

    #[tokio::test]
    async fn dynamic_command_runs_replaced_module() {
        let session = session();
        let cmd = Command::build(&session, "arith@add", vec![json!(4), json!(5)], Map::new(), true)
            .await
            .unwrap();
        assert_eq!(run(&session, &cmd).await.unwrap(), json!(9));

        session.registry().replace(
            Module::native("arith")
                .function("add", |inv| Ok(json!(inv.arg::<i64>(0)? * inv.arg::<i64>(1)?))),
        );

        assert_eq!(run(&session, &cmd).await.unwrap(), json!(20));
    }

    #[tokio::test]
    async fn raised_errors_propagate_unchanged() {
        let registry = ModuleRegistry::new();
        registry
            .register(Module::native("bad").function("boom", |_| Err(CommandError::raised("boom"))))
            .unwrap();
        let session = Session::in_memory(registry);
        let cmd = Command::build(&session, "bad@boom", vec![], Map::new(), false)
            .await
            .unwrap();

        let err = run(&session, &cmd).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn command_survives_serialization() {
        let session = session();
        let cmd = Command::build(&session, Symbol::new("arith", "add"), vec![json!(1), json!(2)], Map::new(), true)
            .await
            .unwrap();

        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "function");
        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
        assert_eq!(run(&session, &back).await.unwrap(), json!(3));
    }
}
