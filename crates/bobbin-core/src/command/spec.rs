//! Command specifications and how they resolve to code.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::registry::DEFAULT_ENTRY;
use super::script::Interpreters;
use crate::error::CommandError;

pub const MODULE_PREFIX: &str = ":mod:";
pub const FILE_PREFIX: &str = ":file:";

/// A function inside a registered module, e.g. `arith` / `Calculator.add`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub module: String,
    pub path: String,
}

impl Symbol {
    pub fn new(module: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            path: path.into(),
        }
    }
}

/// What a caller hands to `Command::build`.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandSpec {
    /// A plain function.
    Function(Symbol),
    /// A method bound to `receiver`; the receiver becomes the first argument.
    Method { receiver: Value, method: Symbol },
    /// A whole module, entered at `run`.
    Module(String),
    /// `"path_or_module@symbol"`.
    Path(String),
}

impl CommandSpec {
    /// Bind `method` to a serializable receiver.
    pub fn method(receiver: impl Serialize, method: Symbol) -> Result<Self, CommandError> {
        let receiver = serde_json::to_value(receiver)
            .map_err(|e| CommandError::InvalidArgument(format!("method receiver: {e}")))?;
        Ok(CommandSpec::Method { receiver, method })
    }

    pub fn module(name: impl Into<String>) -> Self {
        CommandSpec::Module(name.into())
    }
}

impl From<Symbol> for CommandSpec {
    fn from(symbol: Symbol) -> Self {
        CommandSpec::Function(symbol)
    }
}

impl From<&str> for CommandSpec {
    fn from(spec: &str) -> Self {
        CommandSpec::Path(spec.to_string())
    }
}

impl From<String> for CommandSpec {
    fn from(spec: String) -> Self {
        CommandSpec::Path(spec)
    }
}

/// Where a command's code lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum ModuleLocator {
    /// A module in the session's registry.
    Module(String),
    /// A script file on disk.
    Script(PathBuf),
}

impl fmt::Display for ModuleLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleLocator::Module(name) => write!(f, "{MODULE_PREFIX}{name}"),
            ModuleLocator::Script(path) => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for ModuleLocator {
    type Err = CommandError;

    /// `:mod:name` is a module, `:file:path` or a bare path is a script.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix(MODULE_PREFIX) {
            if name.is_empty() {
                return Err(CommandError::UnsupportedCommandSpec(s.to_string()));
            }
            return Ok(ModuleLocator::Module(name.to_string()));
        }
        let path = s.strip_prefix(FILE_PREFIX).unwrap_or(s);
        if path.is_empty() {
            return Err(CommandError::UnsupportedCommandSpec(s.to_string()));
        }
        Ok(ModuleLocator::Script(PathBuf::from(path)))
    }
}

/// Output of spec resolution, before the registry is consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub locator: ModuleLocator,
    pub entry: String,
    pub receiver: Option<Value>,
}

impl CommandSpec {
    /// Turn the spec into a locator and entry symbol.
    ///
    /// Relative script paths are anchored at `base`.
    pub fn resolve(&self, interpreters: &Interpreters, base: &Path) -> Result<Resolved, CommandError> {
        let mut resolved = match self {
            CommandSpec::Function(symbol) => Resolved {
                locator: ModuleLocator::Module(symbol.module.clone()),
                entry: symbol.path.clone(),
                receiver: None,
            },
            CommandSpec::Method { receiver, method } => Resolved {
                locator: ModuleLocator::Module(method.module.clone()),
                entry: method.path.clone(),
                receiver: Some(receiver.clone()),
            },
            CommandSpec::Module(name) => Resolved {
                locator: ModuleLocator::Module(name.clone()),
                entry: DEFAULT_ENTRY.to_string(),
                receiver: None,
            },
            CommandSpec::Path(spec) => {
                let unsupported = || CommandError::UnsupportedCommandSpec(spec.clone());
                let (left, symbol) = spec.split_once('@').ok_or_else(unsupported)?;
                if left.is_empty() || symbol.is_empty() || symbol.contains('@') {
                    return Err(unsupported());
                }
                let locator = if left.starts_with(MODULE_PREFIX) || left.starts_with(FILE_PREFIX) {
                    left.parse()?
                } else if interpreters.recognizes(left) {
                    ModuleLocator::Script(PathBuf::from(left))
                } else {
                    // not a script file: an importable module path
                    ModuleLocator::Module(left.to_string())
                };
                Resolved {
                    locator,
                    entry: symbol.to_string(),
                    receiver: None,
                }
            }
        };

        if resolved.entry.is_empty() || resolved.entry.split('.').any(str::is_empty) {
            return Err(CommandError::UnsupportedCommandSpec(resolved.entry));
        }

        if let ModuleLocator::Script(path) = &resolved.locator
            && path.is_relative()
        {
            resolved.locator = ModuleLocator::Script(base.join(path));
        }
        Ok(resolved)
    }
}
