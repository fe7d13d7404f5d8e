//! ModuleRegistry - コマンドが解決する「モジュール」の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object (`Arc<dyn Callable>`) の管理
//! - ドット区切りのシンボル (`Calculator.add`) を入れ子の namespace で表現
//! - `RwLock` による差し替え（dynamic command は実行時に最新のモジュールを引く）
//!
//! モジュールは 2 種類あります:
//! - **native**: Rust の関数を名前付きで登録したもの
//! - **script**: スクリプトファイルに名前を付けたもの（`:mod:` パスで参照できる）

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::invocation::Invocation;
use super::spec::Symbol;
use crate::error::CommandError;

/// Entry symbol used when a command is built from a whole module.
pub const DEFAULT_ENTRY: &str = "run";

/// Something a command can invoke.
#[async_trait]
pub trait Callable: Send + Sync {
    async fn call(&self, invocation: Invocation) -> Result<Value, CommandError>;
}

/// Adapter for plain synchronous closures.
pub struct FnCallable<F>(pub F);

#[async_trait]
impl<F> Callable for FnCallable<F>
where
    F: Fn(&Invocation) -> Result<Value, CommandError> + Send + Sync,
{
    async fn call(&self, invocation: Invocation) -> Result<Value, CommandError> {
        (self.0)(&invocation)
    }
}

#[derive(Default)]
struct Namespace {
    callables: HashMap<String, Arc<dyn Callable>>,
    children: HashMap<String, Namespace>,
}

impl Namespace {
    fn insert(&mut self, path: &str, callable: Arc<dyn Callable>) {
        match path.split_once('.') {
            Some((head, rest)) => self
                .children
                .entry(head.to_string())
                .or_default()
                .insert(rest, callable),
            None => {
                self.callables.insert(path.to_string(), callable);
            }
        }
    }

    /// Dotted traversal: every segment but the last names a nested namespace.
    fn get(&self, path: &str) -> Option<Arc<dyn Callable>> {
        match path.split_once('.') {
            Some((head, rest)) => self.children.get(head)?.get(rest),
            None => self.callables.get(path).cloned(),
        }
    }

    fn collect(&self, prefix: &str, out: &mut Vec<String>) {
        for name in self.callables.keys() {
            out.push(format!("{prefix}{name}"));
        }
        for (name, child) in &self.children {
            child.collect(&format!("{prefix}{name}."), out);
        }
    }
}

enum ModuleKind {
    Native {
        source: Option<PathBuf>,
        symbols: Namespace,
    },
    Script(PathBuf),
}

/// A named unit of code.
///
/// # 使用例
/// ```ignore
/// let arith = Module::native("arith")
///     .function("add", |inv| Ok(json!(inv.arg::<i64>(0)? + inv.arg::<i64>(1)?)))
///     .function("Calculator.scale", |inv| { ... });
/// ```
pub struct Module {
    name: String,
    kind: ModuleKind,
}

impl Module {
    pub fn native(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ModuleKind::Native {
                source: None,
                symbols: Namespace::default(),
            },
        }
    }

    /// A module backed by a script file.
    pub fn script(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: ModuleKind::Script(path.into()),
        }
    }

    /// Source file snapshotted by static commands built from this module.
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        if let ModuleKind::Native { source, .. } = &mut self.kind {
            *source = Some(path.into());
        }
        self
    }

    /// Register a synchronous function under a (possibly dotted) symbol.
    /// A later registration under the same symbol replaces the earlier one.
    pub fn function<F>(self, symbol: &str, f: F) -> Self
    where
        F: Fn(&Invocation) -> Result<Value, CommandError> + Send + Sync + 'static,
    {
        self.callable(symbol, Arc::new(FnCallable(f)))
    }

    pub fn callable(mut self, symbol: &str, callable: Arc<dyn Callable>) -> Self {
        if let ModuleKind::Native { symbols, .. } = &mut self.kind {
            symbols.insert(symbol, callable);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference to one of this module's symbols, for `CommandSpec::Function`.
    pub fn symbol(&self, path: &str) -> Symbol {
        Symbol::new(&self.name, path)
    }

    pub fn is_script(&self) -> bool {
        matches!(self.kind, ModuleKind::Script(_))
    }

    pub fn script_path(&self) -> Option<&Path> {
        match &self.kind {
            ModuleKind::Script(path) => Some(path),
            ModuleKind::Native { .. } => None,
        }
    }

    /// File whose text a static command snapshots.
    pub fn source_path(&self) -> Option<&Path> {
        match &self.kind {
            ModuleKind::Script(path) => Some(path),
            ModuleKind::Native { source, .. } => source.as_deref(),
        }
    }

    /// Look up a native symbol by dotted path.
    pub fn resolve(&self, symbol: &str) -> Option<Arc<dyn Callable>> {
        match &self.kind {
            ModuleKind::Native { symbols, .. } => symbols.get(symbol),
            ModuleKind::Script(_) => None,
        }
    }

    /// Registered symbol paths, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let ModuleKind::Native { symbols, .. } = &self.kind {
            symbols.collect("", &mut out);
        }
        out.sort();
        out
    }
}

/// RegistryError は ModuleRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("module '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// ModuleRegistry は名前からモジュールを引く
///
/// Session が 1 つ持ち、Command の build/run から参照されます。
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: Module) -> Result<(), RegistryError> {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        if modules.contains_key(&module.name) {
            return Err(RegistryError::AlreadyRegistered(module.name));
        }
        modules.insert(module.name.clone(), Arc::new(module));
        Ok(())
    }

    /// Install a new version of a module, returning the previous one.
    pub fn replace(&self, module: Module) -> Option<Arc<Module>> {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.name.clone(), Arc::new(module))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<Module>, CommandError> {
        self.get(name)
            .ok_or_else(|| CommandError::ModuleNotFound(name.to_string()))
    }

    pub fn registered_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
