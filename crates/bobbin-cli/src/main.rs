//! bobbin: submit tasks to an in-memory queue and drain them with workers.
//!
//! Store and broker live in this process, so everything submitted is also
//! executed before the command exits.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use bobbin_core::command::Module;
use bobbin_core::config::Config;
use bobbin_core::observability::{LogLevel, init_tracing};
use bobbin_core::{CommandError, Queue, Session, worker};
use tracing::info;

#[derive(Parser)]
#[command(name = "bobbin")]
#[command(about = "Run tasks through a bobbin queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Queue to submit to (defaults to BOBBIN_DEFAULT_QUEUE)
    #[arg(long, global = true)]
    queue: Option<String>,

    /// Competing workers draining the queue
    #[arg(long, global = true, default_value_t = 1)]
    workers: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit add(4, 5) and add(24, 56) and print the results
    Demo,

    /// Submit one task per argument list and drain the queue
    Run {
        /// `script.sh@symbol` or `module@symbol` (built-in module: arith)
        spec: String,

        /// JSON argument list for one task, e.g. '[4, 5]'; repeat for more tasks
        #[arg(long = "args")]
        args: Vec<ArgList>,

        /// Re-resolve the code at run time instead of snapshotting it
        #[arg(long)]
        dynamic: bool,

        /// Task folder, relative to BOBBIN_WORK_DIR
        #[arg(long, default_value = "")]
        folder: String,
    },

    /// Show the built-in module's symbols
    Modules,
}

#[derive(Debug, Clone)]
struct ArgList(Vec<Value>);

impl FromStr for ArgList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match serde_json::from_str(s) {
            Ok(Value::Array(values)) => Ok(ArgList(values)),
            Ok(other) => Ok(ArgList(vec![other])),
            Err(e) => Err(format!("not JSON: {e}")),
        }
    }
}

fn arith() -> Module {
    Module::native("arith")
        .function("add", |inv| {
            let (a, b) = (inv.arg::<i64>(0)?, inv.arg::<i64>(1)?);
            inv.println(format!("{a} + {b}"));
            Ok(json!(a + b))
        })
        .function("mul", |inv| Ok(json!(inv.arg::<i64>(0)? * inv.arg::<i64>(1)?)))
        .function("boom", |_| Err(CommandError::raised("boom")))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("loading BOBBIN_* configuration")?;
    init_tracing(config.log_level.unwrap_or(LogLevel::Warn));

    let poll_timeout = config.poll_timeout;
    let queue_name = cli.queue.unwrap_or_else(|| config.default_queue.clone());
    let session = Session::builder()
        .config(config)
        .in_memory()
        .module(arith())?
        .expect_modules(&["arith"])
        .build()?;

    let batches = match cli.command {
        Commands::Demo => vec![
            ("arith@add".to_string(), vec![json!(4), json!(5)], false, String::new()),
            ("arith@add".to_string(), vec![json!(24), json!(56)], false, String::new()),
        ],
        Commands::Run {
            spec,
            args,
            dynamic,
            folder,
        } => {
            let lists = if args.is_empty() {
                vec![ArgList(Vec::new())]
            } else {
                args
            };
            lists
                .into_iter()
                .map(|list| (spec.clone(), list.0, dynamic, folder.clone()))
                .collect()
        }
        Commands::Modules => {
            for symbol in arith().symbols() {
                println!("arith@{symbol}");
            }
            return Ok(());
        }
    };

    let queue = session.queue(&queue_name).await?;
    let mut ids = Vec::new();
    for (spec, args, dynamic, folder) in batches {
        let mut task = session
            .task(spec.as_str())
            .args(args)
            .dynamic(dynamic)
            .folder(folder)
            .build()
            .await
            .with_context(|| format!("building task for {spec}"))?;
        if let Some(id) = queue.submit(&mut task).await? {
            println!("submitted {id}: {}", task.command());
            ids.push(id);
        }
    }

    drain(&queue, cli.workers, poll_timeout).await?;

    for id in ids {
        let task = session.load_task(id).await?;
        let stdout = task.stdout_text().await?;
        println!("{id} {task}");
        for line in stdout.lines() {
            println!("  | {line}");
        }
    }
    Ok(())
}

async fn drain(queue: &Queue, workers: usize, poll_timeout: Duration) -> Result<()> {
    // competing workers, each stopping once the queue stays empty for a poll
    let workers = workers.max(1);
    let mut joins = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = queue.clone();
        joins.push(tokio::spawn(async move {
            worker::run(&queue, None, poll_timeout).await
        }));
    }
    let mut processed = 0;
    for join in joins {
        processed += join.await??;
    }
    info!(queue = %queue.name(), processed, workers, "queue drained");
    Ok(())
}
