//! Scriptable stand-in for the sandboxed runtime. It accepts the runtime's
//! command line, enforces its file permission flags on everything the script
//! does, and speaks the control protocol through `warden-client`.
//!
//! The entry program is a JSON document rather than source code:
//!
//! ```json
//! {
//!   "on_start": [{ "append": { "path": "starts.log", "line": "up" } }],
//!   "after_connect": [{ "exit_once": { "marker": "crashed", "code": 1 } }],
//!   "ignore_stop": false
//! }
//! ```

mod sandbox;

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_client::{ControlClient, Emitter, RequestHandler};

use crate::sandbox::{Access, Sandbox};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "warden-stub-runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    no_prompt: bool,
    #[arg(long, require_equals = true, value_delimiter = ',')]
    allow_read: Vec<PathBuf>,
    #[arg(long, require_equals = true, value_delimiter = ',')]
    allow_write: Vec<PathBuf>,
    #[arg(long, require_equals = true, value_delimiter = ',')]
    deny_read: Vec<PathBuf>,
    #[arg(long, require_equals = true, value_delimiter = ',')]
    deny_write: Vec<PathBuf>,
    /// Bare flag grants everything; with a value, only that host:port.
    #[arg(long, require_equals = true, num_args = 0..=1, default_missing_value = "*")]
    allow_net: Option<String>,
    entry: PathBuf,
    control_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Script {
    on_start: Vec<Action>,
    after_connect: Vec<Action>,
    /// Never acknowledge a stop request.
    ignore_stop: bool,
    /// Stay up without ever connecting to the supervisor.
    skip_connect: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    Write { path: PathBuf, contents: String },
    Append { path: PathBuf, line: String },
    WritePid { path: PathBuf },
    /// Exit with `code` unless `marker` exists; creates `marker` first.
    ExitOnce { marker: PathBuf, code: i32 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let Command::Run(args) = Cli::parse().command;
    let sandbox = Sandbox {
        allow_read: args.allow_read,
        allow_write: args.allow_write,
        deny_read: args.deny_read,
        deny_write: args.deny_write,
    };
    let raw = sandbox
        .read(&args.entry)
        .await
        .with_context(|| format!("failed to read entry program {}", args.entry.display()))?;
    let script: Script = serde_json::from_str(&raw).context("entry program is not a valid script")?;
    info!(
        entry = %args.entry.display(),
        allow_net = ?args.allow_net,
        no_prompt = args.no_prompt,
        "stub runtime starting"
    );

    for action in &script.on_start {
        run_action(&sandbox, action).await?;
    }
    if script.skip_connect {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        return Ok(());
    }

    let client = ControlClient::connect(&args.control_url, CONNECT_TIMEOUT)
        .await
        .context("failed to reach the control server")?;
    let handler = Arc::new(StubHandler {
        sandbox: sandbox.clone(),
        emitter: client.emitter(),
        ignore_stop: script.ignore_stop,
    });
    for action in &script.after_connect {
        run_action(&sandbox, action).await?;
    }

    client.serve(handler).await.context("control channel failed")?;
    info!("control channel closed; exiting");
    Ok(())
}

async fn run_action(sandbox: &Sandbox, action: &Action) -> Result<()> {
    match action {
        Action::Write { path, contents } => report(sandbox.write(path, contents).await, path),
        Action::Append { path, line } => {
            let existing = sandbox.read(path).await.unwrap_or_default();
            report(sandbox.write(path, &format!("{existing}{line}\n")).await, path)
        }
        Action::WritePid { path } => {
            report(sandbox.write(path, &std::process::id().to_string()).await, path)
        }
        Action::ExitOnce { marker, code } => {
            if sandbox.check(marker, Access::Read)?.exists() {
                return Ok(());
            }
            sandbox.write(marker, "").await?;
            warn!(code, "exiting on request");
            std::process::exit(*code);
        }
    }
    Ok(())
}

// Permission failures are expected outcomes of scripts and only logged.
fn report(result: std::io::Result<()>, path: &Path) {
    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "script action failed");
    }
}

struct StubHandler {
    sandbox: Sandbox,
    emitter: Emitter,
    ignore_stop: bool,
}

#[derive(Debug, Deserialize)]
struct SleepRequest {
    ms: u64,
}

#[derive(Debug, Deserialize)]
struct FileRequest {
    path: PathBuf,
    #[serde(default)]
    contents: String,
}

#[async_trait]
impl RequestHandler for StubHandler {
    async fn handle(&self, method: &str, payload: Option<Value>) -> Value {
        let payload = payload.unwrap_or(Value::Null);
        match method {
            "echo" => payload,
            "pid" => json!(std::process::id()),
            "sleep" => match serde_json::from_value::<SleepRequest>(payload) {
                Ok(request) => {
                    tokio::time::sleep(Duration::from_millis(request.ms)).await;
                    json!("slept")
                }
                Err(err) => error(err),
            },
            "spawn" => match spawn_sleeper() {
                Ok(pid) => json!(pid),
                Err(err) => error(err),
            },
            "write" => match serde_json::from_value::<FileRequest>(payload) {
                Ok(request) => match self.sandbox.write(&request.path, &request.contents).await {
                    Ok(()) => json!("ok"),
                    Err(err) => error(err),
                },
                Err(err) => error(err),
            },
            "read" => match serde_json::from_value::<FileRequest>(payload) {
                Ok(request) => match self.sandbox.read(&request.path).await {
                    Ok(contents) => json!(contents),
                    Err(err) => error(err),
                },
                Err(err) => error(err),
            },
            "emit" => match self.emitter.emit("custom", Some(payload)).await {
                Ok(()) => json!("emitted"),
                Err(err) => error(err),
            },
            other => error(format!("unknown method {other}")),
        }
    }

    async fn stop_all(&self) {
        if self.ignore_stop {
            std::future::pending::<()>().await;
        }
        report(self.sandbox.write(Path::new("stopped"), "").await, Path::new("stopped"));
    }
}

fn error(err: impl std::fmt::Display) -> Value {
    json!({ "error": err.to_string() })
}

/// Starts a long-lived grandchild. The environment carries no PATH, so the
/// binary is located directly.
fn spawn_sleeper() -> std::io::Result<u32> {
    let sleep = ["/bin/sleep", "/usr/bin/sleep"]
        .into_iter()
        .find(|candidate| Path::new(candidate).exists())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no sleep binary"))?;
    let child = std::process::Command::new(sleep)
        .arg("600")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child.id())
}
