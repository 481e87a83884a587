use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_server::{
    binary_store::{default_runtime_path, DEFAULT_DOWNLOAD_BASE},
    BinaryStore, ControlServer, ControlServerConfig, ManifestResolver, ReleaseRef,
    ReqwestFetcher, ServiceConfig,
};

mod admin;
mod telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "warden",
    author,
    version,
    about = "Installs, launches and supervises sandboxed script runtimes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install or repair the runtime executable, then exit.
    Install(InstallArgs),
    /// Run the control server and the configured services until Ctrl-C.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct ReleaseArgs {
    /// JSON manifest pinning archive and binary checksums per platform.
    #[arg(long, env = "WARDEN_RELEASE_MANIFEST")]
    manifest: Option<PathBuf>,

    #[arg(long, env = "WARDEN_RELEASE_REPOSITORY", default_value = "denoland/deno")]
    repository: String,

    #[arg(long, env = "WARDEN_RELEASE_TAG", default_value = "v1.46.3")]
    tag: String,

    #[arg(long, env = "WARDEN_DOWNLOAD_BASE", default_value = DEFAULT_DOWNLOAD_BASE)]
    download_base: String,

    #[arg(long, env = "WARDEN_DOWNLOAD_TIMEOUT_SECS", default_value_t = 120)]
    download_timeout_secs: u64,
}

#[derive(Debug, Args)]
struct InstallArgs {
    /// Where the runtime executable is installed.
    #[arg(long, env = "WARDEN_RUNTIME")]
    runtime: PathBuf,

    #[command(flatten)]
    release: ReleaseArgs,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Address of the control channel listener.
    #[arg(long, env = "WARDEN_LISTEN_ADDR", default_value = "127.0.0.1:0")]
    listen_addr: String,

    /// Directory holding service work and cache directories.
    #[arg(long, env = "WARDEN_STATE_DIR")]
    state_dir: PathBuf,

    /// Runtime executable; defaults to `<state-dir>/bin/runtime`.
    #[arg(long, env = "WARDEN_RUNTIME")]
    runtime: Option<PathBuf>,

    /// Service to start, as `name=path/to/program.ts`. Repeatable.
    #[arg(long = "service", env = "WARDEN_SERVICES", value_delimiter = ',')]
    services: Vec<String>,

    /// Grant services unrestricted network access.
    #[arg(long, env = "WARDEN_ALLOW_NETWORK", default_value_t = false)]
    allow_network: bool,

    /// Optional listener for /healthz, /metrics and /debug/instances.
    #[arg(long, env = "WARDEN_ADMIN_ADDR")]
    admin_addr: Option<String>,

    /// How long a launched runtime has to connect back.
    #[arg(long, env = "WARDEN_CONNECT_TIMEOUT_MS", default_value_t = 1000)]
    connect_timeout_ms: u64,

    #[arg(long, env = "WARDEN_CALL_TIMEOUT_SECS", default_value_t = 5)]
    call_timeout_secs: u64,

    /// Grace period for stopping instances during shutdown.
    #[arg(long, env = "WARDEN_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,

    #[command(flatten)]
    release: ReleaseArgs,
}

#[derive(Debug, Clone)]
struct ReleaseConfig {
    manifest: PathBuf,
    release: ReleaseRef,
    download_base: String,
    download_timeout: Duration,
}

impl ReleaseArgs {
    /// `None` when no manifest was given, in which case nothing is installed.
    fn into_config(self) -> Result<Option<ReleaseConfig>> {
        let Some(manifest) = self.manifest else {
            return Ok(None);
        };
        Ok(Some(ReleaseConfig {
            manifest: absolute(manifest)?,
            release: ReleaseRef::new(self.repository, self.tag),
            download_base: self.download_base,
            download_timeout: Duration::from_secs(self.download_timeout_secs),
        }))
    }
}

#[derive(Debug, Clone)]
struct ServiceSource {
    name: String,
    program: PathBuf,
}

#[derive(Debug, Clone)]
struct ServeConfig {
    server: ControlServerConfig,
    services: Vec<ServiceSource>,
    allow_network: bool,
    admin_addr: Option<SocketAddr>,
    shutdown_grace: Duration,
    release: Option<ReleaseConfig>,
}

impl TryFrom<ServeArgs> for ServeConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let admin_addr = args
            .admin_addr
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid admin address: {addr}"))
            })
            .transpose()?;
        let state_dir = absolute(args.state_dir)?;
        let runtime_path = match args.runtime {
            Some(path) => absolute(path)?,
            None => default_runtime_path(&state_dir),
        };
        let services = args
            .services
            .iter()
            .map(|raw| parse_service(raw))
            .collect::<Result<Vec<_>>>()?;

        let mut server = ControlServerConfig::new(listen_addr, state_dir, runtime_path);
        server.connect_timeout = Duration::from_millis(args.connect_timeout_ms);
        server.instance.call_timeout = Duration::from_secs(args.call_timeout_secs);
        server.instance.response_retention = server
            .instance
            .response_retention
            .max(server.instance.call_timeout * 2);
        server.check().context("invalid server configuration")?;

        Ok(ServeConfig {
            server,
            services,
            allow_network: args.allow_network,
            admin_addr,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            release: args.release.into_config()?,
        })
    }
}

fn parse_service(raw: &str) -> Result<ServiceSource> {
    let Some((name, program)) = raw.split_once('=') else {
        bail!("service must look like name=path, got {raw:?}");
    };
    Ok(ServiceSource {
        name: name.trim().to_owned(),
        program: PathBuf::from(program.trim()),
    })
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("failed to resolve the current directory")?;
    Ok(cwd.join(path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    match Cli::parse().command {
        Command::Install(args) => {
            let runtime = absolute(args.runtime)?;
            let release = args
                .release
                .into_config()?
                .context("--manifest is required to install the runtime")?;
            install_runtime(&release, &runtime).await
        }
        Command::Serve(args) => {
            let config = ServeConfig::try_from(args)?;
            info!(
                listen_addr = %config.server.listen_addr,
                state_dir = %config.server.state_dir.display(),
                runtime = %config.server.runtime_path.display(),
                services = config.services.len(),
                "starting warden"
            );
            serve(config, telemetry.metrics_handle()).await
        }
    }
}

async fn install_runtime(release: &ReleaseConfig, runtime: &Path) -> Result<()> {
    let fetcher =
        ReqwestFetcher::new(release.download_timeout).context("failed to build HTTP client")?;
    let store = BinaryStore::new(
        release.release.clone(),
        Arc::new(ManifestResolver::new(&release.manifest)),
        Arc::new(fetcher),
    )?
    .with_download_base(release.download_base.clone());
    store
        .ensure_installed(runtime)
        .await
        .with_context(|| format!("failed to install runtime at {}", runtime.display()))?;
    info!(runtime = %runtime.display(), release = %release.release, "runtime ready");
    Ok(())
}

async fn serve(config: ServeConfig, metrics: PrometheusHandle) -> Result<()> {
    if let Some(release) = &config.release {
        install_runtime(release, &config.server.runtime_path).await?;
    }

    let root = CancellationToken::new();
    let server = ControlServer::bind(config.server.clone(), root.clone())
        .await
        .context("failed to bind control server")?;
    let server_task = tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    if let Some(admin_addr) = config.admin_addr {
        let listener = tokio::net::TcpListener::bind(admin_addr)
            .await
            .context("failed to bind admin listener")?;
        info!("admin endpoints listening on {admin_addr}");
        let router = admin::router(server.clone(), Some(metrics));
        let shutdown = root.clone().cancelled_owned();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %err, "admin server exited with error");
            }
        });
    }

    for source in &config.services {
        let program = tokio::fs::read_to_string(&source.program)
            .await
            .with_context(|| format!("failed to read {}", source.program.display()))?;
        let mut service = ServiceConfig::new(&source.name, program);
        service.allow_network = config.allow_network;
        match server.start_instance(&root, service).await {
            Ok(id) => info!(service = %source.name, instance = %id, "service running"),
            Err(err) => warn!(service = %source.name, error = %err, "service failed to start"),
        }
    }

    shutdown_signal().await;
    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; stopping instances"
    );

    // Stop waits are cut short once the grace period is over; kills still run.
    let stop_cancel = CancellationToken::new();
    let grace_timer = tokio::spawn({
        let stop_cancel = stop_cancel.clone();
        let grace = config.shutdown_grace;
        async move {
            tokio::time::sleep(grace).await;
            stop_cancel.cancel();
        }
    });
    server.stop_all(&stop_cancel).await;
    grace_timer.abort();

    root.cancel();
    server_task
        .await
        .context("control server task failed")?
        .context("control server exited with error")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
