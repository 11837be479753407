//! Ingress reload controller
//!
//! # Architecture Overview
//!
//! ```text
//!   manifests / resource watcher
//!            │ RoutingResource snapshots
//!            ▼
//!   ┌────────────────────────────────────────────────────────────┐
//!   │ controller (one worker per resource)                       │
//!   │   annotations ──▶ builder ──▶ render ──▶ proxy::reload ────┼──▶ nginx.conf + SIGHUP
//!   └────────────────────────────────────────────────────────────┘
//!            ▲                                      ▲
//!   lifecycle: startup (bootstrap + launch)         │
//!   proxy::watcher: TLS rotation / out-of-band edits┘
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use ingress_reload::config::{load_config, ControllerConfig};
use ingress_reload::controller::driver::{Driver, DriverError, LiveManifests};
use ingress_reload::lifecycle::{signals, Shutdown, StartupSupervisor};
use ingress_reload::observability::{logging, metrics};
use ingress_reload::proxy::{ChangeWatcher, ConfigPaths, NginxProcess, ReloadSupervisor};
use ingress_reload::render::Renderer;
use ingress_reload::Reconciler;

type BoxError = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(name = "ingress-reload")]
#[command(about = "Converges an nginx configuration to ingress routing resources", long_about = None)]
struct Cli {
    /// Controller configuration (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy and keep it converged to a manifest directory
    Run {
        #[arg(short, long)]
        manifests: PathBuf,
    },
    /// Print the configuration the manifests would produce
    Render {
        #[arg(short, long)]
        manifests: PathBuf,

        /// Print the resolved server descriptors as JSON instead
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration and compile templates
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match read_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = logging::init(&config.observability) {
        eprintln!("Error: {}", err);
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Run { manifests } => run(config, &manifests).await,
        Commands::Render { manifests, json } => render(config, &manifests, json).await,
        Commands::Check => check(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Exiting");
            ExitCode::FAILURE
        }
    }
}

fn read_config(path: Option<&Path>) -> Result<ControllerConfig, BoxError> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => Ok(ControllerConfig::default()),
    }
}

async fn run(config: ControllerConfig, manifest_dir: &Path) -> Result<(), BoxError> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ingress-reload starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    let paths = ConfigPaths::new(&config.proxy);
    let process = Arc::new(NginxProcess::new(&config.proxy));
    let supervisor =
        Arc::new(ReloadSupervisor::new(paths.clone(), process).with_shutdown(shutdown.clone()));
    let renderer = Renderer::new(&config.templates, &config.proxy.pid_file)?;

    StartupSupervisor::new(&config.proxy)
        .start(&supervisor, &renderer)
        .await?;

    let watcher = ChangeWatcher::new(paths, &config.proxy.tls_dir, &config.watch);
    let watch_task = {
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        let stopped = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(err) = watcher.run(supervisor, stopped).await {
                tracing::error!(error = %err, "Change watcher failed");
                shutdown.trigger();
            }
        })
    };

    let manifests = Arc::new(LiveManifests::load(manifest_dir)?);
    let reconciler = Arc::new(Reconciler::new(
        &config,
        renderer,
        supervisor.clone(),
        manifests.clone(),
        manifests.clone(),
    ));

    let (resync_tx, resync_rx) = mpsc::unbounded_channel();
    let signal_task = signals::spawn(shutdown.clone(), resync_tx)?;

    let result = Driver::new(reconciler, manifests, &config.watch, shutdown.clone())
        .run(resync_rx)
        .await;

    shutdown.trigger();
    let _ = watch_task.await;
    let _ = signal_task.await;

    match result {
        Ok(()) if supervisor.is_halted() => Err(DriverError::Halted.into()),
        Ok(()) => {
            tracing::info!("Shutdown complete");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn render(config: ControllerConfig, manifest_dir: &Path, json: bool) -> Result<(), BoxError> {
    let manifests = Arc::new(LiveManifests::load(manifest_dir)?);
    let renderer = Renderer::new(&config.templates, &config.proxy.pid_file)?;
    let process = Arc::new(NginxProcess::new(&config.proxy));
    let supervisor = Arc::new(ReloadSupervisor::new(ConfigPaths::new(&config.proxy), process));
    let reconciler = Reconciler::new(&config, renderer, supervisor, manifests.clone(), manifests.clone());

    let resources = manifests.snapshot().resources().to_vec();
    let (views, rendered) = reconciler.preview(&resources).await?;
    if json {
        let servers: Vec<_> = views.iter().flat_map(|view| &view.servers).collect();
        println!("{}", serde_json::to_string_pretty(&servers)?);
    } else {
        print!("{}", rendered.text);
        eprintln!("fingerprint {}", rendered.fingerprint);
    }
    Ok(())
}

fn check(config: &ControllerConfig) -> Result<(), BoxError> {
    Renderer::new(&config.templates, &config.proxy.pid_file)?;
    println!("configuration ok");
    Ok(())
}
