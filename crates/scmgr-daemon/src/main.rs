//! scmgr-daemon - security component manager service.
//!
//! Builds the registry from configuration, drives its timers and exits on
//! SIGTERM/SIGINT or once the registry has been idle for the configured
//! delay. Platform oracles are not linked into this binary; it runs with
//! the in-process oracles from [`scmgr_daemon::standalone`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scmgr_core::config::{DaemonSection, ServiceConfig};
use scmgr_daemon::consent::{ConsentStore, FirstUseConsent};
use scmgr_daemon::metrics::new_shared_registry;
use scmgr_daemon::standalone::{AutoConsent, InMemoryPermissionOracle, StaticScreenOracle};
use scmgr_daemon::timer::{SystemClock, TimerDriver, TimerQueue};
use scmgr_daemon::{ComponentRegistry, RegistryDeps, ScService};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Security component manager daemon
#[derive(Parser, Debug)]
#[command(name = "scmgr-daemon", version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level filter (overrides `daemon.log_level`)
    #[arg(long)]
    log_level: Option<String>,

    /// Log file (overrides `daemon.log_file`; stdout if neither is set)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Consent record file (overrides `consent.file`)
    #[arg(long)]
    consent_file: Option<PathBuf>,

    /// Validate the configuration, print it and exit
    #[arg(long)]
    check_config: bool,
}

fn load_config(args: &Args) -> Result<ServiceConfig> {
    let mut config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.daemon.log_level.clone_from(level);
    }
    if let Some(file) = &args.log_file {
        config.daemon.log_file = Some(file.clone());
    }
    if let Some(file) = &args.consent_file {
        config.consent.file.clone_from(file);
    }
    Ok(config)
}

fn init_tracing(daemon: &DaemonSection) -> Result<()> {
    let filter =
        EnvFilter::try_new(&daemon.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &daemon.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.check_config {
        print!("{}", config.to_toml().context("failed to render config")?);
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(config))
}

async fn async_main(config: ServiceConfig) -> Result<()> {
    init_tracing(&config.daemon)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting scmgr-daemon");

    let metrics = new_shared_registry().context("failed to create metrics registry")?;
    let consent_store = Arc::new(ConsentStore::open(&config.consent.file));
    let registry = Arc::new(ComponentRegistry::new(
        &config,
        RegistryDeps {
            clock: Arc::new(SystemClock),
            timers: Arc::new(TimerQueue::new()),
            screen: Arc::new(StaticScreenOracle::new(&config.displays)),
            permissions: Arc::new(InMemoryPermissionOracle::new()),
            consent: FirstUseConsent::new(
                consent_store,
                Arc::new(AutoConsent),
                config.consent.required_kinds.iter().copied(),
            ),
            enhance: None,
            classifier: None,
            metrics: Some(metrics.metrics().clone()),
        },
    ));
    let service = ScService::new(Arc::clone(&registry), config.limits.max_info_len);
    match service.get_enhance_object() {
        Ok(handle) => info!(?handle, "enhance module present"),
        Err(_) => info!("running without enhance module"),
    }

    registry.arm_idle_exit();
    let (stop_tx, stop_rx) = watch::channel(false);
    let driver = TimerDriver::spawn(Arc::clone(&registry), stop_rx);
    let mut idle_exit = registry.subscribe_exit();
    info!(
        displays = config.displays.len(),
        idle_exit_ms = config.timing.service_exit_delay_ms,
        "service ready"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
        _ = idle_exit.wait_for(|exiting| *exiting) => {
            info!("idle exit");
        }
    }

    let _ = stop_tx.send(true);
    if let Err(err) = driver.await {
        warn!(error = %err, "timer driver task failed");
    }
    match metrics.encode_text() {
        Ok(text) => debug!(metrics = %text, "final metrics"),
        Err(err) => warn!(error = %err, "failed to encode metrics"),
    }
    drop(service);
    info!("scmgr-daemon stopped");
    Ok(())
}
