//! Tokenscale agent - node-local CPU/GPU autoscaler
//!
//! This binary runs as a DaemonSet on each Kubernetes node, turning each
//! pod's token reservation into CPU and GPU limits once per period.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokenscale_agent::{api, config};
use tokenscale_lib::{
    collector::{
        pulse_channel, ActivityWatcher, DiscoveryLoop, GeminiHook, KubeletPodDiscovery, NodeIo,
        SysfsProbe,
    },
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    Monitor,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = config::Args::parse();
    let config = config::AgentConfig::load(&args)?;
    info!(node_name = %config.node_name, config = ?config, "Agent configured");

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION, config.monitoring_only);

    let health_registry = HealthRegistry::new();
    for component in [components::MONITOR, components::PROBE, components::DISCOVERY] {
        health_registry.register(component).await;
    }
    let metrics = AgentMetrics::new();

    let (shutdown_tx, _) = broadcast::channel(1);

    // Node collaborators
    let probe = SysfsProbe::detect(&config.cgroup_root, config.path_templates()).await;
    let hook = GeminiHook::new(&config.gemini_conf_path);
    let io = NodeIo::new(Arc::new(probe), Arc::new(hook));

    let discovery = KubeletPodDiscovery::new(
        &config.kubelet_socket,
        &config.token_resource_name,
        config.tokens_per_device,
    );
    let (discovery_loop, admissions) =
        DiscoveryLoop::new(Arc::new(discovery), config.discovery_interval());
    let discovery_loop = discovery_loop.with_health(health_registry.clone());

    let (pulse_tx, pulses) = pulse_channel();
    // Without a pulse path the channel simply stays quiet
    let _activity = match &config.activity_pulse_path {
        Some(path) => Some(
            ActivityWatcher::new(path, pulse_tx)
                .start()
                .context("Failed to start activity watcher")?,
        ),
        None => None,
    };

    let (monitor, snapshot_rx) = Monitor::new(config.monitor_config(), io);
    let monitor = monitor.with_health(health_registry.clone());

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        snapshot_rx,
    ));

    let discovery_handle = tokio::spawn(discovery_loop.run(shutdown_tx.subscribe()));
    let monitor_handle = tokio::spawn(monitor.run(admissions, pulses, shutdown_tx.subscribe()));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Mark agent as ready after wiring
    health_registry.set_ready(true).await;

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT received",
        _ = sigterm.recv() => "SIGTERM received",
    };
    logger.log_shutdown(reason);

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    if let Err(e) = monitor_handle.await {
        error!(error = %e, "Monitor task panicked");
    }
    if let Err(e) = discovery_handle.await {
        error!(error = %e, "Discovery task panicked");
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
