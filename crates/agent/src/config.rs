//! Agent configuration
//!
//! Sources, lowest precedence first: built-in defaults, the optional config
//! file, `TOKENSCALE_*` environment variables (nested keys joined by `__`),
//! and finally command-line flags.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokenscale_lib::collector::{PathTemplates, DEFAULT_KUBELET_SOCKET, DEFAULT_RESOURCE_CONF};
use tokenscale_lib::{AllocationConfig, MonitorConfig};

const ENV_PREFIX: &str = "TOKENSCALE";

/// Node-local CPU/GPU autoscaler
#[derive(Debug, Clone, Parser)]
#[command(name = "tokenscale-agent")]
#[command(author, version, about = "Token-economy CPU/GPU autoscaler", long_about = None)]
pub struct Args {
    /// Config file (YAML or TOML); a missing file is ignored
    #[arg(long, short, default_value = "tokenscale.yaml")]
    pub config: PathBuf,

    /// Node name from the Kubernetes downward API
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Sample and report, but never write limits
    #[arg(long)]
    pub monitoring_only: bool,

    /// Port for the health/metrics API
    #[arg(long)]
    pub api_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node_name: String,
    pub api_port: u16,
    pub monitoring_period_secs: u64,
    pub discovery_interval_secs: u64,
    pub monitoring_only: bool,

    pub kubelet_socket: PathBuf,
    /// Extended resource whose device count sets the token reservation
    pub token_resource_name: String,
    pub tokens_per_device: f64,

    pub cgroup_root: PathBuf,
    pub cpu_path_template: String,
    pub gpu_path_template: String,
    pub gemini_conf_path: PathBuf,
    /// File touched by the kernel-side scheduler to request a pass
    pub activity_pulse_path: Option<PathBuf>,

    pub allocation: AllocationConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let templates = PathTemplates::default();
        Self {
            node_name: "unknown".to_string(),
            api_port: 9091,
            monitoring_period_secs: 1,
            discovery_interval_secs: 1,
            monitoring_only: false,
            kubelet_socket: PathBuf::from(DEFAULT_KUBELET_SOCKET),
            token_resource_name: "tokenscale.io/token".to_string(),
            tokens_per_device: 1.0,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cpu_path_template: templates.cpu,
            gpu_path_template: templates.gpu,
            gemini_conf_path: PathBuf::from(DEFAULT_RESOURCE_CONF),
            activity_pulse_path: None,
            allocation: AllocationConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load the layered configuration and apply command-line overrides
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = Self::from_sources(&args.config)?;

        if let Some(node_name) = &args.node_name {
            config.node_name = node_name.clone();
        }
        if let Some(port) = args.api_port {
            config.api_port = port;
        }
        if args.monitoring_only {
            config.monitoring_only = true;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_sources(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        settings
            .try_deserialize()
            .context("Invalid agent configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitoring_period_secs == 0 {
            bail!("monitoring_period_secs must be positive");
        }
        if self.discovery_interval_secs == 0 {
            bail!("discovery_interval_secs must be positive");
        }
        let allocation = &self.allocation;
        if allocation.min_limit < 0.0 {
            bail!("allocation.min_limit must not be negative");
        }
        if allocation.cpu_capacity <= 0.0 || allocation.gpu_capacity <= 0.0 {
            bail!("allocation capacities must be positive");
        }
        if allocation.static_weight < 0.0 {
            bail!("allocation.static_weight must not be negative");
        }
        Ok(())
    }

    pub fn path_templates(&self) -> PathTemplates {
        PathTemplates {
            cpu: self.cpu_path_template.clone(),
            gpu: self.gpu_path_template.clone(),
        }
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            node_name: self.node_name.clone(),
            period: Duration::from_secs(self.monitoring_period_secs),
            monitoring_only: self.monitoring_only,
            allocation: self.allocation.clone(),
        }
    }
}
