//! Pod admission discovery
//!
//! Pods carry their token reservation as extended-resource devices. The
//! kubelet pod-resources API lists which devices each container holds; a
//! pod's reservation is its device count times the tokens each device
//! stands for. [`DiscoveryLoop`] polls a [`PodDiscovery`] and forwards new
//! pods to the monitor.

use super::PodDiscovery;
use crate::health::{components, HealthRegistry};
use crate::models::AdmittedPod;
use crate::proto::podresources::v1::{
    ListPodResourcesRequest, ListPodResourcesResponse, LIST_METHOD,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, warn};

pub const DEFAULT_KUBELET_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ADMISSION_BUFFER: usize = 64;

/// Lists pod resources over the kubelet's unix socket
pub struct KubeletPodDiscovery {
    socket: PathBuf,
    resource_name: String,
    tokens_per_device: f64,
    /// Token-holding pods of the last `List`; a name is admitted again
    /// only after it has dropped out of a response
    seen: Mutex<HashSet<String>>,
}

impl KubeletPodDiscovery {
    pub fn new(
        socket: impl Into<PathBuf>,
        resource_name: impl Into<String>,
        tokens_per_device: f64,
    ) -> Self {
        Self {
            socket: socket.into(),
            resource_name: resource_name.into(),
            tokens_per_device,
            seen: Mutex::new(HashSet::new()),
        }
    }

    async fn list(&self) -> Result<ListPodResourcesResponse> {
        let socket = self.socket.clone();

        // The URI is ignored by the connector, only the socket path matters
        let channel = Endpoint::try_from("http://[::]:50051")?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_with_connector(service_fn(move |_: Uri| {
                UnixStream::connect(socket.clone())
            }))
            .await
            .with_context(|| format!("Failed to connect to {}", self.socket.display()))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .context("Kubelet pod-resources service not ready")?;

        let codec: ProstCodec<ListPodResourcesRequest, ListPodResourcesResponse> =
            ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(ListPodResourcesRequest {}),
                PathAndQuery::from_static(LIST_METHOD),
                codec,
            )
            .await
            .context("Kubelet pod-resources List failed")?;

        Ok(response.into_inner())
    }

    /// Pods in `response` holding at least one token device and not yet reported
    pub fn admit_new(&self, response: &ListPodResourcesResponse) -> Vec<AdmittedPod> {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut admitted = Vec::new();
        let mut current = HashSet::new();
        for pod in &response.pod_resources {
            let devices: usize = pod
                .containers
                .iter()
                .flat_map(|c| c.devices.iter())
                .filter(|d| d.resource_name == self.resource_name)
                .map(|d| d.device_ids.len())
                .sum();

            if devices == 0 {
                continue;
            }
            current.insert(pod.name.clone());
            if seen.contains(&pod.name) {
                continue;
            }

            admitted.push(AdmittedPod {
                name: pod.name.clone(),
                token_reservation: devices as f64 * self.tokens_per_device,
            });
        }

        *seen = current;
        admitted
    }
}

#[async_trait]
impl PodDiscovery for KubeletPodDiscovery {
    async fn scan(&self) -> Result<Vec<AdmittedPod>> {
        let response = self.list().await?;
        Ok(self.admit_new(&response))
    }
}

/// Polls a [`PodDiscovery`] and forwards admissions to the monitor
pub struct DiscoveryLoop {
    discovery: Arc<dyn PodDiscovery>,
    interval: Duration,
    admissions_tx: mpsc::Sender<AdmittedPod>,
    health: Option<HealthRegistry>,
}

impl DiscoveryLoop {
    pub fn new(
        discovery: Arc<dyn PodDiscovery>,
        interval: Duration,
    ) -> (Self, mpsc::Receiver<AdmittedPod>) {
        let (admissions_tx, admissions_rx) = mpsc::channel(ADMISSION_BUFFER);
        let discovery_loop = Self {
            discovery,
            interval,
            admissions_tx,
            health: None,
        };
        (discovery_loop, admissions_rx)
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting pod discovery loop"
        );

        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "Pod discovery scan failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down pod discovery loop");
                    break;
                }
            }
        }
    }

    /// One scan; returns how many pods were forwarded
    pub async fn poll_once(&self) -> Result<usize> {
        let result = self.discovery.scan().await;
        if let Some(health) = &self.health {
            health.report(components::DISCOVERY, &result).await;
        }

        let pods = result?;
        let count = pods.len();
        for pod in pods {
            debug!(pod = %pod.name, reservation = pod.token_reservation, "Discovered pod");
            self.admissions_tx
                .send(pod)
                .await
                .context("Monitor stopped accepting admissions")?;
        }

        Ok(count)
    }
}
