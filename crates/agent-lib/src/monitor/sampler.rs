//! Concurrent usage sampling
//!
//! One task per pod reads its counters and sends the raw readings back.
//! Workers never touch pod state; the monitor folds the readings in once
//! every worker has reported (or died).

use crate::collector::{CounterReading, ProbeError, ResourceHandle, ResourceProbe};
use crate::models::ResourceKind;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) type Readings = Vec<(ResourceKind, Result<CounterReading, ProbeError>)>;

pub(crate) struct PodSample {
    pub name: String,
    pub readings: Readings,
}

/// Read every pod's counters concurrently, returning once all workers finish
pub(crate) async fn sample_all(
    probe: Arc<dyn ResourceProbe>,
    jobs: Vec<(String, Vec<ResourceHandle>)>,
) -> Vec<PodSample> {
    if jobs.is_empty() {
        return Vec::new();
    }

    let expected = jobs.len();
    let (tx, mut rx) = mpsc::channel(expected);

    for (name, handles) in jobs {
        let probe = Arc::clone(&probe);
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut readings = Vec::with_capacity(handles.len());
            for handle in &handles {
                readings.push((handle.kind, probe.read_counter(handle).await));
            }
            let _ = tx.send(PodSample { name, readings }).await;
        });
    }

    // Fan-in ends when the last worker drops its sender
    drop(tx);

    let mut samples = Vec::with_capacity(expected);
    while let Some(sample) = rx.recv().await {
        samples.push(sample);
    }

    if samples.len() < expected {
        debug!(
            expected = expected,
            received = samples.len(),
            "Some sampling workers did not report"
        );
    }
    samples
}
