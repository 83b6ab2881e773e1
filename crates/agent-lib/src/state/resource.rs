//! Sampling, smoothing and limit bookkeeping for one resource of one pod

use crate::collector::{CounterReading, ProbeError, RebalanceHook, ResourceHandle, ResourceProbe};
use crate::models::{ResourceKind, ResourceSnapshot};
use tracing::{debug, warn};

/// Usage above this is a counter glitch and is recorded as idle
const MAX_PLAUSIBLE_USAGE: f64 = 1000.0;

/// Outcome of [`ResourceState::set_limit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitWrite {
    /// Value equalled the cached limit, nothing was written
    Unchanged,
    Written,
    /// The write failed; the cached limit was updated anyway
    Failed,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    kind: ResourceKind,
    handle: Option<ResourceHandle>,
    last_reading: Option<CounterReading>,
    usage: f64,
    avg_usage: f64,
    dynamic_weight: f64,
    limit: f64,
    limit_written: bool,
}

impl ResourceState {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            handle: None,
            last_reading: None,
            usage: 0.0,
            avg_usage: 0.0,
            dynamic_weight: 0.0,
            limit: 0.0,
            limit_written: false,
        }
    }

    pub fn attach(&mut self, handle: ResourceHandle) {
        self.handle = Some(handle);
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn handle(&self) -> Option<&ResourceHandle> {
        self.handle.as_ref()
    }

    pub fn usage(&self) -> f64 {
        self.usage
    }

    pub fn avg_usage(&self) -> f64 {
        self.avg_usage
    }

    pub fn dynamic_weight(&self) -> f64 {
        self.dynamic_weight
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub(crate) fn set_dynamic_weight(&mut self, weight: f64) {
        self.dynamic_weight = weight;
    }

    /// Read the counter through `probe` and fold it in
    ///
    /// Returns `false` when the source is gone (or was never attached).
    pub async fn sample_usage(&mut self, probe: &dyn ResourceProbe) -> bool {
        let Some(handle) = self.handle.as_ref() else {
            return false;
        };
        let reading = probe.read_counter(handle).await;
        self.record_sample(reading)
    }

    /// Fold one counter read into `usage` and `avg_usage`
    ///
    /// The first successful read only sets the baseline. A transient read
    /// error counts as an idle interval and keeps the baseline. Returns
    /// `false` only when the source no longer exists.
    pub fn record_sample(&mut self, reading: Result<CounterReading, ProbeError>) -> bool {
        let reading = match reading {
            Ok(reading) => reading,
            Err(ProbeError::Missing(_)) => return false,
            Err(e) => {
                warn!(resource = %self.kind, error = %e, "Usage read failed, recording idle sample");
                self.observe(0.0);
                return true;
            }
        };

        let Some(previous) = self.last_reading.replace(reading) else {
            return true;
        };

        let elapsed = reading.at.saturating_duration_since(previous.at).as_secs_f64();
        let usage = if elapsed > 0.0 {
            reading.value.saturating_sub(previous.value) as f64 / (self.kind.scale() * elapsed)
        } else {
            0.0
        };

        if usage > MAX_PLAUSIBLE_USAGE {
            debug!(resource = %self.kind, usage = usage, "Discarding implausible usage sample");
            self.observe(0.0);
        } else {
            self.observe(usage);
        }
        true
    }

    fn observe(&mut self, usage: f64) {
        self.usage = usage;
        self.avg_usage = (7.0 * self.avg_usage + usage) / 8.0;
    }

    /// Write `value` unless it equals the cached limit
    ///
    /// GPU writes are followed by a re-balance notification.
    pub async fn set_limit(
        &mut self,
        value: f64,
        probe: &dyn ResourceProbe,
        hook: &dyn RebalanceHook,
    ) -> LimitWrite {
        if self.limit_written && value == self.limit {
            return LimitWrite::Unchanged;
        }

        let Some(handle) = self.handle.as_ref() else {
            self.limit = value;
            return LimitWrite::Failed;
        };

        let outcome = match probe.write_limit(handle, value).await {
            Ok(()) => {
                if self.kind == ResourceKind::Gpu {
                    if let Err(e) = hook.notify_limits_changed().await {
                        warn!(error = %e, "GPU re-balance notification failed");
                    }
                }
                LimitWrite::Written
            }
            Err(e) => {
                warn!(
                    resource = %self.kind,
                    path = %handle.path.display(),
                    value = value,
                    error = %e,
                    "Limit write failed"
                );
                LimitWrite::Failed
            }
        };

        self.limit = value;
        self.limit_written = true;
        outcome
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            kind: self.kind,
            limit: self.limit,
            usage: self.usage,
            avg_usage: self.avg_usage,
            dynamic_weight: self.dynamic_weight,
        }
    }
}
