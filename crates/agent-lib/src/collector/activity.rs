//! Out-of-band activity pulses
//!
//! A kernel-side GPU scheduler can signal that it wants fresh limits before
//! the next tick by touching a file. The watcher turns filesystem events on
//! that file into pulses on a capacity-1 channel, so pulses arriving while
//! one is still pending collapse into it.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Pulse channel; a full channel means a pass is already pending
pub fn pulse_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

/// Watches one path and emits a pulse whenever it is written
pub struct ActivityWatcher {
    path: PathBuf,
    pulse_tx: mpsc::Sender<()>,
}

impl ActivityWatcher {
    pub fn new(path: impl Into<PathBuf>, pulse_tx: mpsc::Sender<()>) -> Self {
        Self {
            path: path.into(),
            pulse_tx,
        }
    }

    /// Start watching. Pulses stop when the returned handle is dropped.
    pub fn start(self) -> Result<ActivityHandle> {
        let pulse_tx = self.pulse_tx;

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) if is_pulse_event(&event) => {
                    if pulse_tx.try_send(()).is_err() {
                        debug!("Activity pulse coalesced");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Activity watcher error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", self.path.display()))?;
        info!(path = %self.path.display(), "Watching for activity pulses");

        Ok(ActivityHandle { _watcher: watcher })
    }
}

/// Only content changes count; metadata and access events are ignored
pub fn is_pulse_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(notify::event::ModifyKind::Data(_))
            | EventKind::Modify(notify::event::ModifyKind::Any)
    )
}

/// Keeps the watcher alive
pub struct ActivityHandle {
    _watcher: RecommendedWatcher,
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, ModifyKind};

    #[test]
    fn test_pulse_event_classification() {
        assert!(is_pulse_event(&Event::new(EventKind::Create(CreateKind::File))));
        assert!(is_pulse_event(&Event::new(EventKind::Modify(
            ModifyKind::Data(DataChange::Content)
        ))));
        assert!(!is_pulse_event(&Event::new(EventKind::Modify(
            ModifyKind::Metadata(MetadataKind::Any)
        ))));
        assert!(!is_pulse_event(&Event::new(EventKind::Access(AccessKind::Any))));
    }

    #[tokio::test]
    async fn test_pulse_channel_coalesces() {
        let (tx, mut rx) = pulse_channel();
        assert!(tx.try_send(()).is_ok());
        assert!(tx.try_send(()).is_err());

        assert_eq!(rx.recv().await, Some(()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_start_fails_for_missing_path() {
        let (tx, _rx) = pulse_channel();
        let watcher = ActivityWatcher::new("/nonexistent/activity/pulse", tx);
        assert!(watcher.start().is_err());
    }
}
