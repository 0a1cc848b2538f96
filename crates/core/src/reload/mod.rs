//! Detects definition changes and drives the registry's reload transaction.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};

use crate::{ChangeMarker, DefinitionProvider, LoopRegistry, ReloadFailurePolicy, Result, SequencerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloaderState {
    /// No definitions have been applied yet.
    Unloaded,
    Loaded,
}

/// Result of a single [`HotReloader::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The source does not exist right now.
    Missing,
    Unchanged,
    Reloaded { loops: usize },
    /// The change was seen but could not be applied; the error was logged.
    Failed { error: String },
}

struct Tracking {
    state: ReloaderState,
    last_marker: Option<ChangeMarker>,
}

pub struct HotReloader {
    provider: Arc<dyn DefinitionProvider>,
    registry: Arc<LoopRegistry>,
    policy: ReloadFailurePolicy,
    tracking: Mutex<Tracking>,
}

impl HotReloader {
    pub fn new(
        provider: Arc<dyn DefinitionProvider>,
        registry: Arc<LoopRegistry>,
        policy: ReloadFailurePolicy,
    ) -> Self {
        Self {
            provider,
            registry,
            policy,
            tracking: Mutex::new(Tracking {
                state: ReloaderState::Unloaded,
                last_marker: None,
            }),
        }
    }

    pub fn state(&self) -> Result<ReloaderState> {
        Ok(self.lock()?.state)
    }

    /// Checks the source once and reloads if its marker moved.
    ///
    /// The new marker is recorded before loading, so a broken source is not
    /// retried until it changes again.
    pub fn poll(&self) -> Result<ReloadOutcome> {
        let mut tracking = self.lock()?;
        let Some(marker) = self.provider.change_marker() else {
            return Ok(ReloadOutcome::Missing);
        };
        if tracking.last_marker == Some(marker) {
            return Ok(ReloadOutcome::Unchanged);
        }
        tracking.last_marker = Some(marker);

        let source = self.provider.describe();
        tracing::info!(%source, "definition source changed, reloading");
        let provider = self.provider.clone();
        match self.registry.reload(move || provider.load_definitions(), self.policy) {
            Ok(loops) => {
                tracking.state = ReloaderState::Loaded;
                tracing::info!(%source, loops, "definitions reloaded");
                Ok(ReloadOutcome::Reloaded { loops })
            }
            Err(SequencerError::ShutDown) => Err(SequencerError::ShutDown),
            Err(err) => {
                tracing::error!(%source, error = %err, policy = ?self.policy, "reload failed");
                Ok(ReloadOutcome::Failed {
                    error: err.to_string(),
                })
            }
        }
    }

    /// Runs [`poll`](Self::poll) every `interval` on a dedicated thread.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> Result<ReloaderHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let thread = thread::Builder::new()
            .name("hotloop-reload".to_string())
            .spawn(move || {
                // The first check runs right away so startup does not wait a
                // full interval.
                let mut keep_polling = self.poll_logged();
                while keep_polling {
                    keep_polling = select! {
                        recv(stop_rx) -> _ => false,
                        recv(ticker) -> _ => self.poll_logged(),
                    };
                }
                tracing::debug!("reload task finished");
            })?;

        Ok(ReloaderHandle {
            stop_tx,
            thread: Some(thread),
        })
    }

    /// Polls once, logging errors. Returns `false` once polling is pointless.
    fn poll_logged(&self) -> bool {
        match self.poll() {
            Ok(_) => true,
            Err(SequencerError::ShutDown) => false,
            Err(err) => {
                tracing::error!(error = %err, "reload check failed");
                true
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tracking>> {
        self.tracking
            .lock()
            .map_err(|_| SequencerError::msg("reloader state has been poisoned"))
    }
}

impl fmt::Debug for HotReloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotReloader")
            .field("source", &self.provider.describe())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Handle to the background reload task.
#[derive(Debug)]
pub struct ReloaderHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl ReloaderHandle {
    /// Stops the task and waits for it. An in-progress reload finishes first.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("reload task panicked");
            }
        }
    }
}

impl Drop for ReloaderHandle {
    fn drop(&mut self) {
        self.halt();
    }
}
