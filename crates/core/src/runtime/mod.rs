use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    AppConfig, AudioBridge, Clock, DefinitionProvider, FileDefinitionProvider, HotReloader,
    LoopRegistry, LoopStatus, ReloaderHandle, Result, ThreadedBridge,
};

/// Owns every long-lived component and tears them down in a fixed order.
#[derive(Debug)]
pub struct Runtime {
    clock: Arc<Clock>,
    bridge: Arc<dyn AudioBridge>,
    registry: Arc<LoopRegistry>,
    reloader: Arc<HotReloader>,
    reload_task: Option<ReloaderHandle>,
    shut_down: bool,
}

impl Runtime {
    /// Boots the threaded audio bridge and starts watching `definitions`.
    pub fn boot(config: &AppConfig, definitions: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let clock = Arc::new(Clock::new(config.transport.bpm)?);
        let bridge: Arc<dyn AudioBridge> = Arc::new(ThreadedBridge::boot(config.audio.clone())?);
        let provider = Arc::new(FileDefinitionProvider::new(
            definitions,
            clock.clone(),
            bridge.clone(),
        ));
        Self::start(config, clock, bridge, provider)
    }

    /// Wires already constructed parts together and starts the reload task.
    pub fn start(
        config: &AppConfig,
        clock: Arc<Clock>,
        bridge: Arc<dyn AudioBridge>,
        provider: Arc<dyn DefinitionProvider>,
    ) -> Result<Self> {
        let registry = Arc::new(LoopRegistry::new(clock.clone(), bridge.clone()));
        let reloader = Arc::new(HotReloader::new(
            provider.clone(),
            registry.clone(),
            config.reload.on_failure,
        ));
        let reload_task = reloader.clone().spawn(config.reload.poll_interval())?;
        tracing::info!(
            source = %provider.describe(),
            bpm = config.transport.bpm,
            poll_ms = config.reload.poll_interval_ms,
            policy = ?config.reload.on_failure,
            "runtime started"
        );

        Ok(Self {
            clock,
            bridge,
            registry,
            reloader,
            reload_task: Some(reload_task),
            shut_down: false,
        })
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<LoopRegistry> {
        &self.registry
    }

    pub fn reloader(&self) -> &Arc<HotReloader> {
        &self.reloader
    }

    pub fn status(&self) -> Result<Vec<LoopStatus>> {
        self.registry.snapshot()
    }

    /// Blocks on `wait` (typically an interrupt signal), then shuts down.
    pub fn run_until<F>(mut self, wait: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let waited = wait();
        let stopped = self.shutdown();
        waited.and(stopped)
    }

    /// Stops the reload task, then every loop, then the audio bridge. Runs
    /// once; later calls return immediately.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        tracing::info!("shutting down");

        if let Some(task) = self.reload_task.take() {
            task.stop();
        }
        let loops = self.registry.shutdown();
        if let Err(err) = &loops {
            tracing::error!(error = %err, "failed to stop loops cleanly");
        }
        let bridge = self.bridge.shutdown();
        loops.and(bridge)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(error = %err, "shutdown during drop failed");
        }
    }
}
