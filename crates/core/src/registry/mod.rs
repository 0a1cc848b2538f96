//! Name to loop mapping and the transaction that swaps definitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::sec_per_beat_at;
use crate::live_loop::period_interval;
use crate::{
    AudioBridge, Clock, DefinitionSet, LiveLoop, LoopDefinition, LoopStatus, ReloadFailurePolicy,
    Result, SequencerError,
};

#[derive(Default)]
struct RegistryInner {
    /// Registration order, which is also start order.
    loops: Vec<Arc<LiveLoop>>,
    index: HashMap<String, usize>,
    shut_down: bool,
}

impl RegistryInner {
    fn ensure_open(&self) -> Result<()> {
        if self.shut_down {
            Err(SequencerError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn stop_all(&self) -> Result<()> {
        let mut first_error = None;
        for live in &self.loops {
            if let Err(err) = live.stop() {
                tracing::error!(loop_name = live.name(), error = %err, "failed to stop loop");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn start_all(&self) -> Result<()> {
        let mut first_error = None;
        for live in &self.loops {
            if let Err(err) = live.start() {
                tracing::error!(loop_name = live.name(), error = %err, "failed to start loop");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Owns every loop ever registered, keyed by name.
///
/// Redefining a name updates the existing [`LiveLoop`] so its identity (and
/// counters) survive reloads. Entries are only dropped with the registry.
pub struct LoopRegistry {
    clock: Arc<Clock>,
    bridge: Arc<dyn AudioBridge>,
    inner: Mutex<RegistryInner>,
}

impl LoopRegistry {
    pub fn new(clock: Arc<Clock>, bridge: Arc<dyn AudioBridge>) -> Self {
        Self {
            clock,
            bridge,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Stops every loop, applies `definitions`, then starts every loop in
    /// registration order. Definitions, and the interval every loop will get
    /// at the current tempo, are validated before anything is touched.
    pub fn apply_definitions(&self, definitions: Vec<LoopDefinition>) -> Result<()> {
        validate(&definitions)?;
        let mut inner = self.lock()?;
        inner.ensure_open()?;
        self.check_intervals(&inner, &definitions, None)?;
        inner.stop_all()?;
        self.install(&mut inner, definitions)
    }

    /// Runs a full reload transaction with definitions produced by `load`.
    ///
    /// With [`ReloadFailurePolicy::Silence`] loops are stopped before `load`
    /// runs and stay stopped if it fails. With
    /// [`ReloadFailurePolicy::KeepPrevious`] `load` runs first and a failure
    /// leaves the registry untouched.
    pub fn reload<F>(&self, load: F, policy: ReloadFailurePolicy) -> Result<usize>
    where
        F: FnOnce() -> Result<DefinitionSet>,
    {
        match policy {
            ReloadFailurePolicy::Silence => {
                let mut inner = self.lock()?;
                inner.ensure_open()?;
                inner.stop_all()?;
                let set = load()?;
                validate_set(&set)?;
                self.check_intervals(&inner, &set.loops, set.bpm)?;
                self.install_set(&mut inner, set)
            }
            ReloadFailurePolicy::KeepPrevious => {
                let set = load()?;
                validate_set(&set)?;
                let mut inner = self.lock()?;
                inner.ensure_open()?;
                self.check_intervals(&inner, &set.loops, set.bpm)?;
                inner.stop_all()?;
                self.install_set(&mut inner, set)
            }
        }
    }

    /// Silences every loop without forgetting any definition.
    pub fn stop_all(&self) -> Result<()> {
        let inner = self.lock()?;
        inner.stop_all()?;
        tracing::info!(loops = inner.loops.len(), "all loops stopped");
        Ok(())
    }

    /// Stops every loop and refuses any later change. Safe to call twice.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.shut_down {
            return Ok(());
        }
        inner.shut_down = true;
        inner.stop_all()
    }

    pub fn is_shut_down(&self) -> Result<bool> {
        Ok(self.lock()?.shut_down)
    }

    pub fn get(&self, name: &str) -> Result<Option<Arc<LiveLoop>>> {
        let inner = self.lock()?;
        Ok(inner.index.get(name).map(|&slot| inner.loops[slot].clone()))
    }

    /// Loop names in registration order.
    pub fn names(&self) -> Result<Vec<String>> {
        let inner = self.lock()?;
        Ok(inner.loops.iter().map(|live| live.name().to_string()).collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.loops.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn snapshot(&self) -> Result<Vec<LoopStatus>> {
        let inner = self.lock()?;
        inner.loops.iter().map(|live| live.status()).collect()
    }

    /// Rejects the transaction if any loop, redefined or kept, would get an
    /// interval that rounds to zero or overflows at the tempo it starts with.
    fn check_intervals(
        &self,
        inner: &RegistryInner,
        definitions: &[LoopDefinition],
        bpm: Option<f64>,
    ) -> Result<()> {
        let sec_per_beat = match bpm {
            Some(bpm) => sec_per_beat_at(bpm)?,
            None => self.clock.sec_per_beat()?,
        };
        for definition in definitions {
            period_interval(&definition.name, definition.period_beats, sec_per_beat)?;
        }
        for live in &inner.loops {
            if definitions.iter().all(|definition| definition.name != live.name()) {
                period_interval(live.name(), live.period_beats()?, sec_per_beat)?;
            }
        }
        Ok(())
    }

    fn install_set(&self, inner: &mut RegistryInner, set: DefinitionSet) -> Result<usize> {
        if let Some(bpm) = set.bpm {
            self.clock.set_tempo(bpm)?;
        }
        let count = set.loops.len();
        self.install(inner, set.loops)?;
        Ok(count)
    }

    /// Steps two and three of the transaction: update or create, then start
    /// everything. Expects every loop to be stopped already.
    fn install(&self, inner: &mut RegistryInner, definitions: Vec<LoopDefinition>) -> Result<()> {
        for definition in definitions {
            match inner.index.get(&definition.name) {
                Some(&slot) => {
                    inner.loops[slot].update(definition.period_beats, definition.callback)?;
                }
                None => {
                    let live = LiveLoop::new(
                        definition.name.clone(),
                        definition.period_beats,
                        definition.callback,
                        self.clock.clone(),
                        self.bridge.clone(),
                    )?;
                    inner.index.insert(definition.name, inner.loops.len());
                    inner.loops.push(live);
                }
            }
        }

        inner.start_all()?;
        tracing::info!(loops = inner.loops.len(), "loop definitions applied");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryInner>> {
        self.inner
            .lock()
            .map_err(|_| SequencerError::msg("loop registry has been poisoned"))
    }
}

fn validate(definitions: &[LoopDefinition]) -> Result<()> {
    for definition in definitions {
        definition.validate()?;
    }
    Ok(())
}

fn validate_set(set: &DefinitionSet) -> Result<()> {
    if let Some(bpm) = set.bpm {
        sec_per_beat_at(bpm)?;
    }
    validate(&set.loops)
}

impl fmt::Debug for LoopRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopRegistry")
            .field("names", &self.names().unwrap_or_default())
            .finish()
    }
}
