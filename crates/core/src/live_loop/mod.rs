//! A named, periodic unit of work bound to the shared transport.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::clock::duration_of;
use crate::{AudioBridge, Clock, Result, SequencerError, TriggerHandle};

/// Error type a loop callback may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type CallbackResult = std::result::Result<(), CallbackError>;

/// Work run on every tick of a loop.
///
/// Callbacks carry no return value beyond success or failure, may be invoked
/// again after a reload swapped them out, and may run on any thread.
pub type LoopCallback = Arc<dyn Fn() -> CallbackResult + Send + Sync + 'static>;

/// Wraps a closure as a [`LoopCallback`].
pub fn callback<F>(f: F) -> LoopCallback
where
    F: Fn() -> CallbackResult + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) fn validate_period(name: &str, period_beats: f64) -> Result<()> {
    if !period_beats.is_finite() || period_beats <= 0.0 {
        return Err(SequencerError::InvalidPeriodSpec(format!(
            "{period_beats} (loop `{name}`)"
        )));
    }
    Ok(())
}

/// Trigger interval of a loop at `sec_per_beat`. An interval that rounds to
/// zero, or cannot be scheduled from now, is an invalid period.
pub(crate) fn period_interval(name: &str, period_beats: f64, sec_per_beat: f64) -> Result<Duration> {
    validate_period(name, period_beats)?;
    match duration_of(period_beats, sec_per_beat) {
        Some(interval) if !interval.is_zero() && Instant::now().checked_add(interval).is_some() => {
            Ok(interval)
        }
        _ => Err(SequencerError::InvalidPeriodSpec(format!(
            "{period_beats} (loop `{name}`): interval at {sec_per_beat}s per beat is out of range"
        ))),
    }
}

struct LoopState {
    period_beats: f64,
    callback: LoopCallback,
    /// Present exactly while the loop is running.
    trigger: Option<TriggerHandle>,
    /// Bumped on every start so that firings of an older trigger are ignored.
    generation: u64,
    interval: Option<Duration>,
}

/// Point-in-time view of a loop, suitable for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStatus {
    pub name: String,
    pub period_beats: f64,
    pub running: bool,
    pub interval_seconds: Option<f64>,
    pub ticks: u64,
    pub failures: u64,
    pub last_failure: Option<String>,
}

pub struct LiveLoop {
    name: String,
    clock: Arc<Clock>,
    bridge: Arc<dyn AudioBridge>,
    state: Mutex<LoopState>,
    ticks: AtomicU64,
    failures: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl LiveLoop {
    /// Creates an idle loop.
    pub fn new(
        name: impl Into<String>,
        period_beats: f64,
        callback: LoopCallback,
        clock: Arc<Clock>,
        bridge: Arc<dyn AudioBridge>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        validate_period(&name, period_beats)?;
        Ok(Arc::new(Self {
            name,
            clock,
            bridge,
            state: Mutex::new(LoopState {
                period_beats,
                callback,
                trigger: None,
                generation: 0,
                interval: None,
            }),
            ticks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> Result<bool> {
        Ok(self.lock()?.trigger.is_some())
    }

    pub fn period_beats(&self) -> Result<f64> {
        Ok(self.lock()?.period_beats)
    }

    /// Wall-clock interval of the current trigger, `None` while idle.
    pub fn interval(&self) -> Result<Option<Duration>> {
        Ok(self.lock()?.interval)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Replaces period and callback without touching the running state. A
    /// running loop keeps its old interval until it is restarted.
    pub fn update(&self, period_beats: f64, callback: LoopCallback) -> Result<()> {
        validate_period(&self.name, period_beats)?;
        let mut state = self.lock()?;
        state.period_beats = period_beats;
        state.callback = callback;
        Ok(())
    }

    /// Starts the recurring trigger. Does nothing if already running.
    ///
    /// The interval is computed from the tempo at this moment; later tempo
    /// changes only apply after the next restart.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.lock()?;
        if state.trigger.is_some() {
            return Ok(());
        }

        let interval = period_interval(&self.name, state.period_beats, self.clock.sec_per_beat()?)?;
        let generation = state.generation + 1;
        let weak = Arc::downgrade(self);
        let trigger = self.bridge.call_every(
            interval,
            Box::new(move || {
                if let Some(live) = weak.upgrade() {
                    live.tick(generation);
                }
            }),
        )?;

        state.generation = generation;
        state.trigger = Some(trigger);
        state.interval = Some(interval);
        tracing::debug!(
            loop_name = %self.name,
            period_beats = state.period_beats,
            interval_ms = interval.as_millis() as u64,
            "loop started"
        );
        Ok(())
    }

    /// Stops the loop and releases its trigger. Once this returns no new tick
    /// will run the callback.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(trigger) = state.trigger.take() {
            trigger.cancel();
            state.interval = None;
            tracing::debug!(loop_name = %self.name, "loop stopped");
        }
        Ok(())
    }

    pub fn status(&self) -> Result<LoopStatus> {
        let state = self.lock()?;
        Ok(LoopStatus {
            name: self.name.clone(),
            period_beats: state.period_beats,
            running: state.trigger.is_some(),
            interval_seconds: state.interval.map(|interval| interval.as_secs_f64()),
            ticks: self.ticks(),
            failures: self.failures(),
            last_failure: self.last_failure_detail(),
        })
    }

    /// Runs the callback for one firing of the trigger started as
    /// `generation`. Failures are contained here.
    fn tick(&self, generation: u64) {
        let callback = match self.state.lock() {
            Ok(state) if state.trigger.is_some() && state.generation == generation => {
                state.callback.clone()
            }
            Ok(_) => return,
            Err(_) => {
                tracing::error!(loop_name = %self.name, "loop state poisoned, skipping tick");
                return;
            }
        };

        self.ticks.fetch_add(1, Ordering::SeqCst);
        let detail = match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        let failure = SequencerError::CallbackFailure {
            name: self.name.clone(),
            detail,
        };
        self.failures.fetch_add(1, Ordering::SeqCst);
        tracing::error!(loop_name = %self.name, error = %failure, "loop tick failed");
        if let Ok(mut last) = self.last_failure.lock() {
            *last = Some(failure.to_string());
        }
    }

    fn last_failure_detail(&self) -> Option<String> {
        self.last_failure.lock().ok().and_then(|last| last.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, LoopState>> {
        self.state
            .lock()
            .map_err(|_| SequencerError::msg(format!("loop `{}` has been poisoned", self.name)))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl fmt::Debug for LiveLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveLoop")
            .field("name", &self.name)
            .field("running", &self.is_running().unwrap_or(false))
            .field("ticks", &self.ticks())
            .field("failures", &self.failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::manual::ManualBridge;
    use crate::ThreadedBridge;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (LoopCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let cb = callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (cb, count)
    }

    fn manual_loop(period: f64, cb: LoopCallback) -> (Arc<LiveLoop>, Arc<Clock>, Arc<ManualBridge>) {
        let clock = Arc::new(Clock::new(120.0).unwrap());
        let bridge = ManualBridge::new();
        let live = LiveLoop::new("a", period, cb, clock.clone(), bridge.clone()).unwrap();
        (live, clock, bridge)
    }

    #[test]
    fn starting_twice_creates_one_trigger() {
        let (cb, _) = counting();
        let (live, _, bridge) = manual_loop(1.0, cb);

        live.start().unwrap();
        live.start().unwrap();

        assert!(live.is_running().unwrap());
        assert_eq!(bridge.created(), 1);
        assert_eq!(bridge.active(), 1);
    }

    #[test]
    fn restart_uses_tempo_current_at_start() {
        let (cb, _) = counting();
        let (live, clock, bridge) = manual_loop(1.0, cb);

        live.start().unwrap();
        assert_eq!(bridge.last_interval(), Some(Duration::from_millis(500)));

        clock.set_tempo(60.0).unwrap();
        assert_eq!(live.interval().unwrap(), Some(Duration::from_millis(500)));
        assert_eq!(bridge.created(), 1);

        live.stop().unwrap();
        live.start().unwrap();
        assert_eq!(bridge.created(), 2);
        assert_eq!(bridge.last_interval(), Some(Duration::from_secs(1)));
        assert_eq!(bridge.active(), 1);
    }

    #[test]
    fn stop_is_idempotent_and_releases_trigger() {
        let (cb, _) = counting();
        let (live, _, bridge) = manual_loop(0.5, cb);

        live.stop().unwrap();
        live.start().unwrap();
        live.stop().unwrap();
        live.stop().unwrap();

        assert!(!live.is_running().unwrap());
        assert_eq!(live.interval().unwrap(), None);
        assert_eq!(bridge.active(), 0);
    }

    #[test]
    fn late_firing_after_stop_runs_nothing() {
        let (cb, count) = counting();
        let (live, _, bridge) = manual_loop(1.0, cb);

        live.start().unwrap();
        bridge.fire(false);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        live.stop().unwrap();
        bridge.fire(true);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A firing from the first trigger must not run once a second trigger
        // exists either.
        live.start().unwrap();
        bridge.fire(true);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(live.ticks(), 2);
    }

    #[test]
    fn failing_callback_keeps_loop_running() {
        let cb = callback(|| Err("synth exploded".into()));
        let (live, _, bridge) = manual_loop(1.0, cb);
        live.start().unwrap();

        for _ in 0..5 {
            bridge.fire(false);
        }

        assert!(live.is_running().unwrap());
        assert_eq!(live.failures(), 5);
        assert_eq!(live.ticks(), 5);
        let status = live.status().unwrap();
        assert!(status.last_failure.unwrap().contains("synth exploded"));
    }

    #[test]
    fn panicking_callback_is_contained() {
        let cb = callback(|| panic!("boom"));
        let (live, _, bridge) = manual_loop(1.0, cb);
        live.start().unwrap();

        bridge.fire(false);
        bridge.fire(false);

        assert!(live.is_running().unwrap());
        assert_eq!(live.failures(), 2);
        assert!(live.status().unwrap().last_failure.unwrap().contains("boom"));
    }

    #[test]
    fn update_swaps_definition_without_restarting() {
        let (cb, first) = counting();
        let (live, _, bridge) = manual_loop(2.0, cb);
        live.start().unwrap();

        let (next, second) = counting();
        live.update(4.0, next).unwrap();
        assert!(live.is_running().unwrap());
        assert_eq!(live.period_beats().unwrap(), 4.0);
        assert_eq!(bridge.created(), 1);

        bridge.fire(false);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert!(live.update(0.0, callback(|| Ok(()))).is_err());
        assert_eq!(live.period_beats().unwrap(), 4.0);
    }

    #[test]
    fn interval_must_fit_a_duration() {
        assert_eq!(period_interval("a", 1.0, 0.5).unwrap(), Duration::from_millis(500));
        for (period, sec_per_beat) in [(1e20, 0.5), (1e-12, 0.5), (1e15, 6e7)] {
            let err = period_interval("a", period, sec_per_beat).unwrap_err();
            assert!(matches!(err, SequencerError::InvalidPeriodSpec(_)), "{period} beats");
        }
        assert!(ManualBridge::new().call_every(Duration::ZERO, Box::new(|| {})).is_err());
    }

    #[test]
    fn start_refuses_an_interval_out_of_range() {
        let (cb, _) = counting();
        let (live, clock, bridge) = manual_loop(1e15, cb);
        live.start().unwrap();
        live.stop().unwrap();

        clock.set_tempo(1e-6).unwrap();
        assert!(matches!(live.start(), Err(SequencerError::InvalidPeriodSpec(_))));
        assert!(!live.is_running().unwrap());
        assert_eq!(bridge.created(), 1);

        clock.set_tempo(120.0).unwrap();
        live.start().unwrap();
        assert!(live.is_running().unwrap());
    }

    #[test]
    fn fires_every_half_second_at_120_bpm() {
        let clock = Arc::new(Clock::new(120.0).unwrap());
        let bridge = Arc::new(ThreadedBridge::boot(Default::default()).unwrap());
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let sink = stamps.clone();
        let live = LiveLoop::new(
            "pulse",
            1.0,
            callback(move || {
                sink.lock().unwrap().push(Instant::now());
                Ok(())
            }),
            clock,
            bridge.clone(),
        )
        .unwrap();

        live.start().unwrap();
        std::thread::sleep(Duration::from_millis(1_800));
        live.stop().unwrap();
        bridge.shutdown().unwrap();

        let stamps = stamps.lock().unwrap();
        assert!(stamps.len() >= 3, "expected at least 3 ticks, got {}", stamps.len());
        for pair in stamps.windows(2) {
            let gap = pair[1].duration_since(pair[0]).as_secs_f64();
            assert!((gap - 0.5).abs() < 0.1, "tick gap {gap}s outside tolerance");
        }
    }
}
