//! Boundary between the sequencer core and the sound engine.
//!
//! The core never produces audio itself. It only needs two timing primitives
//! (a one-shot delayed call and a repeating call) plus a way to ask for a note
//! to be played. [`AudioBridge`] captures exactly that; [`ThreadedBridge`] is
//! the in-process implementation used by the runtime.

#[cfg(test)]
pub(crate) mod manual;

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, never, select, unbounded, Receiver, Sender};

use crate::{AudioConfig, Result, SequencerError};

/// Callback fired once by [`AudioBridge::call_later`].
pub type OneShot = Box<dyn FnOnce() + Send + 'static>;

/// Callback fired on every period by [`AudioBridge::call_every`].
pub type Repeating = Box<dyn FnMut() + Send + 'static>;

/// A request to sound a single note.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub voice: String,
    pub frequency: f32,
    pub amplitude: f32,
    pub duration: Duration,
}

/// Scheduling and sound-producing operations the core consumes.
pub trait AudioBridge: Send + Sync + fmt::Debug {
    /// Runs `callback` once after `delay`.
    fn call_later(&self, delay: Duration, callback: OneShot) -> Result<TriggerHandle>;

    /// Runs `callback` every `period` until the returned handle is cancelled
    /// or dropped.
    fn call_every(&self, period: Duration, callback: Repeating) -> Result<TriggerHandle>;

    fn play(&self, note: &Note) -> Result<()>;

    /// Releases every resource held by the bridge. Outstanding triggers stop
    /// firing.
    fn shutdown(&self) -> Result<()>;
}

/// Exclusive ownership of a scheduled trigger.
///
/// Cancelling consumes the handle; dropping it cancels as well, so a trigger
/// never outlives its owner unless [`TriggerHandle::detach`] is called.
pub struct TriggerHandle {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TriggerHandle {
    pub fn new(id: u64, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(mut self) {
        self.release();
    }

    /// Lets the trigger run to completion without an owner.
    pub fn detach(mut self) {
        self.cancel = None;
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TriggerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for TriggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerHandle")
            .field("id", &self.id)
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Bridge that runs triggers on background threads.
///
/// Every repeating trigger owns a timer thread, so ticks of different loops
/// run concurrently while ticks of one loop are serialised. One-shots share a
/// single dispatch thread. Sound requests are only counted and traced, the
/// synthesis engine proper lives outside this crate.
pub struct ThreadedBridge {
    config: AudioConfig,
    next_id: AtomicU64,
    notes_played: AtomicU64,
    running: AtomicBool,
    dispatch_tx: Sender<Dispatch>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

enum Dispatch {
    Schedule { id: u64, due: Instant, callback: OneShot },
    Cancel(u64),
}

impl ThreadedBridge {
    /// Validates the boot parameters and brings the bridge up.
    pub fn boot(config: AudioConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (dispatch_tx, dispatch_rx) = unbounded();
        let dispatch_shutdown = shutdown_rx.clone();
        thread::Builder::new()
            .name("hotloop-dispatch".to_string())
            .spawn(move || run_dispatch(dispatch_rx, dispatch_shutdown))?;

        tracing::info!(
            sample_rate = config.sample_rate,
            buffer_size = config.buffer_size,
            channels = config.channels,
            duplex = config.duplex,
            "audio bridge booted"
        );
        Ok(Self {
            config,
            next_id: AtomicU64::new(1),
            notes_played: AtomicU64::new(0),
            running: AtomicBool::new(true),
            dispatch_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of notes requested since boot.
    pub fn notes_played(&self) -> u64 {
        self.notes_played.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SequencerError::ShutDown)
        }
    }
}

enum TimerEvent {
    Due,
    Cancelled,
    Detached,
}

enum DispatchEvent {
    Request(Dispatch),
    Due,
    Closed,
}

fn deadline_after(delay: Duration) -> Result<Instant> {
    Instant::now()
        .checked_add(delay)
        .ok_or_else(|| SequencerError::msg(format!("delay of {delay:?} is out of range")))
}

/// Fires one-shots in deadline order until the bridge shuts down.
fn run_dispatch(requests: Receiver<Dispatch>, shutdown: Receiver<()>) {
    let mut pending: BTreeMap<(Instant, u64), OneShot> = BTreeMap::new();
    loop {
        let timer = match pending.keys().next() {
            Some(&(due, _)) => after(due.saturating_duration_since(Instant::now())),
            None => never(),
        };
        let event = select! {
            recv(requests) -> msg => match msg {
                Ok(request) => DispatchEvent::Request(request),
                Err(_) => DispatchEvent::Closed,
            },
            recv(shutdown) -> _ => DispatchEvent::Closed,
            recv(timer) -> _ => DispatchEvent::Due,
        };

        match event {
            DispatchEvent::Closed => break,
            DispatchEvent::Request(Dispatch::Schedule { id, due, callback }) => {
                pending.insert((due, id), callback);
            }
            DispatchEvent::Request(Dispatch::Cancel(id)) => {
                pending.retain(|&(_, key), _| key != id);
            }
            DispatchEvent::Due => {
                let now = Instant::now();
                while let Some(entry) = pending.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    let ((_, id), callback) = entry.remove_entry();
                    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                        tracing::error!(trigger = id, "one-shot callback panicked");
                    }
                }
            }
        }
    }
    tracing::debug!(dropped = pending.len(), "dispatch thread finished");
}

impl AudioBridge for ThreadedBridge {
    fn call_later(&self, delay: Duration, callback: OneShot) -> Result<TriggerHandle> {
        self.ensure_running()?;
        let due = deadline_after(delay)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.dispatch_tx
            .send(Dispatch::Schedule { id, due, callback })
            .map_err(|_| SequencerError::ShutDown)?;

        let cancel_tx = self.dispatch_tx.clone();
        Ok(TriggerHandle::new(id, move || {
            let _ = cancel_tx.send(Dispatch::Cancel(id));
        }))
    }

    /// Spawns a timer thread that fires every `period` until cancelled or the
    /// bridge is shut down. Missed deadlines are skipped, not replayed.
    fn call_every(&self, period: Duration, mut callback: Repeating) -> Result<TriggerHandle> {
        if period.is_zero() {
            return Err(SequencerError::msg("repeating trigger needs a non-zero period"));
        }
        self.ensure_running()?;
        let mut deadline = deadline_after(period)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let shutdown_rx = self.shutdown_rx.clone();

        thread::Builder::new()
            .name(format!("hotloop-every-{id}"))
            .spawn(move || {
                let mut cancel_rx = cancel_rx;
                loop {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    let event = select! {
                        recv(cancel_rx) -> msg => match msg {
                            Ok(()) => TimerEvent::Cancelled,
                            // Detached handle: nobody can cancel any more.
                            Err(_) => TimerEvent::Detached,
                        },
                        recv(shutdown_rx) -> _ => TimerEvent::Cancelled,
                        default(timeout) => TimerEvent::Due,
                    };

                    match event {
                        TimerEvent::Cancelled => break,
                        TimerEvent::Detached => cancel_rx = never(),
                        TimerEvent::Due => {
                            callback();
                            let now = Instant::now();
                            while deadline <= now {
                                let Some(next) = deadline.checked_add(period) else {
                                    tracing::error!(trigger = id, "timer deadline overflowed");
                                    return;
                                };
                                deadline = next;
                            }
                        }
                    }
                }
            })?;

        Ok(TriggerHandle::new(id, move || {
            let _ = cancel_tx.try_send(());
        }))
    }

    fn play(&self, note: &Note) -> Result<()> {
        self.ensure_running()?;
        self.notes_played.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            voice = %note.voice,
            frequency = note.frequency,
            amplitude = note.amplitude,
            duration_ms = note.duration.as_millis() as u64,
            "note"
        );
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the only sender disconnects every timer and the dispatcher.
        lock_sender(&self.shutdown_tx)?.take();
        tracing::info!(notes = self.notes_played(), "audio bridge shut down");
        Ok(())
    }
}

impl fmt::Debug for ThreadedBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedBridge")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("notes_played", &self.notes_played())
            .finish()
    }
}

fn lock_sender(slot: &Mutex<Option<Sender<()>>>) -> Result<MutexGuard<'_, Option<Sender<()>>>> {
    slot.lock()
        .map_err(|_| SequencerError::msg("audio bridge shutdown channel has been poisoned"))
}
