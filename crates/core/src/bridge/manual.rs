//! Deterministic bridge for tests: triggers only fire when the test says so.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{AudioBridge, Note, OneShot, Repeating, TriggerHandle};
use crate::{Result, SequencerError};

enum Job {
    Once(Option<OneShot>),
    Every(Repeating),
}

struct Trigger {
    interval: Duration,
    cancelled: Arc<AtomicBool>,
    job: Arc<Mutex<Job>>,
}

#[derive(Default)]
pub(crate) struct ManualBridge {
    triggers: Mutex<Vec<Trigger>>,
    notes: Mutex<Vec<Note>>,
    shut_down: AtomicBool,
}

impl ManualBridge {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total number of triggers ever created.
    pub(crate) fn created(&self) -> usize {
        self.triggers.lock().unwrap().len()
    }

    /// Number of triggers that have not been cancelled.
    pub(crate) fn active(&self) -> usize {
        self.triggers
            .lock()
            .unwrap()
            .iter()
            .filter(|trigger| !trigger.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Interval of the most recently created trigger.
    pub(crate) fn last_interval(&self) -> Option<Duration> {
        self.triggers.lock().unwrap().last().map(|trigger| trigger.interval)
    }

    pub(crate) fn notes(&self) -> Vec<Note> {
        self.notes.lock().unwrap().clone()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Fires every live trigger once, in creation order. Cancelled triggers
    /// are still handed their (stale) invocation when `include_cancelled` is
    /// set, mimicking a firing that was already in flight.
    pub(crate) fn fire(&self, include_cancelled: bool) -> usize {
        let jobs: Vec<Arc<Mutex<Job>>> = self
            .triggers
            .lock()
            .unwrap()
            .iter()
            .filter(|trigger| include_cancelled || !trigger.cancelled.load(Ordering::SeqCst))
            .map(|trigger| trigger.job.clone())
            .collect();

        let mut fired = 0;
        for job in jobs {
            let mut job = job.lock().unwrap();
            match &mut *job {
                Job::Once(callback) => {
                    if let Some(callback) = callback.take() {
                        callback();
                        fired += 1;
                    }
                }
                Job::Every(callback) => {
                    callback();
                    fired += 1;
                }
            }
        }
        fired
    }

    fn push(&self, interval: Duration, job: Job) -> TriggerHandle {
        let mut triggers = self.triggers.lock().unwrap();
        let id = triggers.len() as u64 + 1;
        let cancelled = Arc::new(AtomicBool::new(false));
        triggers.push(Trigger {
            interval,
            cancelled: cancelled.clone(),
            job: Arc::new(Mutex::new(job)),
        });
        TriggerHandle::new(id, move || cancelled.store(true, Ordering::SeqCst))
    }
}

impl AudioBridge for ManualBridge {
    fn call_later(&self, delay: Duration, callback: OneShot) -> Result<TriggerHandle> {
        Ok(self.push(delay, Job::Once(Some(callback))))
    }

    fn call_every(&self, period: Duration, callback: Repeating) -> Result<TriggerHandle> {
        if period.is_zero() {
            return Err(SequencerError::msg("repeating trigger needs a non-zero period"));
        }
        Ok(self.push(period, Job::Every(callback)))
    }

    fn play(&self, note: &Note) -> Result<()> {
        self.notes.lock().unwrap().push(note.clone());
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl fmt::Debug for ManualBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualBridge")
            .field("created", &self.created())
            .finish()
    }
}
