use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{Result, SequencerError};

pub const DEFAULT_BPM: f64 = 120.0;

#[derive(Debug, Clone, Copy)]
struct Tempo {
    bpm: f64,
    sec_per_beat: f64,
}

impl Tempo {
    fn new(bpm: f64) -> Result<Self> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(SequencerError::InvalidTempo(bpm));
        }
        Ok(Self {
            bpm,
            sec_per_beat: 60.0 / bpm,
        })
    }
}

/// Shared musical transport.
///
/// The clock owns the tempo and the monotonic reference every loop is timed
/// against. Tempo and seconds-per-beat live behind a single lock so readers
/// never see one without the other.
#[derive(Debug)]
pub struct Clock {
    tempo: Mutex<Tempo>,
    start: Instant,
}

impl Clock {
    /// Creates a clock running at `bpm`, starting now.
    pub fn new(bpm: f64) -> Result<Self> {
        Ok(Self {
            tempo: Mutex::new(Tempo::new(bpm)?),
            start: Instant::now(),
        })
    }

    /// Changes the tempo. Loops already running keep the duration they were
    /// started with until they are restarted.
    pub fn set_tempo(&self, bpm: f64) -> Result<()> {
        let tempo = Tempo::new(bpm)?;
        *self.lock()? = tempo;
        tracing::info!(bpm, "tempo changed");
        Ok(())
    }

    pub fn bpm(&self) -> Result<f64> {
        Ok(self.lock()?.bpm)
    }

    pub fn sec_per_beat(&self) -> Result<f64> {
        Ok(self.lock()?.sec_per_beat)
    }

    /// Seconds elapsed since the clock was created.
    pub fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Converts beats to seconds at the tempo current at call time.
    pub fn beats_to_seconds(&self, beats: f64) -> Result<f64> {
        Ok(beats * self.sec_per_beat()?)
    }

    /// Converts beats to a wall-clock duration at the current tempo.
    pub fn beats_to_duration(&self, beats: f64) -> Result<Duration> {
        let sec_per_beat = self.sec_per_beat()?;
        duration_of(beats, sec_per_beat).ok_or_else(|| {
            SequencerError::msg(format!(
                "{beats} beats at {sec_per_beat}s per beat is not a valid duration"
            ))
        })
    }

    pub fn seconds_to_beats(&self, seconds: f64) -> Result<f64> {
        Ok(seconds / self.sec_per_beat()?)
    }

    /// Position of the transport in beats, assuming the current tempo held
    /// since start.
    pub fn current_beat(&self) -> Result<f64> {
        self.seconds_to_beats(self.now())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tempo>> {
        self.tempo
            .lock()
            .map_err(|_| SequencerError::msg("clock tempo has been poisoned"))
    }
}

/// Seconds per beat at `bpm`, validated like [`Clock::set_tempo`].
pub fn sec_per_beat_at(bpm: f64) -> Result<f64> {
    Ok(Tempo::new(bpm)?.sec_per_beat)
}

/// `None` when the product is negative, not finite or beyond `Duration::MAX`.
pub(crate) fn duration_of(beats: f64, sec_per_beat: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(beats * sec_per_beat).ok()
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            tempo: Mutex::new(Tempo {
                bpm: DEFAULT_BPM,
                sec_per_beat: 60.0 / DEFAULT_BPM,
            }),
            start: Instant::now(),
        }
    }
}
