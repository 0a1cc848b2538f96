//! Loop definitions and the sources they come from.
//!
//! A [`DefinitionProvider`] turns some external, frequently edited source into
//! an ordered [`DefinitionSet`]. The core only ever sees the structured result;
//! [`FileDefinitionProvider`] is the JSON file based implementation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::live_loop::{callback, validate_period};
use crate::{AudioBridge, Clock, LoopCallback, Note, Result, SequencerError};

/// Marker compared between polls to decide whether a source changed.
pub type ChangeMarker = SystemTime;

/// One `(name, period, callback)` entry.
#[derive(Clone)]
pub struct LoopDefinition {
    pub name: String,
    pub period_beats: f64,
    pub callback: LoopCallback,
}

impl LoopDefinition {
    pub fn new(name: impl Into<String>, period_beats: f64, callback: LoopCallback) -> Self {
        Self {
            name: name.into(),
            period_beats,
            callback,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_period(&self.name, self.period_beats)
    }
}

impl fmt::Debug for LoopDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopDefinition")
            .field("name", &self.name)
            .field("period_beats", &self.period_beats)
            .finish()
    }
}

/// Everything a provider yields for one reload.
#[derive(Debug, Clone, Default)]
pub struct DefinitionSet {
    /// Tempo requested by the source, applied before loops restart.
    pub bpm: Option<f64>,
    pub loops: Vec<LoopDefinition>,
}

impl DefinitionSet {
    pub fn new(loops: Vec<LoopDefinition>) -> Self {
        Self { bpm: None, loops }
    }

    pub fn with_bpm(mut self, bpm: f64) -> Self {
        self.bpm = Some(bpm);
        self
    }
}

/// A changing source of loop definitions.
pub trait DefinitionProvider: Send + Sync {
    /// Human readable name of the source, used in logs.
    fn describe(&self) -> String;

    /// Current change marker, or `None` if the source is missing right now.
    fn change_marker(&self) -> Option<ChangeMarker>;

    fn load_definitions(&self) -> Result<DefinitionSet>;
}

/// A period as written by a user: a plain number of beats or a ratio such
/// as `"1/4"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeriodSpec {
    Beats(f64),
    Text(String),
}

impl From<f64> for PeriodSpec {
    fn from(value: f64) -> Self {
        Self::Beats(value)
    }
}

impl From<i32> for PeriodSpec {
    fn from(value: i32) -> Self {
        Self::Beats(value as f64)
    }
}

impl From<u32> for PeriodSpec {
    fn from(value: u32) -> Self {
        Self::Beats(value as f64)
    }
}

impl From<&str> for PeriodSpec {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PeriodSpec {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Parses a period into a positive number of beats.
pub fn parse_period(spec: impl Into<PeriodSpec>) -> Result<f64> {
    let spec = spec.into();
    let beats = match &spec {
        PeriodSpec::Beats(beats) => Some(*beats),
        PeriodSpec::Text(text) => parse_period_text(text),
    };

    match beats {
        Some(beats) if beats.is_finite() && beats > 0.0 => Ok(beats),
        _ => Err(SequencerError::InvalidPeriodSpec(match spec {
            PeriodSpec::Beats(beats) => beats.to_string(),
            PeriodSpec::Text(text) => text,
        })),
    }
}

fn parse_period_text(text: &str) -> Option<f64> {
    let text = text.trim();
    match text.split_once('/') {
        Some((num, den)) => {
            let num: i64 = num.trim().parse().ok()?;
            let den: i64 = den.trim().parse().ok()?;
            if den == 0 {
                return None;
            }
            Some(num as f64 / den as f64)
        }
        None => text.parse().ok(),
    }
}

fn default_voice() -> String {
    "sine".to_string()
}

fn default_frequency() -> f32 {
    440.0
}

fn default_amplitude() -> f32 {
    0.5
}

fn default_duration_beats() -> f64 {
    0.25
}

/// Sound requested on every tick of a file-defined loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundSpec {
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_frequency")]
    pub frequency: f32,
    #[serde(default = "default_amplitude")]
    pub amplitude: f32,
    #[serde(default = "default_duration_beats")]
    pub duration_beats: f64,
}

impl Default for SoundSpec {
    fn default() -> Self {
        Self {
            voice: default_voice(),
            frequency: default_frequency(),
            amplitude: default_amplitude(),
            duration_beats: default_duration_beats(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    #[serde(default)]
    bpm: Option<f64>,
    loops: Vec<RawLoop>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLoop {
    name: String,
    period: PeriodSpec,
    #[serde(default)]
    offset: f64,
    #[serde(default)]
    sound: SoundSpec,
}

/// Validated content of a definition file, before callbacks are attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedDefinitions {
    pub bpm: Option<f64>,
    pub loops: Vec<ParsedLoop>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedLoop {
    pub name: String,
    pub period_beats: f64,
    pub offset_beats: f64,
    pub sound: SoundSpec,
}

impl ParsedDefinitions {
    /// Parses and validates a JSON definition document. Every problem is
    /// reported as [`SequencerError::DefinitionLoad`].
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawFile = serde_json::from_str(text).map_err(SequencerError::definition_load)?;

        if let Some(bpm) = raw.bpm {
            if !bpm.is_finite() || bpm <= 0.0 {
                return Err(SequencerError::definition_load(SequencerError::InvalidTempo(bpm)));
            }
        }

        let mut loops: Vec<ParsedLoop> = Vec::with_capacity(raw.loops.len());
        for entry in raw.loops {
            let name = entry.name.trim().to_string();
            if name.is_empty() {
                return Err(SequencerError::definition_load("loop name must not be empty"));
            }
            if loops.iter().any(|existing| existing.name == name) {
                return Err(SequencerError::definition_load(format!(
                    "loop `{name}` is defined more than once"
                )));
            }

            let period_beats = parse_period(entry.period).map_err(|err| {
                SequencerError::definition_load(format!("loop `{name}`: {err}"))
            })?;
            if !(0.0..period_beats).contains(&entry.offset) {
                return Err(SequencerError::definition_load(format!(
                    "loop `{name}`: offset {} must lie within [0, {period_beats})",
                    entry.offset
                )));
            }
            if !entry.sound.duration_beats.is_finite() || entry.sound.duration_beats <= 0.0 {
                return Err(SequencerError::definition_load(format!(
                    "loop `{name}`: sound duration must be positive"
                )));
            }

            loops.push(ParsedLoop {
                name,
                period_beats,
                offset_beats: entry.offset,
                sound: entry.sound,
            });
        }

        Ok(Self {
            bpm: raw.bpm,
            loops,
        })
    }

    /// Attaches a callback to every loop that plays its sound through
    /// `bridge`, timed against `clock`.
    pub fn into_definition_set(self, clock: &Arc<Clock>, bridge: &Arc<dyn AudioBridge>) -> DefinitionSet {
        let loops = self
            .loops
            .into_iter()
            .map(|parsed| {
                let callback = sound_callback(&parsed, clock.clone(), bridge.clone());
                LoopDefinition::new(parsed.name, parsed.period_beats, callback)
            })
            .collect();
        DefinitionSet {
            bpm: self.bpm,
            loops,
        }
    }
}

fn sound_callback(parsed: &ParsedLoop, clock: Arc<Clock>, bridge: Arc<dyn AudioBridge>) -> LoopCallback {
    let sound = parsed.sound.clone();
    let offset_beats = parsed.offset_beats;
    let name = parsed.name.clone();

    callback(move || {
        let note = Note {
            voice: sound.voice.clone(),
            frequency: sound.frequency,
            amplitude: sound.amplitude,
            duration: clock.beats_to_duration(sound.duration_beats)?,
        };

        if offset_beats <= 0.0 {
            bridge.play(&note)?;
            return Ok(());
        }

        let delay = clock.beats_to_duration(offset_beats)?;
        let player = bridge.clone();
        let name = name.clone();
        bridge
            .call_later(
                delay,
                Box::new(move || {
                    if let Err(err) = player.play(&note) {
                        tracing::warn!(loop_name = %name, error = %err, "offset note failed");
                    }
                }),
            )?
            .detach();
        Ok(())
    })
}

/// Reads loop definitions from a JSON file and reports its modification time
/// as the change marker.
pub struct FileDefinitionProvider {
    path: PathBuf,
    clock: Arc<Clock>,
    bridge: Arc<dyn AudioBridge>,
}

impl FileDefinitionProvider {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<Clock>, bridge: Arc<dyn AudioBridge>) -> Self {
        Self {
            path: path.into(),
            clock,
            bridge,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and validates the file without building callbacks.
    pub fn parse(&self) -> Result<ParsedDefinitions> {
        read_definitions(&self.path)
    }
}

/// Reads and validates a definition file.
pub fn read_definitions(path: &Path) -> Result<ParsedDefinitions> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        SequencerError::definition_load(format!("{}: {err}", path.display()))
    })?;
    ParsedDefinitions::from_json(&text)
}

impl DefinitionProvider for FileDefinitionProvider {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn change_marker(&self) -> Option<ChangeMarker> {
        std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
    }

    fn load_definitions(&self) -> Result<DefinitionSet> {
        Ok(self.parse()?.into_definition_set(&self.clock, &self.bridge))
    }
}

impl fmt::Debug for FileDefinitionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDefinitionProvider")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::manual::ManualBridge;
    use std::time::Duration;

    #[test]
    fn parses_numbers_and_ratios() {
        assert_eq!(parse_period("1/4").unwrap(), 0.25);
        assert_eq!(parse_period(" 3 / 2 ").unwrap(), 1.5);
        assert_eq!(parse_period(2).unwrap(), 2.0);
        assert_eq!(parse_period(0.75).unwrap(), 0.75);
        assert_eq!(parse_period("0.5").unwrap(), 0.5);
    }

    #[test]
    fn rejects_bad_periods() {
        for bad in ["bad", "1/0", "-1/4", "0", "1/x", "", "1.5/2"] {
            let err = parse_period(bad).unwrap_err();
            assert!(
                matches!(err, SequencerError::InvalidPeriodSpec(_)),
                "`{bad}` should be rejected"
            );
        }
        assert!(parse_period(0.0).is_err());
        assert!(parse_period(-2).is_err());
        assert!(parse_period(f64::NAN).is_err());
    }

    #[test]
    fn parses_definition_document() {
        let parsed = ParsedDefinitions::from_json(
            r#"{
                "bpm": 100,
                "loops": [
                    { "name": "kick", "period": 1, "sound": { "voice": "sine", "frequency": 55 } },
                    { "name": "hat", "period": "1/2", "offset": 0.25 }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(parsed.bpm, Some(100.0));
        let names: Vec<&str> = parsed.loops.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["kick", "hat"]);
        assert_eq!(parsed.loops[0].sound.frequency, 55.0);
        assert_eq!(parsed.loops[1].period_beats, 0.5);
        assert_eq!(parsed.loops[1].offset_beats, 0.25);
        assert_eq!(parsed.loops[1].sound, SoundSpec::default());
    }

    #[test]
    fn rejects_invalid_documents() {
        let cases = [
            r#"{ "loops": [ { "name": "a", "period": "nope" } ] }"#,
            r#"{ "loops": [ { "name": "a", "period": 1 }, { "name": "a", "period": 2 } ] }"#,
            r#"{ "loops": [ { "name": "a", "period": 1, "offset": 1 } ] }"#,
            r#"{ "loops": [ { "name": " ", "period": 1 } ] }"#,
            r#"{ "bpm": -4, "loops": [] }"#,
            r#"{ "loops": [ { "name": "a", "period": 1, "volume": 3 } ] }"#,
            r#"print("hello")"#,
        ];
        for case in cases {
            let err = ParsedDefinitions::from_json(case).unwrap_err();
            assert!(matches!(err, SequencerError::DefinitionLoad(_)), "{case}");
        }
    }

    #[test]
    fn file_callbacks_play_through_the_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loops.json");
        std::fs::write(
            &path,
            r#"{ "loops": [
                { "name": "bass", "period": 1, "sound": { "voice": "saw", "duration_beats": 1 } },
                { "name": "hat", "period": 1, "offset": 0.5 }
            ] }"#,
        )
        .unwrap();

        let clock = Arc::new(Clock::new(120.0).unwrap());
        let bridge = ManualBridge::new();
        let provider = FileDefinitionProvider::new(&path, clock, bridge.clone());
        assert!(provider.change_marker().is_some());

        let set = provider.load_definitions().unwrap();
        assert_eq!(set.loops.len(), 2);

        (set.loops[0].callback)().unwrap();
        let notes = bridge.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].voice, "saw");
        assert_eq!(notes[0].duration, Duration::from_millis(500));

        // Offset loops defer their note through a one-shot trigger.
        (set.loops[1].callback)().unwrap();
        assert_eq!(bridge.notes().len(), 1);
        assert_eq!(bridge.last_interval(), Some(Duration::from_millis(250)));
        bridge.fire(false);
        assert_eq!(bridge.notes().len(), 2);
    }

    #[test]
    fn missing_file_has_no_marker_and_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(Clock::default());
        let provider = FileDefinitionProvider::new(dir.path().join("absent.json"), clock, ManualBridge::new());

        assert!(provider.change_marker().is_none());
        assert!(matches!(
            provider.load_definitions(),
            Err(SequencerError::DefinitionLoad(_))
        ));
    }
}
