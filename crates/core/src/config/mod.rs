use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{clock::DEFAULT_BPM, Result, SequencerError};

/// Top-level configuration structure for the sequencer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    pub reload: ReloadConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections fall back to their
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.audio.validate()?;
        self.transport.validate()?;
        self.reload.validate()
    }
}

/// Boot parameters handed to the audio bridge once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub channels: u16,
    pub duplex: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            buffer_size: 256,
            channels: 2,
            duplex: false,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.buffer_size == 0 || self.channels == 0 {
            return Err(SequencerError::msg(format!(
                "audio config needs non-zero sample rate, buffer size and channels, got {self:?}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub bpm: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { bpm: DEFAULT_BPM }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.bpm.is_finite() || self.bpm <= 0.0 {
            return Err(SequencerError::InvalidTempo(self.bpm));
        }
        Ok(())
    }
}

/// What a failed reload does to the loops that were playing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadFailurePolicy {
    /// Loops are stopped before the definitions are read; a failed read
    /// leaves everything silent until the next good reload.
    #[default]
    Silence,
    /// Definitions are read first; a failed read leaves the running loops
    /// untouched.
    KeepPrevious,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub poll_interval_ms: u64,
    pub on_failure: ReloadFailurePolicy,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            on_failure: ReloadFailurePolicy::Silence,
        }
    }
}

impl ReloadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(SequencerError::msg("reload poll interval must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_boot_parameters() {
        let config = AppConfig::default();
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.buffer_size, 256);
        assert_eq!(config.audio.channels, 2);
        assert!(!config.audio.duplex);
        assert_eq!(config.transport.bpm, DEFAULT_BPM);
        assert_eq!(config.reload.poll_interval(), Duration::from_millis(200));
        assert_eq!(config.reload.on_failure, ReloadFailurePolicy::Silence);
    }

    #[test]
    fn loads_partial_config_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotloop.json");
        std::fs::write(
            &path,
            r#"{ "transport": { "bpm": 96 }, "reload": { "on_failure": "keep-previous" } }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.transport.bpm, 96.0);
        assert_eq!(config.reload.on_failure, ReloadFailurePolicy::KeepPrevious);
        assert_eq!(config.reload.poll_interval_ms, 200);
        assert_eq!(config.audio, AudioConfig::default());
    }

    #[test]
    fn rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotloop.json");
        std::fs::write(&path, r#"{ "transport": { "bpm": 0 } }"#).unwrap();
        assert!(matches!(
            AppConfig::load(&path),
            Err(SequencerError::InvalidTempo(_))
        ));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(SequencerError::Json(_))));
    }
}
