//! Core library for the hotloop live-coding sequencer.
//!
//! The crate keeps a shared musical transport, runs named loops against it,
//! and swaps loop definitions from a frequently edited source while playback
//! continues. Sound production is delegated to an [`AudioBridge`]; where the
//! definitions come from is delegated to a [`DefinitionProvider`].

pub mod bridge;
pub mod clock;
pub mod config;
pub mod definitions;
pub mod error;
pub mod live_loop;
pub mod registry;
pub mod reload;
pub mod runtime;

pub use bridge::{AudioBridge, Note, OneShot, Repeating, ThreadedBridge, TriggerHandle};
pub use clock::{Clock, DEFAULT_BPM};
pub use config::{AppConfig, AudioConfig, ReloadConfig, ReloadFailurePolicy, TransportConfig};
pub use definitions::{
    parse_period, read_definitions, ChangeMarker, DefinitionProvider, DefinitionSet,
    FileDefinitionProvider, LoopDefinition, ParsedDefinitions, ParsedLoop, PeriodSpec, SoundSpec,
};
pub use error::{Result, SequencerError};
pub use live_loop::{callback, CallbackError, CallbackResult, LiveLoop, LoopCallback, LoopStatus};
pub use registry::LoopRegistry;
pub use reload::{HotReloader, ReloadOutcome, ReloaderHandle, ReloaderState};
pub use runtime::Runtime;
