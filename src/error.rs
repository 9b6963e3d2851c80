use crate::audio::InstrumentId;
use crate::timing::{PlaybackAction, PlaybackState};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A playback operation was called before a score finished loading.
    #[error("cannot {operation}: no score is loaded")]
    NotLoaded { operation: &'static str },
    #[error("illegal transition: {action:?} while {from:?}")]
    Transition {
        from: PlaybackState,
        action: PlaybackAction,
    },
    #[error("measure {measure} is out of range, the score has {count}")]
    MeasureOutOfRange { measure: usize, count: usize },
    #[error("tempo must be a positive number of beats per minute, got {0}")]
    InvalidTempo(f64),
    #[error("failed to load score: {0}")]
    Load(#[from] LoadError),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Score(#[from] ScoreError),
    #[error("fallback instrument {0} is unavailable")]
    FallbackUnavailable(InstrumentId),
    #[error("score contains no notes")]
    EmptyScore,
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    #[error("failed to read score: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse score: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("invalid score: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("step queue must be sorted before scheduling")]
    UnsortedQueue,
    #[error("event buffer is full")]
    BufferFull,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstrumentError {
    #[error("unknown instrument {0}")]
    Unknown(InstrumentId),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no default audio output device")]
    NoDevice,
    #[error("audio stream error: {0}")]
    Stream(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MidiError {
    #[error("MIDI init error: {0}")]
    Init(#[from] midir::InitError),
    #[error("no MIDI port matching {0:?}")]
    NoPort(String),
    #[error("failed to connect to MIDI port: {0}")]
    Connect(String),
    #[error("failed to send MIDI message: {0}")]
    Send(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("row at byte {offset} declares {declared} keys but only {remaining} bytes remain")]
    Truncated {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
    #[error("byte {offset} holds key {key}, which is not on an 88-key keyboard")]
    KeyOutOfRange { offset: usize, key: u8 },
}
