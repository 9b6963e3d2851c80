use crate::audio::InstrumentId;
use crate::timing::{PlaybackState, Tick};

/// An instrument event stamped with the audio time it must sound at.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEvent {
    /// Seconds on the audio clock.
    pub audio_time: f64,
    /// Stop generation of the instrument when the event was queued.
    pub epoch: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { pitch: u8, velocity: u8 },
    NoteOff { pitch: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    MidiEvent {
        instrument: InstrumentId,
        message: MidiMessage,
    },
    StopAllNotes {
        instrument: InstrumentId,
    },
}

/// Notifications emitted by the playback engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    StateChange(PlaybackState),
    /// The score cursor reached step `step`.
    Iteration {
        step: usize,
        tick: Tick,
        measure: Option<usize>,
    },
    Metronome(bool),
    /// The last step was reached.
    Finished,
}

pub type PlaybackListener = Box<dyn FnMut(&PlaybackEvent) + Send>;
