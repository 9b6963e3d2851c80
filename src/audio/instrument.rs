use serde::{Deserialize, Serialize};
use std::fmt;

/// General MIDI program number identifying a sound-font instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(pub u8);

impl InstrumentId {
    pub const ACOUSTIC_GRAND_PIANO: InstrumentId = InstrumentId(0);
    pub const WOODBLOCK: InstrumentId = InstrumentId(115);

    /// Every General MIDI program.
    pub fn general_midi() -> Vec<InstrumentId> {
        (0..128).map(InstrumentId).collect()
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A note as the instrument side receives it: tempo already applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayedNote {
    pub pitch: u8,
    pub velocity: u8,
    /// Seconds
    pub duration: f64,
}
