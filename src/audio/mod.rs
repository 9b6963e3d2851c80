mod instrument;
mod midi_out;
mod player;

pub use instrument::{InstrumentId, PlayedNote};
pub use midi_out::{ChannelMap, MidiOut};
pub use player::{EventDrain, EventProducer, InstrumentPlayer, QueuedInstrumentPlayer};
