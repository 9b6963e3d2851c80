use std::collections::HashMap;

use midir::{MidiOutput, MidiOutputConnection};
use tracing::{info, warn};

use super::InstrumentId;
use crate::error::MidiError;
use crate::events::{Event, MidiMessage, ScheduledEvent};

const DRUM_CHANNEL: u8 = 9;
const ALL_NOTES_OFF: u8 = 123;

/// Gives every instrument its own melodic channel, sending a program change
/// the first time the instrument is heard.
#[derive(Debug, Default)]
pub struct ChannelMap {
    channels: HashMap<InstrumentId, u8>,
    next: u8,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, instrument: InstrumentId) -> Option<u8> {
        self.channels.get(&instrument).copied()
    }

    fn assign(&mut self, instrument: InstrumentId, out: &mut Vec<Vec<u8>>) -> u8 {
        if let Some(channel) = self.channel(instrument) {
            return channel;
        }
        if self.next == DRUM_CHANNEL {
            self.next += 1;
        }
        if self.next > 15 {
            warn!(%instrument, "Out of MIDI channels, reusing channel 0");
            self.next = 0;
        }
        let channel = self.next;
        self.next += 1;
        // A reused channel now belongs to the newcomer only.
        self.channels.retain(|_, c| *c != channel);
        self.channels.insert(instrument, channel);
        out.push(vec![0xC0 | channel, instrument.0 & 0x7F]);
        channel
    }

    /// Raw MIDI messages for `event`, program change included when needed.
    pub fn messages(&mut self, event: &Event) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        match event {
            Event::MidiEvent {
                instrument,
                message,
            } => {
                let channel = self.assign(*instrument, &mut out);
                out.push(match *message {
                    MidiMessage::NoteOn { pitch, velocity } => {
                        vec![0x90 | channel, pitch & 0x7F, velocity & 0x7F]
                    }
                    MidiMessage::NoteOff { pitch } => vec![0x80 | channel, pitch & 0x7F, 0],
                });
            }
            Event::StopAllNotes { instrument } => {
                if let Some(channel) = self.channel(*instrument) {
                    out.push(vec![0xB0 | channel, ALL_NOTES_OFF, 0]);
                }
            }
        }
        out
    }
}

/// Forwards drained events to a hardware or virtual synth.
pub struct MidiOut {
    connection: MidiOutputConnection,
    channels: ChannelMap,
}

impl MidiOut {
    /// Connects to the first output whose name contains `port_hint`, or the
    /// first output at all.
    pub fn connect(port_hint: Option<&str>) -> Result<Self, MidiError> {
        let midi_out = MidiOutput::new("etude")?;
        let ports = midi_out.ports();
        let port = match port_hint {
            Some(hint) => ports
                .iter()
                .find(|p| midi_out.port_name(p).is_ok_and(|name| name.contains(hint))),
            None => ports.first(),
        }
        .cloned()
        .ok_or_else(|| MidiError::NoPort(port_hint.unwrap_or("any output").to_string()))?;

        let name = midi_out.port_name(&port).unwrap_or_default();
        info!(port = %name, "Connecting MIDI output");
        let connection = midi_out
            .connect(&port, "etude-output")
            .map_err(|e| MidiError::Connect(e.to_string()))?;
        Ok(Self {
            connection,
            channels: ChannelMap::new(),
        })
    }

    pub fn send(&mut self, event: &ScheduledEvent) -> Result<(), MidiError> {
        for message in self.channels.messages(&event.event) {
            self.connection
                .send(&message)
                .map_err(|e| MidiError::Send(e.to_string()))?;
        }
        Ok(())
    }
}
