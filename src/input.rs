//! Live keyboard input feeding the alignment session.

use midir::{Ignore, MidiInput, MidiInputConnection};
use tracing::{debug, info};

use crate::alignment::{EMPTY_ROW, KeyRow, PressedKeys, key_slot, pressed_keys};
use crate::error::MidiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMessage {
    NoteOn { key: u8, velocity: u8 },
    NoteOff { key: u8 },
    AllNotesOff,
}

/// Reads the channel-voice messages a practice keyboard sends. A note-on
/// with zero velocity is a note-off.
pub fn parse_midi_message(bytes: &[u8]) -> Option<LiveMessage> {
    let (&status, data) = bytes.split_first()?;
    match (status & 0xF0, data) {
        (0x90, [key, velocity, ..]) if *velocity > 0 => Some(LiveMessage::NoteOn {
            key: *key,
            velocity: *velocity,
        }),
        (0x90 | 0x80, [key, _, ..]) => Some(LiveMessage::NoteOff { key: *key }),
        // All Sound Off / All Notes Off
        (0xB0, [120 | 123, _, ..]) => Some(LiveMessage::AllNotesOff),
        _ => None,
    }
}

/// Tracks which keys are held, as the 88-key bitmap the alignment buffer
/// samples.
#[derive(Debug, Clone)]
pub struct LiveKeyboard {
    row: KeyRow,
}

impl Default for LiveKeyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveKeyboard {
    pub fn new() -> Self {
        Self { row: EMPTY_ROW }
    }

    pub fn row(&self) -> &KeyRow {
        &self.row
    }

    pub fn pressed(&self) -> Vec<u8> {
        pressed_keys(&self.row)
    }

    /// Returns whether the bitmap changed.
    pub fn note_on(&mut self, key: u8) -> bool {
        self.set(key, 1)
    }

    pub fn note_off(&mut self, key: u8) -> bool {
        self.set(key, 0)
    }

    pub fn release_all(&mut self) -> bool {
        let changed = self.row != EMPTY_ROW;
        self.row = EMPTY_ROW;
        changed
    }

    fn set(&mut self, key: u8, value: u8) -> bool {
        let Some(slot) = key_slot(key) else {
            debug!(key, "Key outside the keyboard range");
            return false;
        };
        let changed = self.row[slot] != value;
        self.row[slot] = value;
        changed
    }

    pub fn apply(&mut self, message: LiveMessage) -> bool {
        match message {
            LiveMessage::NoteOn { key, .. } => self.note_on(key),
            LiveMessage::NoteOff { key } => self.note_off(key),
            LiveMessage::AllNotesOff => self.release_all(),
        }
    }

    /// Applies a raw MIDI message. Anything that is not a note message is
    /// ignored.
    pub fn handle_bytes(&mut self, bytes: &[u8]) -> bool {
        parse_midi_message(bytes).is_some_and(|message| self.apply(message))
    }
}

/// Connects to the first MIDI input whose name contains `port_hint` (or the
/// first input at all) and keeps `keys` in sync with what is held.
pub fn connect_live_input(
    port_hint: Option<&str>,
    keys: PressedKeys,
) -> Result<MidiInputConnection<LiveKeyboard>, MidiError> {
    let mut midi_in = MidiInput::new("etude")?;
    midi_in.ignore(Ignore::All);

    let ports = midi_in.ports();
    let port = match port_hint {
        Some(hint) => ports
            .iter()
            .find(|p| midi_in.port_name(p).is_ok_and(|name| name.contains(hint))),
        None => ports.first(),
    }
    .cloned()
    .ok_or_else(|| MidiError::NoPort(port_hint.unwrap_or("any input").to_string()))?;

    let name = midi_in.port_name(&port).unwrap_or_default();
    info!(port = %name, "Connecting MIDI input");

    midi_in
        .connect(
            &port,
            "etude-input",
            move |_, message, keyboard: &mut LiveKeyboard| {
                if keyboard.handle_bytes(message) {
                    keys.set(keyboard.row());
                }
            },
            LiveKeyboard::new(),
        )
        .map_err(|e| MidiError::Connect(e.to_string()))
}
