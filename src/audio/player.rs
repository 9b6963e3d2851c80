use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use tracing::{debug, warn};

use super::{InstrumentId, PlayedNote};
use crate::error::{InstrumentError, SchedulerError};
use crate::events::{Event, MidiMessage, ScheduledEvent};

/// The sound-font side of playback.
pub trait InstrumentPlayer: Send {
    fn available(&self) -> Vec<InstrumentId>;
    fn load(&mut self, id: InstrumentId) -> Result<(), InstrumentError>;
    /// Queues `notes` to start at `audio_time` seconds on the audio clock.
    fn schedule(&mut self, id: InstrumentId, audio_time: f64, notes: &[PlayedNote]);
    /// Silences the instrument and drops everything it has queued.
    fn stop(&mut self, id: InstrumentId);
}

pub type EventProducer = HeapProd<ScheduledEvent>;

fn new_epochs() -> Arc<Vec<AtomicU64>> {
    Arc::new((0..128).map(|_| AtomicU64::new(0)).collect())
}

/// Hands scheduled notes to the audio side through a lock-free ring.
pub struct QueuedInstrumentPlayer {
    producer: EventProducer,
    available: Vec<InstrumentId>,
    loaded: HashSet<InstrumentId>,
    epochs: Arc<Vec<AtomicU64>>,
}

impl QueuedInstrumentPlayer {
    pub fn new(capacity: usize, available: Vec<InstrumentId>) -> (Self, EventDrain) {
        let ring_buffer = HeapRb::<ScheduledEvent>::new(capacity);
        let (producer, consumer) = ring_buffer.split();
        let epochs = new_epochs();

        let player = Self {
            producer,
            available,
            loaded: HashSet::new(),
            epochs: epochs.clone(),
        };
        let drain = EventDrain {
            consumer,
            pending: Vec::new(),
            epochs,
            sounding: HashSet::new(),
        };
        (player, drain)
    }

    fn epoch(&self, id: InstrumentId) -> u64 {
        self.epochs[id.0 as usize].load(Ordering::Acquire)
    }

    fn push(&mut self, event: ScheduledEvent) -> Result<(), SchedulerError> {
        self.producer
            .try_push(event)
            .map_err(|_| SchedulerError::BufferFull)
    }
}

impl InstrumentPlayer for QueuedInstrumentPlayer {
    fn available(&self) -> Vec<InstrumentId> {
        self.available.clone()
    }

    fn load(&mut self, id: InstrumentId) -> Result<(), InstrumentError> {
        if !self.available.contains(&id) {
            return Err(InstrumentError::Unknown(id));
        }
        self.loaded.insert(id);
        Ok(())
    }

    fn schedule(&mut self, id: InstrumentId, audio_time: f64, notes: &[PlayedNote]) {
        if !self.loaded.contains(&id) {
            warn!(instrument = %id, "Dropping notes for an instrument that is not loaded");
            return;
        }
        let epoch = self.epoch(id);
        for note in notes {
            let on = ScheduledEvent {
                audio_time,
                epoch,
                event: Event::MidiEvent {
                    instrument: id,
                    message: MidiMessage::NoteOn {
                        pitch: note.pitch,
                        velocity: note.velocity,
                    },
                },
            };
            let off = ScheduledEvent {
                audio_time: audio_time + note.duration,
                epoch,
                event: Event::MidiEvent {
                    instrument: id,
                    message: MidiMessage::NoteOff { pitch: note.pitch },
                },
            };
            if self.push(on).and_then(|_| self.push(off)).is_err() {
                warn!(instrument = %id, pitch = note.pitch, "Event buffer is full, note dropped");
            }
        }
    }

    fn stop(&mut self, id: InstrumentId) {
        let epoch = self.epochs[id.0 as usize].fetch_add(1, Ordering::AcqRel) + 1;
        let stop = ScheduledEvent {
            audio_time: f64::NEG_INFINITY,
            epoch,
            event: Event::StopAllNotes { instrument: id },
        };
        if self.push(stop).is_err() {
            warn!(instrument = %id, "Event buffer is full, stop not queued");
        }
    }
}

/// Consumer side of [`QueuedInstrumentPlayer`]: releases events as the audio
/// clock reaches them.
pub struct EventDrain {
    consumer: HeapCons<ScheduledEvent>,
    /// Not yet due, sorted by audio time.
    pending: Vec<ScheduledEvent>,
    epochs: Arc<Vec<AtomicU64>>,
    sounding: HashSet<(InstrumentId, u8)>,
}

/// False once the event's instrument has been stopped after it was queued.
fn is_current(epochs: &[AtomicU64], event: &ScheduledEvent) -> bool {
    let instrument = match &event.event {
        Event::MidiEvent { instrument, .. } | Event::StopAllNotes { instrument } => *instrument,
    };
    event.epoch >= epochs[instrument.0 as usize].load(Ordering::Acquire)
}

impl EventDrain {
    /// Returns every event due at or before `now` (seconds), in time order.
    ///
    /// Events queued before a `stop` of their instrument are discarded; the
    /// stop itself is returned so the receiver can silence sounding notes.
    pub fn drain_due(&mut self, now: f64) -> Vec<ScheduledEvent> {
        while let Some(event) = self.consumer.try_pop() {
            self.pending.push(event);
        }
        self.pending
            .sort_by(|a, b| a.audio_time.total_cmp(&b.audio_time));

        let due_count = self.pending.partition_point(|e| e.audio_time <= now);
        let due: Vec<ScheduledEvent> = self.pending.drain(..due_count).collect();

        let mut released = Vec::with_capacity(due.len());
        for event in due {
            if !is_current(&self.epochs, &event) {
                continue;
            }
            match &event.event {
                Event::MidiEvent {
                    instrument,
                    message: MidiMessage::NoteOn { pitch, .. },
                } => {
                    self.sounding.insert((*instrument, *pitch));
                }
                Event::MidiEvent {
                    instrument,
                    message: MidiMessage::NoteOff { pitch },
                } => {
                    self.sounding.remove(&(*instrument, *pitch));
                }
                Event::StopAllNotes { instrument } => {
                    self.sounding.retain(|(i, _)| i != instrument);
                    debug!(instrument = %instrument, "All notes off");
                }
            }
            released.push(event);
        }

        let epochs = &self.epochs;
        self.pending.retain(|event| is_current(epochs, event));

        released
    }

    pub fn sounding(&self) -> usize {
        self.sounding.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIANO: InstrumentId = InstrumentId::ACOUSTIC_GRAND_PIANO;

    fn note(pitch: u8, duration: f64) -> PlayedNote {
        PlayedNote {
            pitch,
            velocity: 100,
            duration,
        }
    }

    fn messages(events: &[ScheduledEvent]) -> Vec<MidiMessage> {
        events
            .iter()
            .filter_map(|e| match &e.event {
                Event::MidiEvent { message, .. } => Some(*message),
                Event::StopAllNotes { .. } => None,
            })
            .collect()
    }

    #[test]
    fn load_rejects_unknown_instruments() {
        let (mut player, _drain) = QueuedInstrumentPlayer::new(16, vec![PIANO]);
        assert!(player.load(PIANO).is_ok());
        assert_eq!(
            player.load(InstrumentId(40)),
            Err(InstrumentError::Unknown(InstrumentId(40)))
        );
    }

    #[test]
    fn events_are_released_in_time_order() {
        let (mut player, mut drain) = QueuedInstrumentPlayer::new(16, vec![PIANO]);
        player.load(PIANO).unwrap();
        player.schedule(PIANO, 0.0, &[note(60, 1.0)]);
        player.schedule(PIANO, 0.5, &[note(64, 0.25)]);

        assert_eq!(
            messages(&drain.drain_due(0.6)),
            vec![
                MidiMessage::NoteOn {
                    pitch: 60,
                    velocity: 100
                },
                MidiMessage::NoteOn {
                    pitch: 64,
                    velocity: 100
                },
            ]
        );
        assert_eq!(drain.sounding(), 2);
        assert_eq!(
            messages(&drain.drain_due(1.0)),
            vec![
                MidiMessage::NoteOff { pitch: 64 },
                MidiMessage::NoteOff { pitch: 60 }
            ]
        );
        assert_eq!(drain.sounding(), 0);
        assert_eq!(drain.pending(), 0);
    }

    #[test]
    fn stop_discards_queued_notes() {
        let (mut player, mut drain) = QueuedInstrumentPlayer::new(16, vec![PIANO, InstrumentId::WOODBLOCK]);
        player.load(PIANO).unwrap();
        player.load(InstrumentId::WOODBLOCK).unwrap();
        player.schedule(PIANO, 0.0, &[note(60, 2.0)]);
        player.schedule(PIANO, 1.0, &[note(62, 0.5)]);
        player.schedule(InstrumentId::WOODBLOCK, 1.0, &[note(76, 0.05)]);
        drain.drain_due(0.1);
        assert_eq!(drain.sounding(), 1);

        player.stop(PIANO);
        let released = drain.drain_due(0.2);
        assert_eq!(
            released[0].event,
            Event::StopAllNotes { instrument: PIANO }
        );
        assert_eq!(drain.sounding(), 0);

        let later = drain.drain_due(5.0);
        assert_eq!(
            messages(&later),
            vec![
                MidiMessage::NoteOn {
                    pitch: 76,
                    velocity: 100
                },
                MidiMessage::NoteOff { pitch: 76 }
            ]
        );

        player.schedule(PIANO, 6.0, &[note(67, 0.5)]);
        assert_eq!(drain.drain_due(6.0).len(), 1);
    }

    #[test]
    fn unloaded_instrument_is_ignored() {
        let (mut player, mut drain) = QueuedInstrumentPlayer::new(16, vec![PIANO]);
        player.schedule(PIANO, 0.0, &[note(60, 1.0)]);
        assert!(drain.drain_due(10.0).is_empty());
    }

    #[test]
    fn full_ring_drops_notes() {
        let (mut player, mut drain) = QueuedInstrumentPlayer::new(3, vec![PIANO]);
        player.load(PIANO).unwrap();
        player.schedule(PIANO, 0.0, &[note(60, 1.0), note(64, 1.0)]);
        assert_eq!(drain.drain_due(10.0).len(), 3);
    }
}
