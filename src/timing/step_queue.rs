use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::audio::InstrumentId;

/// Position in 1/1024ths of a whole note.
pub type Tick = u32;

/// Subdivisions per whole note.
pub const TICK_DENOMINATOR: Tick = 1024;

/// Converts a position expressed in whole notes to the nearest tick.
pub fn whole_notes_to_ticks(whole_notes: f64) -> Tick {
    (whole_notes * TICK_DENOMINATOR as f64).round().max(0.0) as Tick
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Articulation {
    #[default]
    Normal,
    Staccato,
    Tenuto,
    Accent,
}

/// A note to be triggered when its step comes up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub instrument: InstrumentId,
    /// MIDI key number.
    pub pitch: u8,
    pub duration: Tick,
    /// 0.0 -> 1.0
    pub gain: f32,
    #[serde(default)]
    pub articulation: Articulation,
}

impl NoteEvent {
    pub fn new(instrument: InstrumentId, pitch: u8, duration: Tick) -> Self {
        Self {
            instrument,
            pitch,
            duration,
            gain: 1.0,
            articulation: Articulation::Normal,
        }
    }

    /// Ticks the note actually sounds for once articulation is applied.
    pub fn sounding_duration(&self) -> Tick {
        match self.articulation {
            Articulation::Staccato => (self.duration / 2).max(1),
            _ => self.duration,
        }
    }

    pub fn velocity(&self) -> u8 {
        let gain = match self.articulation {
            Articulation::Accent => self.gain * 1.25,
            _ => self.gain,
        };
        (gain.clamp(0.0, 1.0) * 127.0).round() as u8
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Step {
    pub tick: Tick,
    pub notes: Vec<NoteEvent>,
}

/// Ordered collection of steps plus the index of the next unscheduled one.
///
/// Steps are created in scan order and must be sorted once before playback.
#[derive(Debug, Clone, Default)]
pub struct StepQueue {
    steps: Vec<Step>,
    by_tick: HashMap<Tick, usize>,
    index: usize,
    sorted: bool,
}

impl StepQueue {
    pub fn new() -> Self {
        Self {
            sorted: true,
            ..Default::default()
        }
    }

    /// Attaches `note` to the step at `tick`, creating the step if absent.
    pub fn add_note(&mut self, tick: Tick, note: NoteEvent) {
        self.create_step(tick).notes.push(note);
    }

    /// Makes sure a step exists at `tick`, even if no note starts there.
    pub fn create_step(&mut self, tick: Tick) -> &mut Step {
        let position = match self.by_tick.get(&tick) {
            Some(&position) => position,
            None => {
                if self.steps.last().is_some_and(|last| last.tick > tick) {
                    self.sorted = false;
                }
                self.steps.push(Step {
                    tick,
                    notes: Vec::new(),
                });
                self.by_tick.insert(tick, self.steps.len() - 1);
                self.steps.len() - 1
            }
        };
        &mut self.steps[position]
    }

    /// Tick right after the last step.
    pub fn first_empty_tick(&self) -> Tick {
        self.steps
            .iter()
            .map(|step| step.tick + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn sort(&mut self) {
        self.steps.sort_by_key(|step| step.tick);
        self.by_tick = self
            .steps
            .iter()
            .enumerate()
            .map(|(position, step)| (step.tick, position))
            .collect();
        self.sorted = true;
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn step_at_tick(&self, tick: Tick) -> Option<&Step> {
        self.by_tick.get(&tick).map(|&position| &self.steps[position])
    }

    /// Index of the first step at or after `tick`, `len()` if none.
    pub fn index_of_tick(&self, tick: Tick) -> usize {
        self.steps.partition_point(|step| step.tick < tick)
    }

    /// Index of the next step to schedule.
    pub fn iteration_step(&self) -> usize {
        self.index
    }

    /// Repositions the iteration cursor, clamped to `0..=len()`.
    pub fn set_iteration_step(&mut self, index: usize) -> usize {
        self.index = index.min(self.steps.len());
        self.index
    }

    pub fn next_step(&self) -> Option<&Step> {
        self.steps.get(self.index)
    }

    pub fn advance(&mut self) {
        if self.index < self.steps.len() {
            self.index += 1;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.index >= self.steps.len()
    }

    /// Tick of the last step, which marks the end of the score.
    pub fn end_tick(&self) -> Tick {
        self.steps.last().map_or(0, |step| step.tick)
    }
}
