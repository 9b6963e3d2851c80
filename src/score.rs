//! The score source: metadata plus a forward-only cursor over note groups.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::audio::InstrumentId;
use crate::error::ScoreError;
use crate::timing::Articulation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreNote {
    /// Offset from the start of the measure, in whole notes.
    pub start: f64,
    pub pitch: u8,
    /// Whole notes
    pub duration: f64,
    #[serde(default = "default_instrument")]
    pub instrument: InstrumentId,
    #[serde(default = "default_gain")]
    pub gain: f32,
    #[serde(default)]
    pub articulation: Articulation,
}

fn default_instrument() -> InstrumentId {
    InstrumentId::ACOUSTIC_GRAND_PIANO
}

fn default_gain() -> f32 {
    0.8
}

impl ScoreNote {
    pub fn new(start: f64, pitch: u8, duration: f64) -> Self {
        Self {
            start,
            pitch,
            duration,
            instrument: default_instrument(),
            gain: default_gain(),
            articulation: Articulation::Normal,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub notes: Vec<ScoreNote>,
}

/// One cursor stop: everything that starts at the same instant.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPosition {
    /// Whole notes from the start of the score.
    pub timestamp: f64,
    pub measure_index: usize,
    pub notes: Vec<ScoreNote>,
}

/// A rendered score as seen by the playback engine.
pub trait Score: Send {
    fn title(&self) -> &str;
    fn bpm(&self) -> f64;
    /// (beats per measure, beat unit)
    fn time_signature(&self) -> (u32, u32);
    fn instruments(&self) -> Vec<InstrumentId>;
    fn measure_count(&self) -> usize;

    fn reset_cursor(&mut self);
    /// Moves the cursor to the next position. No-op at the end.
    fn next(&mut self);
    fn is_end(&self) -> bool;
    /// `None` once the cursor has run past the last position.
    fn current(&self) -> Option<&CursorPosition>;
    fn set_cursor_visible(&mut self, visible: bool);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SheetFile {
    title: String,
    bpm: f64,
    time_signature: (u32, u32),
    measures: Vec<Measure>,
}

/// Score kept in memory and stored as RON.
#[derive(Debug, Clone)]
pub struct SheetScore {
    sheet: SheetFile,
    positions: Vec<CursorPosition>,
    cursor: usize,
    visible: bool,
}

impl SheetScore {
    pub fn new(
        title: impl Into<String>,
        bpm: f64,
        time_signature: (u32, u32),
        measures: Vec<Measure>,
    ) -> Result<Self, ScoreError> {
        Self::from_sheet(SheetFile {
            title: title.into(),
            bpm,
            time_signature,
            measures,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ScoreError> {
        let ron_string = fs::read_to_string(path)?;
        Self::from_ron_str(&ron_string)
    }

    pub fn from_ron_str(ron_string: &str) -> Result<Self, ScoreError> {
        let sheet: SheetFile = ron::from_str(ron_string)?;
        Self::from_sheet(sheet)
    }

    pub fn save(&self, path: &Path) -> Result<(), ScoreError> {
        let ron_string =
            ron::ser::to_string_pretty(&self.sheet, ron::ser::PrettyConfig::default())
                .map_err(|e| ScoreError::Invalid(e.to_string()))?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    /// Length of one measure in whole notes.
    pub fn measure_length(&self) -> f64 {
        let (beats, unit) = self.sheet.time_signature;
        beats as f64 / unit as f64
    }

    fn from_sheet(sheet: SheetFile) -> Result<Self, ScoreError> {
        if !(sheet.bpm.is_finite() && sheet.bpm > 0.0) {
            return Err(ScoreError::Invalid(format!("bpm must be positive, got {}", sheet.bpm)));
        }
        let (beats, unit) = sheet.time_signature;
        if beats == 0 || unit == 0 {
            return Err(ScoreError::Invalid(format!(
                "time signature {beats}/{unit} is not valid"
            )));
        }
        let measure_length = beats as f64 / unit as f64;

        let mut positions = Vec::new();
        for (measure_index, measure) in sheet.measures.iter().enumerate() {
            let measure_start = measure_index as f64 * measure_length;
            let mut notes = measure.notes.clone();
            for note in &notes {
                if !(0.0..measure_length).contains(&note.start) {
                    return Err(ScoreError::Invalid(format!(
                        "note {} in measure {measure_index} starts outside the measure",
                        note.pitch
                    )));
                }
                if !(note.duration > 0.0) {
                    return Err(ScoreError::Invalid(format!(
                        "note {} in measure {measure_index} has no duration",
                        note.pitch
                    )));
                }
            }
            notes.sort_by(|a, b| a.start.total_cmp(&b.start));

            // Every measure gets a stop at its start, even if it opens with a rest.
            let mut group = CursorPosition {
                timestamp: measure_start,
                measure_index,
                notes: Vec::new(),
            };
            for note in notes {
                let timestamp = measure_start + note.start;
                if (timestamp - group.timestamp).abs() > f64::EPSILON {
                    positions.push(group);
                    group = CursorPosition {
                        timestamp,
                        measure_index,
                        notes: Vec::new(),
                    };
                }
                group.notes.push(note);
            }
            positions.push(group);
        }

        Ok(Self {
            sheet,
            positions,
            cursor: 0,
            visible: false,
        })
    }

    pub fn is_cursor_visible(&self) -> bool {
        self.visible
    }
}

impl Score for SheetScore {
    fn title(&self) -> &str {
        &self.sheet.title
    }

    fn bpm(&self) -> f64 {
        self.sheet.bpm
    }

    fn time_signature(&self) -> (u32, u32) {
        self.sheet.time_signature
    }

    fn instruments(&self) -> Vec<InstrumentId> {
        let mut instruments: Vec<InstrumentId> = self
            .sheet
            .measures
            .iter()
            .flat_map(|m| m.notes.iter().map(|n| n.instrument))
            .collect();
        instruments.sort();
        instruments.dedup();
        instruments
    }

    fn measure_count(&self) -> usize {
        self.sheet.measures.len()
    }

    fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    fn next(&mut self) {
        if self.cursor < self.positions.len() {
            self.cursor += 1;
        }
    }

    fn is_end(&self) -> bool {
        self.cursor >= self.positions.len()
    }

    fn current(&self) -> Option<&CursorPosition> {
        self.positions.get(self.cursor)
    }

    fn set_cursor_visible(&mut self, visible: bool) {
        self.visible = visible;
    }
}
