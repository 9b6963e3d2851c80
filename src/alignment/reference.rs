use super::circular_queue::{EMPTY_ROW, KeyRow, key_slot};
use crate::timing::{StepQueue, TICK_DENOMINATOR, Tick};

/// Samples the notes of `queue` the way the live buffer samples the keyboard.
///
/// Returns `rows` rows spaced `1 / sample_rate_hz` seconds apart, the last
/// one at `end_tick`. A key is down in a row when a note holds it at that
/// instant. Instants before the start of the score are silent.
pub fn render_reference(
    queue: &StepQueue,
    end_tick: Tick,
    whole_note_length: f64,
    sample_rate_hz: u32,
    rows: usize,
) -> Vec<KeyRow> {
    let mut window = vec![EMPTY_ROW; rows];
    if rows == 0 || sample_rate_hz == 0 {
        return window;
    }
    let tick_ms = whole_note_length / TICK_DENOMINATOR as f64;
    let period_ms = 1000.0 / sample_rate_hz as f64;
    let first_ms = end_tick as f64 * tick_ms - (rows - 1) as f64 * period_ms;
    let last_ms = end_tick as f64 * tick_ms;

    for step in queue.steps() {
        let start_ms = step.tick as f64 * tick_ms;
        if start_ms > last_ms {
            break;
        }
        for note in &step.notes {
            let Some(slot) = key_slot(note.pitch) else {
                continue;
            };
            let end_ms = (step.tick + note.duration) as f64 * tick_ms;
            if end_ms <= first_ms {
                continue;
            }
            let from = ((start_ms - first_ms) / period_ms).ceil().max(0.0) as usize;
            let to = (((end_ms - first_ms) / period_ms).ceil().max(0.0) as usize).min(rows);
            for row in &mut window[from.min(rows)..to] {
                row[slot] = 1;
            }
        }
    }
    window
}
