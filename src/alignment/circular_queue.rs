use tracing::debug;

/// Keys on a full piano keyboard.
pub const KEY_COUNT: usize = 88;
/// MIDI number of A0, the key in bitmap slot 0.
pub const LOWEST_KEY: u8 = 21;

/// Pressed-key bitmap, one byte per key, nonzero when down.
pub type KeyRow = [u8; KEY_COUNT];

pub const EMPTY_ROW: KeyRow = [0; KEY_COUNT];

/// MIDI key numbers of the pressed keys in `row`, ascending.
pub fn pressed_keys(row: &KeyRow) -> Vec<u8> {
    row.iter()
        .enumerate()
        .filter(|(_, down)| **down != 0)
        .map(|(slot, _)| slot as u8 + LOWEST_KEY)
        .collect()
}

/// Bitmap with the given MIDI keys pressed; keys off the keyboard are skipped.
pub fn row_from_keys(keys: &[u8]) -> KeyRow {
    let mut row = EMPTY_ROW;
    for &key in keys {
        if let Some(slot) = key_slot(key) {
            row[slot] = 1;
        }
    }
    row
}

pub fn key_slot(key: u8) -> Option<usize> {
    let slot = key.checked_sub(LOWEST_KEY)? as usize;
    (slot < KEY_COUNT).then_some(slot)
}

/// Ring of the most recent sampled rows.
///
/// Always holds exactly `len()` rows; the oldest is overwritten first.
#[derive(Debug, Clone)]
pub struct MidiInfoCircularQueue {
    rows: Vec<KeyRow>,
    /// Sparse form of each row: pressed MIDI key numbers.
    events: Vec<Vec<u8>>,
    /// Next slot to write, which is also the oldest row.
    cursor: usize,
}

impl MidiInfoCircularQueue {
    pub fn new(sample_length: usize) -> Self {
        let sample_length = sample_length.max(1);
        Self {
            rows: vec![EMPTY_ROW; sample_length],
            events: vec![Vec::new(); sample_length],
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Writes `row` over the oldest slot. Rows that are not [`KEY_COUNT`]
    /// wide are dropped and `false` is returned.
    pub fn enqueue_row(&mut self, row: &[u8]) -> bool {
        let Ok(row) = KeyRow::try_from(row) else {
            debug!(width = row.len(), "Ignoring sample row of the wrong width");
            return false;
        };
        self.events[self.cursor] = pressed_keys(&row);
        self.rows[self.cursor] = row;
        self.cursor = (self.cursor + 1) % self.rows.len();
        true
    }

    pub fn clear(&mut self) {
        self.rows.fill(EMPTY_ROW);
        self.events.iter_mut().for_each(Vec::clear);
        self.cursor = 0;
    }

    /// Bitmaps oldest first.
    pub fn midi_matrix(&self) -> Vec<KeyRow> {
        let (front, back) = self.rows.split_at(self.cursor);
        back.iter().chain(front).copied().collect()
    }

    /// Pressed key numbers per row, oldest first.
    pub fn event_matrix(&self) -> Vec<Vec<u8>> {
        let (front, back) = self.events.split_at(self.cursor);
        back.iter().chain(front).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bit(slot: usize) -> KeyRow {
        let mut row = EMPTY_ROW;
        row[slot] = 1;
        row
    }

    fn set_bits(matrix: &[KeyRow]) -> Vec<Vec<usize>> {
        matrix
            .iter()
            .map(|row| (0..KEY_COUNT).filter(|&i| row[i] != 0).collect())
            .collect()
    }

    #[test]
    fn fourth_row_overwrites_the_oldest() {
        let mut queue = MidiInfoCircularQueue::new(3);
        for slot in [40, 41, 40, 42] {
            assert!(queue.enqueue_row(&bit(slot)));
        }
        assert_eq!(
            set_bits(&queue.midi_matrix()),
            vec![vec![41], vec![40], vec![42]]
        );
        assert_eq!(
            queue.event_matrix(),
            vec![vec![62], vec![61], vec![63]]
        );
    }

    #[test]
    fn keeps_last_rows_in_order_for_any_overflow() {
        let length = 5;
        for extra in 0..12 {
            let mut queue = MidiInfoCircularQueue::new(length);
            let total = length + extra;
            for i in 0..total {
                queue.enqueue_row(&bit(i));
            }
            let expected: Vec<Vec<usize>> = (extra..total).map(|i| vec![i]).collect();
            assert_eq!(set_bits(&queue.midi_matrix()), expected, "extra = {extra}");
            assert_eq!(queue.len(), length);
        }
    }

    #[test]
    fn wrong_width_rows_are_ignored() {
        let mut queue = MidiInfoCircularQueue::new(2);
        assert!(!queue.enqueue_row(&[1; 87]));
        assert!(!queue.enqueue_row(&[]));
        assert_eq!(queue.cursor(), 0);
        assert!(queue.event_matrix().iter().all(Vec::is_empty));
    }

    #[test]
    fn starts_silent_and_clears() {
        let mut queue = MidiInfoCircularQueue::new(4);
        assert_eq!(queue.midi_matrix(), vec![EMPTY_ROW; 4]);
        queue.enqueue_row(&row_from_keys(&[60, 64, 67]));
        assert_eq!(queue.event_matrix()[3], vec![60, 64, 67]);

        queue.clear();
        assert_eq!(queue.cursor(), 0);
        assert_eq!(queue.midi_matrix(), vec![EMPTY_ROW; 4]);
    }

    #[test]
    fn key_slots_cover_the_keyboard() {
        assert_eq!(key_slot(21), Some(0));
        assert_eq!(key_slot(108), Some(87));
        assert_eq!(key_slot(20), None);
        assert_eq!(key_slot(109), None);
        assert_eq!(pressed_keys(&row_from_keys(&[10, 21, 108, 120])), vec![21, 108]);
    }
}
