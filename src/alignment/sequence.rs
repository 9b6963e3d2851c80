//! Flat byte form of an event matrix.
//!
//! Each row is a count byte followed by that many MIDI key numbers, so row
//! boundaries can be recovered without knowing the row count.

use super::circular_queue::key_slot;
use crate::error::DecodeError;

pub fn encode_event_sequence<R: AsRef<[u8]>>(rows: &[R]) -> Vec<u8> {
    let total: usize = rows.iter().map(|row| row.as_ref().len() + 1).sum();
    let mut encoded = Vec::with_capacity(total);
    for row in rows {
        let keys = row.as_ref();
        encoded.push(keys.len() as u8);
        encoded.extend_from_slice(keys);
    }
    encoded
}

pub fn decode_event_sequence(bytes: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError> {
    let mut rows = Vec::new();
    let mut offset = 0;
    while let Some(&declared) = bytes.get(offset) {
        let declared = declared as usize;
        let start = offset + 1;
        let Some(keys) = bytes.get(start..start + declared) else {
            return Err(DecodeError::Truncated {
                offset,
                declared,
                remaining: bytes.len() - start,
            });
        };
        if let Some(position) = keys.iter().position(|&key| key_slot(key).is_none()) {
            return Err(DecodeError::KeyOutOfRange {
                offset: start + position,
                key: keys[position],
            });
        }
        rows.push(keys.to_vec());
        offset = start + declared;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_length_prefixed() {
        let rows: Vec<Vec<u8>> = vec![vec![], vec![60, 64], vec![21]];
        assert_eq!(encode_event_sequence(&rows), vec![0, 2, 60, 64, 1, 21]);
    }

    #[test]
    fn decode_restores_rows() {
        let rows: Vec<Vec<u8>> = vec![vec![62], vec![], vec![], vec![48, 55, 64, 72], vec![108]];
        let encoded = encode_event_sequence(&rows);
        assert_eq!(decode_event_sequence(&encoded).unwrap(), rows);
        assert!(decode_event_sequence(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_row_is_reported() {
        assert_eq!(
            decode_event_sequence(&[1, 60, 3, 61, 62]),
            Err(DecodeError::Truncated {
                offset: 2,
                declared: 3,
                remaining: 2
            })
        );
    }

    #[test]
    fn keys_off_the_keyboard_are_rejected() {
        assert_eq!(
            decode_event_sequence(&[0, 2, 60, 12]),
            Err(DecodeError::KeyOutOfRange { offset: 3, key: 12 })
        );
    }
}
