use serde::{Deserialize, Serialize};
use tracing::debug;

use super::circular_queue::{EMPTY_ROW, KEY_COUNT, row_from_keys};
use super::sequence::decode_event_sequence;

/// How far a live window is from the reference. Zero means identical.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    pub euclidean_error: f64,
    pub levenshtein_error: f64,
}

/// Compares two encoded event sequences.
pub trait SimilarityScorer: Send + Sync {
    /// `None` when no comparison can be made.
    fn score(&self, a: &[u8], b: &[u8]) -> Option<Similarity>;
}

/// Edit distance over the encoded bytes plus the Euclidean distance between
/// the decoded bitmaps, row by row.
#[derive(Debug, Clone, Copy, Default)]
pub struct EditDistanceScorer;

impl SimilarityScorer for EditDistanceScorer {
    fn score(&self, a: &[u8], b: &[u8]) -> Option<Similarity> {
        let (rows_a, rows_b) = match (decode_event_sequence(a), decode_event_sequence(b)) {
            (Ok(rows_a), Ok(rows_b)) => (rows_a, rows_b),
            (Err(e), _) | (_, Err(e)) => {
                debug!(error = %e, "Cannot score malformed event sequence");
                return None;
            }
        };
        Some(Similarity {
            euclidean_error: euclidean_distance(&rows_a, &rows_b),
            levenshtein_error: levenshtein(a, b) as f64,
        })
    }
}

/// Missing rows on the shorter side count as silence.
fn euclidean_distance(a: &[Vec<u8>], b: &[Vec<u8>]) -> f64 {
    let rows = a.len().max(b.len());
    let mut sum = 0.0;
    for i in 0..rows {
        let row_a = a.get(i).map_or(EMPTY_ROW, |keys| row_from_keys(keys));
        let row_b = b.get(i).map_or(EMPTY_ROW, |keys| row_from_keys(keys));
        for key in 0..KEY_COUNT {
            let diff = row_a[key] as f64 - row_b[key] as f64;
            sum += diff * diff;
        }
    }
    sum.sqrt()
}

fn levenshtein(a: &[u8], b: &[u8]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, &byte_a) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &byte_b) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(byte_a != byte_b);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
