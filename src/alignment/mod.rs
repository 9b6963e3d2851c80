mod circular_queue;
mod reference;
mod sequence;
mod service;
mod similarity;

pub use circular_queue::{
    EMPTY_ROW, KEY_COUNT, KeyRow, LOWEST_KEY, MidiInfoCircularQueue, key_slot, pressed_keys,
    row_from_keys,
};
pub use reference::render_reference;
pub use sequence::{decode_event_sequence, encode_event_sequence};
pub use service::{AlignmentService, PressedKeys, SimilarityListener};
pub use similarity::{EditDistanceScorer, Similarity, SimilarityScorer};
