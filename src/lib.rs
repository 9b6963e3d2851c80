pub mod alignment;
pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod input;
pub mod score;
pub mod timing;

pub use alignment::{AlignmentService, Similarity, SimilarityScorer};
pub use config::PlayerConfig;
pub use engine::{EngineCommand, EngineHandle, EngineUpdate, PlaybackEngine, spawn_engine};
pub use events::PlaybackEvent;
pub use score::{Score, SheetScore};
pub use timing::PlaybackState;
