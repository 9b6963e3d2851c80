use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::audio::InstrumentId;
use crate::error::ConfigError;

/// Tunables for the playback scheduler and the alignment sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Wall-clock polling period of the scheduler loop.
    pub schedule_interval_ms: u64,
    /// Lookahead horizon handed to the instrument side on every poll.
    pub schedule_period_ms: u64,
    pub fallback_instrument: InstrumentId,
    pub metronome_instrument: InstrumentId,
    /// Rows sampled per second by the alignment buffer.
    pub sample_rate_hz: u32,
    pub sample_seconds: u32,
    /// Similarity is computed once every this many samples.
    pub score_every_samples: u32,
    /// Slots in the scheduled-event ring between engine and audio side.
    pub event_capacity: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            schedule_interval_ms: 200,
            schedule_period_ms: 500,
            fallback_instrument: InstrumentId::ACOUSTIC_GRAND_PIANO,
            metronome_instrument: InstrumentId::WOODBLOCK,
            sample_rate_hz: 35,
            sample_seconds: 4,
            score_every_samples: 35,
            event_capacity: 4096,
        }
    }
}

impl PlayerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ron_string = fs::read_to_string(path)?;
        let config: PlayerConfig = ron::from_str(&ron_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "schedule_interval_ms must be positive".into(),
            ));
        }
        if self.schedule_period_ms < self.schedule_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "schedule_period_ms ({}) must not be shorter than schedule_interval_ms ({})",
                self.schedule_period_ms, self.schedule_interval_ms
            )));
        }
        if self.sample_rate_hz == 0 || self.sample_seconds == 0 {
            return Err(ConfigError::Invalid(
                "sample_rate_hz and sample_seconds must be positive".into(),
            ));
        }
        if self.score_every_samples == 0 {
            return Err(ConfigError::Invalid(
                "score_every_samples must be positive".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sample_rate_hz as f64)
    }

    /// Number of rows held by the alignment window.
    pub fn sample_length(&self) -> usize {
        (self.sample_rate_hz * self.sample_seconds) as usize
    }
}
