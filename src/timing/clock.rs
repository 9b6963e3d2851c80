//! Audio clock sources used as the scheduler's timebase.
//!
//! Everything downstream of the clock only asks for the current time in
//! seconds, so the same scheduler runs against a real output device, the
//! system monotonic clock, or a hand-driven clock in tests.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::Sender;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{error, info};

use crate::error::AudioError;

pub trait AudioClock: Send + Sync {
    /// Monotonically increasing time in seconds.
    fn current_time(&self) -> f64;
}

/// Wall clock measured from construction.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for SystemClock {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to.
#[derive(Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, ms: f64) {
        self.micros
            .fetch_add((ms * 1000.0).round() as u64, Ordering::Relaxed);
    }

    pub fn set_ms(&self, ms: f64) {
        self.micros
            .store((ms * 1000.0).round() as u64, Ordering::Relaxed);
    }
}

impl AudioClock for ManualClock {
    fn current_time(&self) -> f64 {
        self.micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

/// Counts frames rendered by the default output device.
///
/// The stream writes silence; it exists so the timebase advances with the
/// same sample clock the instrument side renders against. The stream lives on
/// its own thread because cpal streams are not `Send` on every host.
pub struct DeviceClock {
    frames: Arc<AtomicU64>,
    sample_rate: f64,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceClock {
    pub fn open() -> Result<Self, AudioError> {
        let frames = Arc::new(AtomicU64::new(0));
        let frames_audio = frames.clone();
        let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded::<()>(1);

        let thread = std::thread::spawn(move || {
            let stream = match open_stream(frames_audio) {
                Ok((stream, sample_rate)) => {
                    let _ = ready_tx.send(Ok(sample_rate));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = shutdown_rx.recv();
            drop(stream);
        });

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| AudioError::Stream("audio thread exited".into()))??;

        Ok(Self {
            frames,
            sample_rate,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

fn open_stream(frames: Arc<AtomicU64>) -> Result<(cpal::Stream, f64), AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let config = device
        .default_output_config()
        .map_err(|e| AudioError::Stream(e.to_string()))?;
    let stream_config: cpal::StreamConfig = config.into();

    let num_channels = (stream_config.channels as usize).max(1);
    let sample_rate = stream_config.sample_rate as f64;
    info!(num_channels, sample_rate, "Audio clock opened");

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                data.fill(0.0);
                frames.fetch_add((data.len() / num_channels) as u64, Ordering::Relaxed);
            },
            |err| error!(%err, "Audio clock stream error"),
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))?;
    stream
        .play()
        .map_err(|e| AudioError::Stream(e.to_string()))?;

    Ok((stream, sample_rate))
}

impl Drop for DeviceClock {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl AudioClock for DeviceClock {
    fn current_time(&self) -> f64 {
        self.frames.load(Ordering::Relaxed) as f64 / self.sample_rate
    }
}
