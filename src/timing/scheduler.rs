use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::clock::AudioClock;
use super::step_queue::{Step, StepQueue, TICK_DENOMINATOR, Tick};
use crate::config::PlayerConfig;
use crate::error::SchedulerError;

/// Receives the steps and metronome clicks the scheduler hands off.
///
/// `delay` is in seconds from the moment of the call.
pub trait ScheduleSink {
    fn schedule_step(&mut self, delay: f64, index: usize, step: &Step);
    fn schedule_click(&mut self, delay: f64, downbeat: bool);
}

/// What happened during one poll of the scheduler.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PollOutcome {
    /// Steps whose tick has been reached since the previous poll, in order.
    pub elapsed: Vec<(usize, Tick)>,
    /// Every step has been handed off and reached.
    pub finished: bool,
}

/// What a pause left behind.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PauseOutcome {
    /// Steps reached since the previous poll, in order.
    pub reached: Vec<(usize, Tick)>,
    /// Handed-off steps that will be handed off again on resume.
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingStep {
    index: usize,
    tick: Tick,
}

#[derive(Debug, Clone, Copy)]
struct Metronome {
    beat_ticks: Tick,
    beats_per_measure: u32,
    next_click_ms: f64,
    beat: u64,
}

/// Walks a [`StepQueue`] against an audio clock with a fixed lookahead.
pub struct PlaybackScheduler {
    queue: StepQueue,
    clock: Arc<dyn AudioClock>,
    /// Milliseconds per whole note.
    whole_note_length: f64,
    schedule_interval: Duration,
    schedule_period_ms: f64,
    current_tick: Tick,
    synced_tick: Tick,
    synced_timestamp_ms: f64,
    running: bool,
    pending: VecDeque<PendingStep>,
    metronome: Option<Metronome>,
}

impl PlaybackScheduler {
    pub fn new(
        queue: StepQueue,
        clock: Arc<dyn AudioClock>,
        whole_note_length: f64,
        config: &PlayerConfig,
    ) -> Result<Self, SchedulerError> {
        if !queue.is_sorted() {
            return Err(SchedulerError::UnsortedQueue);
        }
        let now = clock.current_time() * 1000.0;
        Ok(Self {
            queue,
            clock,
            whole_note_length,
            schedule_interval: config.schedule_interval(),
            schedule_period_ms: config.schedule_period_ms as f64,
            current_tick: 0,
            synced_tick: 0,
            synced_timestamp_ms: now,
            running: false,
            pending: VecDeque::new(),
            metronome: None,
        })
    }

    fn now_ms(&self) -> f64 {
        self.clock.current_time() * 1000.0
    }

    /// Milliseconds per tick at the current tempo.
    pub fn tick_duration(&self) -> f64 {
        self.whole_note_length / TICK_DENOMINATOR as f64
    }

    pub fn whole_note_length(&self) -> f64 {
        self.whole_note_length
    }

    pub fn schedule_interval(&self) -> Duration {
        self.schedule_interval
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    pub fn iteration_step(&self) -> usize {
        self.queue.iteration_step()
    }

    pub fn queue(&self) -> &StepQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_metronome_on(&self) -> bool {
        self.metronome.is_some()
    }

    /// Ticks that were handed off but have not been reached yet.
    pub fn pending_ticks(&self) -> Vec<Tick> {
        self.pending.iter().map(|p| p.tick).collect()
    }

    /// Seconds from now until `tick` at the current position, never negative.
    pub fn time_to_tick(&self, tick: Tick) -> f64 {
        let ahead = (tick as f64 - self.current_tick as f64) * self.tick_duration();
        ahead.max(0.0) / 1000.0
    }

    /// Fractional tick derived from the audio clock.
    fn exact_tick(&self, now_ms: f64) -> f64 {
        let elapsed = (now_ms - self.synced_timestamp_ms).max(0.0);
        self.synced_tick as f64 + elapsed / self.tick_duration()
    }

    /// Re-derives the current tick from the last synchronization point.
    fn update_current_tick(&mut self, now_ms: f64) {
        if self.running {
            self.current_tick = self.exact_tick(now_ms).round() as Tick;
        }
    }

    fn resync(&mut self, now_ms: f64) {
        self.synced_tick = self.current_tick;
        self.synced_timestamp_ms = now_ms;
    }

    /// Starts (or resumes) scheduling from the current tick.
    pub fn start(&mut self) {
        let now = self.now_ms();
        self.resync(now);
        self.running = true;
        if let Some(metronome) = self.metronome {
            self.align_metronome(metronome.beat_ticks, metronome.beats_per_measure, now);
        }
        debug!(tick = self.current_tick, step = self.iteration_step(), "Scheduler started");
    }

    /// Stops scheduling and forgets every handed-off step that was not reached.
    ///
    /// The queue is rewound to the first unreached step so resuming replays it.
    pub fn pause(&mut self) -> PauseOutcome {
        let mut outcome = PauseOutcome::default();
        if !self.running {
            return outcome;
        }
        let now = self.now_ms();
        self.update_current_tick(now);
        self.running = false;

        while let Some(pending) = self.pending.front() {
            if pending.tick > self.current_tick {
                break;
            }
            outcome.reached.push((pending.index, pending.tick));
            self.pending.pop_front();
        }

        outcome.cancelled = self.pending.len();
        if let Some(first) = self.pending.front() {
            self.queue.set_iteration_step(first.index);
        }
        self.pending.clear();
        debug!(
            tick = self.current_tick,
            step = self.iteration_step(),
            cancelled = outcome.cancelled,
            "Scheduler paused"
        );
        outcome
    }

    /// Back to the first step, not running.
    pub fn reset(&mut self) {
        self.running = false;
        self.pending.clear();
        self.queue.set_iteration_step(0);
        self.current_tick = 0;
        self.synced_tick = 0;
    }

    /// Moves the iteration cursor to `index` (clamped) and takes the current
    /// tick from that step. The clock anchor is left alone until `start`.
    pub fn set_iteration_step(&mut self, index: usize) -> usize {
        self.pending.clear();
        let index = self.queue.set_iteration_step(index);
        self.current_tick = self
            .queue
            .get(index)
            .map_or(self.queue.end_tick(), |step| step.tick);
        index
    }

    /// Changes the tempo. Ticks already elapsed keep their meaning.
    /// Clicks not handed off yet move with the new tempo.
    pub fn set_whole_note_length(&mut self, whole_note_length: f64) {
        let now = self.now_ms();
        let old_length = self.whole_note_length;
        if self.running {
            self.update_current_tick(now);
            self.resync(now);
        }
        self.whole_note_length = whole_note_length;

        let exact = self.exact_tick(now);
        let tick_duration = self.tick_duration();
        let running = self.running;
        if let Some(metronome) = self.metronome.as_mut() {
            metronome.next_click_ms = if running {
                let grid_tick = metronome.beat as f64 * metronome.beat_ticks as f64;
                now + (grid_tick - exact) * tick_duration
            } else {
                now + (metronome.next_click_ms - now) * whole_note_length / old_length
            };
        }
    }

    pub fn start_metronome(&mut self, beat_ticks: Tick, beats_per_measure: u32) {
        let now = self.now_ms();
        let beat_ticks = beat_ticks.max(1);
        if self.running {
            self.align_metronome(beat_ticks, beats_per_measure, now);
        } else {
            self.metronome = Some(Metronome {
                beat_ticks,
                beats_per_measure: beats_per_measure.max(1),
                next_click_ms: now,
                beat: 0,
            });
        }
    }

    pub fn stop_metronome(&mut self) {
        self.metronome = None;
    }

    /// Puts the next click on the next tick-grid beat.
    fn align_metronome(&mut self, beat_ticks: Tick, beats_per_measure: u32, now_ms: f64) {
        let exact = self.exact_tick(now_ms);
        let beat = (exact / beat_ticks as f64).ceil() as u64;
        let grid_tick = beat as f64 * beat_ticks as f64;
        self.metronome = Some(Metronome {
            beat_ticks,
            beats_per_measure: beats_per_measure.max(1),
            next_click_ms: now_ms + (grid_tick - exact) * self.tick_duration(),
            beat,
        });
    }

    /// One iteration of the lookahead loop; call every `schedule_interval`.
    pub fn poll(&mut self, sink: &mut dyn ScheduleSink) -> PollOutcome {
        let now = self.now_ms();
        let mut outcome = PollOutcome::default();

        if self.running {
            self.update_current_tick(now);

            while let Some(pending) = self.pending.front() {
                if pending.tick > self.current_tick {
                    break;
                }
                outcome.elapsed.push((pending.index, pending.tick));
                self.pending.pop_front();
            }

            let tick_duration = self.tick_duration();
            while let Some(step) = self.queue.next_step() {
                let ahead = (step.tick as f64 - self.current_tick as f64) * tick_duration;
                if ahead > self.schedule_period_ms {
                    break;
                }
                let index = self.queue.iteration_step();
                let delay = ahead.max(0.0) / 1000.0;
                trace!(index, tick = step.tick, delay, "Scheduling step");
                sink.schedule_step(delay, index, step);
                self.pending.push_back(PendingStep {
                    index,
                    tick: step.tick,
                });
                self.queue.advance();
            }

            outcome.finished = self.queue.is_finished() && self.pending.is_empty();
        }

        self.poll_metronome(now, sink);
        outcome
    }

    fn poll_metronome(&mut self, now_ms: f64, sink: &mut dyn ScheduleSink) {
        let tick_duration = self.tick_duration();
        let period = self.schedule_period_ms;
        let Some(metronome) = self.metronome.as_mut() else {
            return;
        };
        while metronome.next_click_ms - now_ms <= period {
            // Clicks missed while the loop was starved are dropped, not bunched up.
            if metronome.next_click_ms >= now_ms {
                let delay = (metronome.next_click_ms - now_ms) / 1000.0;
                let downbeat = metronome.beat % metronome.beats_per_measure as u64 == 0;
                sink.schedule_click(delay, downbeat);
            }
            metronome.next_click_ms += metronome.beat_ticks as f64 * tick_duration;
            metronome.beat += 1;
        }
    }
}
