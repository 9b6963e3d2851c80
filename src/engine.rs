use crate::alignment::{encode_event_sequence, pressed_keys, render_reference};
use crate::audio::{InstrumentId, InstrumentPlayer, PlayedNote};
use crate::config::PlayerConfig;
use crate::error::{EngineError, LoadError};
use crate::events::{PlaybackEvent, PlaybackListener};
use crate::score::Score;
use crate::timing::{
    AudioClock, NoteEvent, PlaybackAction, PlaybackScheduler, PlaybackState, ScheduleSink, Step,
    StepQueue, TICK_DENOMINATOR, Tick, whole_notes_to_ticks,
};
use crossbeam::channel::{Receiver, Sender};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

const CLICK_SECONDS: f64 = 0.05;
const DOWNBEAT_PITCH: u8 = 76;
const BEAT_PITCH: u8 = 77;

/// Milliseconds per whole note for a tempo given in beats of `1/denominator`.
pub fn whole_note_length(bpm: f64, denominator: u32) -> f64 {
    (60.0 / bpm) * denominator as f64 * 1000.0
}

/// Owns the loaded score, its scheduler and the instrument side.
pub struct PlaybackEngine {
    config: PlayerConfig,
    clock: Arc<dyn AudioClock>,
    player: Box<dyn InstrumentPlayer>,
    score: Option<Box<dyn Score>>,
    scheduler: Option<PlaybackScheduler>,
    state: PlaybackState,
    bpm: f64,
    time_signature: (u32, u32),
    /// Tick and measure of every score cursor position, in traversal order.
    position_ticks: Vec<Tick>,
    position_measures: Vec<usize>,
    /// Index of the position the score cursor is on.
    cursor_position: usize,
    loaded_instruments: Vec<InstrumentId>,
    metronome_instrument: InstrumentId,
    metronome: bool,
    listeners: Vec<PlaybackListener>,
}

/// Turns scheduler hand-offs into instrument calls at absolute audio times.
struct EngineSink<'a> {
    player: &'a mut dyn InstrumentPlayer,
    /// Seconds on the audio clock when the poll started.
    now: f64,
    /// Seconds per tick.
    tick_seconds: f64,
    metronome_instrument: InstrumentId,
}

impl ScheduleSink for EngineSink<'_> {
    fn schedule_step(&mut self, delay: f64, _index: usize, step: &Step) {
        let mut by_instrument: BTreeMap<InstrumentId, Vec<PlayedNote>> = BTreeMap::new();
        for note in &step.notes {
            by_instrument
                .entry(note.instrument)
                .or_default()
                .push(PlayedNote {
                    pitch: note.pitch,
                    velocity: note.velocity(),
                    duration: note.sounding_duration() as f64 * self.tick_seconds,
                });
        }
        for (instrument, notes) in by_instrument {
            self.player.schedule(instrument, self.now + delay, &notes);
        }
    }

    fn schedule_click(&mut self, delay: f64, downbeat: bool) {
        let click = PlayedNote {
            pitch: if downbeat { DOWNBEAT_PITCH } else { BEAT_PITCH },
            velocity: if downbeat { 127 } else { 90 },
            duration: CLICK_SECONDS,
        };
        self.player
            .schedule(self.metronome_instrument, self.now + delay, &[click]);
    }
}

impl PlaybackEngine {
    pub fn new(
        config: PlayerConfig,
        clock: Arc<dyn AudioClock>,
        player: Box<dyn InstrumentPlayer>,
    ) -> Self {
        let metronome_instrument = config.metronome_instrument;
        Self {
            config,
            clock,
            player,
            score: None,
            scheduler: None,
            state: PlaybackState::Init,
            bpm: 120.0,
            time_signature: (4, 4),
            position_ticks: Vec::new(),
            position_measures: Vec::new(),
            cursor_position: 0,
            loaded_instruments: Vec::new(),
            metronome_instrument,
            metronome: false,
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: PlaybackListener) {
        self.listeners.push(listener);
    }

    fn emit(&mut self, event: PlaybackEvent) {
        debug!(?event, "Playback event");
        for listener in &mut self.listeners {
            listener(&event);
        }
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "Playback state changed");
            self.state = state;
            self.emit(PlaybackEvent::StateChange(state));
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn time_signature(&self) -> (u32, u32) {
        self.time_signature
    }

    pub fn whole_note_length(&self) -> f64 {
        whole_note_length(self.bpm, self.time_signature.1)
    }

    pub fn is_metronome_on(&self) -> bool {
        self.metronome
    }

    pub fn current_tick(&self) -> Option<Tick> {
        self.scheduler.as_ref().map(|s| s.current_tick())
    }

    pub fn current_step(&self) -> Option<usize> {
        self.scheduler.as_ref().map(|s| s.iteration_step())
    }

    pub fn queue(&self) -> Option<&StepQueue> {
        self.scheduler.as_ref().map(|s| s.queue())
    }

    pub fn measure_count(&self) -> usize {
        self.score.as_ref().map_or(0, |s| s.measure_count())
    }

    /// Measure the score cursor is in.
    pub fn current_measure(&self) -> Option<usize> {
        self.score
            .as_ref()
            .and_then(|s| s.current())
            .map(|p| p.measure_index)
    }

    /// The score around the playhead, sampled and encoded like the live
    /// alignment window so the two can be scored against each other.
    pub fn reference_sequence(&self) -> Option<Vec<u8>> {
        let scheduler = self.scheduler.as_ref()?;
        let window = render_reference(
            scheduler.queue(),
            scheduler.current_tick(),
            scheduler.whole_note_length(),
            self.config.sample_rate_hz,
            self.config.sample_length(),
        );
        let rows: Vec<Vec<u8>> = window.iter().map(pressed_keys).collect();
        Some(encode_event_sequence(&rows))
    }

    pub fn schedule_interval(&self) -> std::time::Duration {
        self.config.schedule_interval()
    }

    /// Whether the polling loop has anything to do.
    pub fn needs_poll(&self) -> bool {
        self.state == PlaybackState::Playing || self.metronome
    }

    fn loaded(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.scheduler.is_none() || self.score.is_none() {
            return Err(EngineError::NotLoaded { operation });
        }
        Ok(())
    }

    /// Loads every instrument the score references, mapping the ones the
    /// player cannot provide onto the fallback instrument.
    fn load_instruments(
        &mut self,
        instruments: &[InstrumentId],
    ) -> Result<HashMap<InstrumentId, InstrumentId>, LoadError> {
        let fallback = self.config.fallback_instrument;
        let available = self.player.available();
        let mut mapping = HashMap::new();
        let mut loaded = Vec::new();

        for &id in instruments {
            let result = if available.contains(&id) {
                self.player.load(id)
            } else {
                Err(crate::error::InstrumentError::Unknown(id))
            };
            match result {
                Ok(()) => {
                    mapping.insert(id, id);
                    loaded.push(id);
                }
                Err(e) => {
                    warn!(instrument = %id, %fallback, error = %e, "Instrument unavailable, using fallback");
                    mapping.insert(id, fallback);
                }
            }
        }

        if !loaded.contains(&fallback) {
            if !available.contains(&fallback) || self.player.load(fallback).is_err() {
                return Err(LoadError::FallbackUnavailable(fallback));
            }
            loaded.push(fallback);
        }

        let wanted = self.config.metronome_instrument;
        self.metronome_instrument = if loaded.contains(&wanted)
            || (available.contains(&wanted) && self.player.load(wanted).is_ok())
        {
            wanted
        } else {
            warn!(instrument = %wanted, "Metronome sound unavailable, using fallback");
            fallback
        };

        self.loaded_instruments = loaded;
        Ok(mapping)
    }

    /// Replaces the current score.
    ///
    /// On failure the engine is left in `Init` and the load must be retried.
    pub fn load_score(&mut self, mut score: Box<dyn Score>) -> Result<(), EngineError> {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.reset();
            self.cancel_notes();
        }
        self.scheduler = None;
        self.score = None;
        self.set_state(PlaybackState::Init);

        let bpm = score.bpm();
        let time_signature = score.time_signature();
        let mapping = self.load_instruments(&score.instruments())?;

        let mut queue = StepQueue::new();
        let mut position_ticks = Vec::new();
        let mut position_measures = Vec::new();
        score.reset_cursor();
        while let Some(position) = score.current() {
            let tick = whole_notes_to_ticks(position.timestamp);
            position_ticks.push(tick);
            position_measures.push(position.measure_index);
            queue.create_step(tick);
            for note in &position.notes {
                let duration = whole_notes_to_ticks(note.duration).max(1);
                queue.add_note(
                    tick,
                    NoteEvent {
                        instrument: mapping
                            .get(&note.instrument)
                            .copied()
                            .unwrap_or(self.config.fallback_instrument),
                        pitch: note.pitch,
                        duration,
                        gain: note.gain,
                        articulation: note.articulation,
                    },
                );
                queue.create_step(tick + duration);
            }
            score.next();
        }
        if position_ticks.is_empty() {
            return Err(LoadError::EmptyScore.into());
        }

        let (beats, unit) = time_signature;
        let score_end = whole_notes_to_ticks(score.measure_count() as f64 * beats as f64 / unit as f64);
        let last_tick = queue.first_empty_tick().saturating_sub(1);
        queue.create_step(score_end.max(last_tick));
        queue.sort();

        score.reset_cursor();
        score.set_cursor_visible(false);

        let steps = queue.len();
        let mut scheduler = PlaybackScheduler::new(
            queue,
            self.clock.clone(),
            whole_note_length(bpm, unit),
            &self.config,
        )
        .map_err(LoadError::from)?;
        if self.metronome {
            scheduler.start_metronome(TICK_DENOMINATOR / unit, beats);
        }

        info!(title = score.title(), bpm, steps, measures = score.measure_count(), "Score loaded");
        self.bpm = bpm;
        self.time_signature = time_signature;
        self.position_ticks = position_ticks;
        self.position_measures = position_measures;
        self.cursor_position = 0;
        self.score = Some(score);
        self.scheduler = Some(scheduler);

        let next = self.state.transition(PlaybackAction::LoadComplete)?;
        self.set_state(next);
        Ok(())
    }

    /// Silences every score instrument and drops what they have queued.
    fn cancel_notes(&mut self) {
        for &id in &self.loaded_instruments {
            self.player.stop(id);
        }
    }

    pub fn play(&mut self) -> Result<(), EngineError> {
        self.loaded("play")?;
        let next = self.state.transition(PlaybackAction::Play)?;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.start();
        }
        if let Some(score) = self.score.as_mut() {
            score.set_cursor_visible(true);
        }
        self.set_state(next);
        self.poll();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        self.loaded("pause")?;
        let next = self.state.transition(PlaybackAction::Pause)?;
        if self.state == PlaybackState::Playing {
            let reached = self
                .scheduler
                .as_mut()
                .map(|scheduler| scheduler.pause().reached)
                .unwrap_or_default();
            self.cancel_notes();
            self.report_reached(reached);
        }
        self.set_state(next);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), EngineError> {
        self.loaded("stop")?;
        let next = self.state.transition(PlaybackAction::Stop)?;
        if self.state != PlaybackState::Stopped {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.reset();
            }
            self.cancel_notes();
            if let Some(score) = self.score.as_mut() {
                score.reset_cursor();
                score.set_cursor_visible(false);
            }
            self.cursor_position = 0;
        }
        self.set_state(next);
        Ok(())
    }

    /// Moves playback to the first position of `measure`.
    ///
    /// The score cursor only moves forward, so jumping backwards replays it
    /// from the start.
    pub fn jump_to_measure(&mut self, measure: usize) -> Result<(), EngineError> {
        self.loaded("jump to a measure")?;
        let next = self.state.transition(PlaybackAction::Seek)?;
        let count = self.measure_count();
        if measure >= count {
            return Err(EngineError::MeasureOutOfRange { measure, count });
        }

        let was_playing = self.state == PlaybackState::Playing;
        if was_playing {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.pause();
            }
            self.cancel_notes();
        }

        let target = self.position_measures.partition_point(|&m| m < measure);
        let Some(score) = self.score.as_mut() else {
            return Err(EngineError::NotLoaded {
                operation: "jump to a measure",
            });
        };
        if target < self.cursor_position || score.is_end() {
            score.reset_cursor();
            self.cursor_position = 0;
        }
        while let Some(position) = score.current() {
            if position.measure_index >= measure {
                break;
            }
            score.next();
            self.cursor_position += 1;
        }

        let tick = self
            .position_ticks
            .get(self.cursor_position)
            .copied()
            .unwrap_or_default();
        let Some(scheduler) = self.scheduler.as_mut() else {
            return Err(EngineError::NotLoaded {
                operation: "jump to a measure",
            });
        };
        let step = scheduler.queue().index_of_tick(tick);
        scheduler.set_iteration_step(step);
        if was_playing {
            scheduler.start();
        }
        info!(measure, step, tick, "Jumped to measure");

        self.emit(PlaybackEvent::Iteration {
            step,
            tick,
            measure: Some(measure),
        });
        self.set_state(next);
        Ok(())
    }

    pub fn set_bpm(&mut self, bpm: f64) -> Result<(), EngineError> {
        self.loaded("set the tempo")?;
        if !(bpm.is_finite() && bpm > 0.0) {
            return Err(EngineError::InvalidTempo(bpm));
        }
        self.bpm = bpm;
        let length = self.whole_note_length();
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.set_whole_note_length(length);
        }
        info!(bpm, whole_note_length = length, "Tempo changed");
        Ok(())
    }

    pub fn start_metronome(&mut self) -> Result<(), EngineError> {
        self.loaded("start the metronome")?;
        if self.metronome {
            return Ok(());
        }
        let (beats, unit) = self.time_signature;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.start_metronome(TICK_DENOMINATOR / unit, beats);
        }
        self.metronome = true;
        self.emit(PlaybackEvent::Metronome(true));
        self.poll();
        Ok(())
    }

    pub fn stop_metronome(&mut self) -> Result<(), EngineError> {
        self.loaded("stop the metronome")?;
        if !self.metronome {
            return Ok(());
        }
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.stop_metronome();
        }
        self.metronome = false;
        // A click sound shared with the score must not cut the score notes.
        if !self.loaded_instruments.contains(&self.metronome_instrument) {
            self.player.stop(self.metronome_instrument);
        }
        self.emit(PlaybackEvent::Metronome(false));
        Ok(())
    }

    /// Follows reached steps with the score cursor and emits their
    /// `Iteration` events.
    fn report_reached(&mut self, reached: Vec<(usize, Tick)>) {
        for (step, tick) in reached {
            let Some(score) = self.score.as_mut() else {
                break;
            };
            while self
                .position_ticks
                .get(self.cursor_position + 1)
                .is_some_and(|&next| next <= tick)
            {
                score.next();
                self.cursor_position += 1;
            }
            let measure = score.current().map(|p| p.measure_index);
            self.emit(PlaybackEvent::Iteration {
                step,
                tick,
                measure,
            });
        }
    }

    /// One pass of the scheduling loop; the owner calls this every
    /// `schedule_interval` while [`needs_poll`](Self::needs_poll) holds.
    pub fn poll(&mut self) {
        let now = self.clock.current_time();
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        let mut sink = EngineSink {
            player: self.player.as_mut(),
            now,
            tick_seconds: scheduler.tick_duration() / 1000.0,
            metronome_instrument: self.metronome_instrument,
        };
        let outcome = scheduler.poll(&mut sink);
        self.report_reached(outcome.elapsed);

        if outcome.finished && self.state == PlaybackState::Playing {
            info!("Reached the end of the score");
            self.emit(PlaybackEvent::Finished);
            if let Err(e) = self.stop() {
                error!(error = %e, "Failed to stop at the end of the score");
            }
        }
    }
}

pub enum EngineCommand {
    LoadScore(Box<dyn Score>),
    Play,
    Pause,
    Stop,
    JumpToMeasure(usize),
    StartMetronome,
    StopMetronome,
    SetBpm(f64),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    ScoreLoaded {
        title: String,
        measures: usize,
        bpm: f64,
    },
    Playback(PlaybackEvent),
    /// Encoded reference window at the playhead, sent after every poll
    /// while playing.
    Reference(Vec<u8>),
    Error { message: String },
}

/// Channels to an engine running on its own thread.
pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn send(&self, command: EngineCommand) {
        if self.command_tx.send(command).is_err() {
            warn!("Engine thread is gone, command dropped");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Moves `engine` onto a dedicated thread that polls it every schedule
/// interval and applies commands between polls.
pub fn spawn_engine(mut engine: PlaybackEngine) -> EngineHandle {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();

    let listener_tx = update_tx.clone();
    engine.add_listener(Box::new(move |event| {
        let _ = listener_tx.send(EngineUpdate::Playback(event.clone()));
    }));

    let thread = std::thread::spawn(move || {
        engine_thread(engine, command_rx, update_tx);
    });

    EngineHandle {
        command_tx,
        update_rx,
        thread: Some(thread),
    }
}

fn engine_thread(
    mut engine: PlaybackEngine,
    command_rx: Receiver<EngineCommand>,
    update_tx: Sender<EngineUpdate>,
) {
    let ticker = crossbeam::channel::tick(engine.schedule_interval());

    loop {
        crossbeam::channel::select! {
            recv(command_rx) -> msg => {
                let command = match msg {
                    Ok(EngineCommand::Shutdown) | Err(_) => break,
                    Ok(command) => command,
                };
                let result = match command {
                    EngineCommand::LoadScore(score) => {
                        let title = score.title().to_string();
                        let measures = score.measure_count();
                        let bpm = score.bpm();
                        engine.load_score(score).map(|()| {
                            let _ = update_tx.send(EngineUpdate::ScoreLoaded {
                                title,
                                measures,
                                bpm,
                            });
                        })
                    }
                    EngineCommand::Play => engine.play(),
                    EngineCommand::Pause => engine.pause(),
                    EngineCommand::Stop => engine.stop(),
                    EngineCommand::JumpToMeasure(measure) => engine.jump_to_measure(measure),
                    EngineCommand::StartMetronome => engine.start_metronome(),
                    EngineCommand::StopMetronome => engine.stop_metronome(),
                    EngineCommand::SetBpm(bpm) => engine.set_bpm(bpm),
                    EngineCommand::Shutdown => break,
                };
                if let Err(e) = result {
                    error!(error = %e, "Engine command failed");
                    let _ = update_tx.send(EngineUpdate::Error {
                        message: e.to_string(),
                    });
                }
            }
            recv(ticker) -> _ => {
                if engine.needs_poll() {
                    engine.poll();
                }
                if engine.state() == PlaybackState::Playing {
                    if let Some(reference) = engine.reference_sequence() {
                        let _ = update_tx.send(EngineUpdate::Reference(reference));
                    }
                }
            }
        }
    }

    if engine.state() != PlaybackState::Init {
        let _ = engine.stop();
    }
    debug!("Engine thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstrumentError;
    use crate::score::{Measure, ScoreNote, SheetScore};
    use crate::timing::{ManualClock, SystemClock};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Schedule(InstrumentId, f64, Vec<u8>),
        Stop(InstrumentId),
    }

    #[derive(Clone)]
    struct RecordingPlayer {
        available: Vec<InstrumentId>,
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl RecordingPlayer {
        fn new(available: Vec<InstrumentId>) -> Self {
            Self {
                available,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    impl InstrumentPlayer for RecordingPlayer {
        fn available(&self) -> Vec<InstrumentId> {
            self.available.clone()
        }

        fn load(&mut self, id: InstrumentId) -> Result<(), InstrumentError> {
            if self.available.contains(&id) {
                Ok(())
            } else {
                Err(InstrumentError::Unknown(id))
            }
        }

        fn schedule(&mut self, id: InstrumentId, audio_time: f64, notes: &[PlayedNote]) {
            let pitches = notes.iter().map(|n| n.pitch).collect();
            self.calls.lock().push(Call::Schedule(id, audio_time, pitches));
        }

        fn stop(&mut self, id: InstrumentId) {
            self.calls.lock().push(Call::Stop(id));
        }
    }

    const PIANO: InstrumentId = InstrumentId::ACOUSTIC_GRAND_PIANO;

    /// 4/4 at 120 bpm, quarter notes on beats 1-3 of every measure.
    fn score(measures: usize) -> Box<dyn Score> {
        let measures = (0..measures)
            .map(|m| Measure {
                notes: (0..3)
                    .map(|beat| ScoreNote::new(beat as f64 * 0.25, 60 + m as u8, 0.25))
                    .collect(),
            })
            .collect();
        Box::new(SheetScore::new("test", 120.0, (4, 4), measures).unwrap())
    }

    struct Fixture {
        engine: PlaybackEngine,
        clock: ManualClock,
        player: RecordingPlayer,
        events: Arc<Mutex<Vec<PlaybackEvent>>>,
    }

    fn fixture(config: PlayerConfig, available: Vec<InstrumentId>) -> Fixture {
        let clock = ManualClock::new();
        let player = RecordingPlayer::new(available);
        let mut engine =
            PlaybackEngine::new(config, Arc::new(clock.clone()), Box::new(player.clone()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.add_listener(Box::new(move |event| sink.lock().push(event.clone())));
        Fixture {
            engine,
            clock,
            player,
            events,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(PlayerConfig::default(), InstrumentId::general_midi())
    }

    fn scheduled_times(calls: &[Call], instrument: InstrumentId) -> Vec<f64> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Schedule(id, time, _) if *id == instrument => Some(*time),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn whole_note_length_from_tempo() {
        assert_eq!(whole_note_length(120.0, 4), 2000.0);
        assert_eq!(whole_note_length(60.0, 8), 8000.0);
    }

    #[test]
    fn operations_require_a_score() {
        let mut f = default_fixture();
        assert!(matches!(
            f.engine.play(),
            Err(EngineError::NotLoaded { operation: "play" })
        ));
        assert!(f.engine.pause().is_err());
        assert!(f.engine.stop().is_err());
        assert!(f.engine.jump_to_measure(0).is_err());
        assert!(f.engine.start_metronome().is_err());
        assert_eq!(f.engine.state(), PlaybackState::Init);
    }

    #[test]
    fn load_builds_queue_with_trailing_step() {
        let mut f = default_fixture();
        f.engine.load_score(score(1)).unwrap();

        assert_eq!(f.engine.state(), PlaybackState::Stopped);
        assert_eq!(
            *f.events.lock(),
            vec![PlaybackEvent::StateChange(PlaybackState::Stopped)]
        );
        let queue = f.engine.queue().unwrap();
        let ticks: Vec<Tick> = queue.steps().iter().map(|s| s.tick).collect();
        assert_eq!(ticks, vec![0, 256, 512, 768, 1024]);
        assert!(queue.steps().last().unwrap().notes.is_empty());
        assert_eq!(f.engine.whole_note_length(), 2000.0);
        assert!(f.player.take().is_empty());
    }

    #[test]
    fn play_schedules_with_lookahead_delays() {
        let config = PlayerConfig {
            schedule_period_ms: 1500,
            ..Default::default()
        };
        let mut f = fixture(config, InstrumentId::general_midi());
        f.engine.load_score(score(1)).unwrap();
        f.clock.set_ms(10_000.0);
        f.engine.play().unwrap();

        assert_eq!(f.engine.state(), PlaybackState::Playing);
        let times = scheduled_times(&f.player.take(), PIANO);
        assert_eq!(times, vec![10.0, 10.5, 11.0]);
    }

    #[test]
    fn pause_between_polls_does_not_replay_sounded_step() {
        let mut f = default_fixture();
        f.engine.load_score(score(1)).unwrap();
        f.engine.play().unwrap();
        f.clock.advance_ms(150.0);
        f.player.take();

        f.engine.pause().unwrap();
        assert_eq!(f.engine.current_step(), Some(1));
        f.engine.play().unwrap();

        let calls = f.player.take();
        let times = scheduled_times(&calls, PIANO);
        assert_eq!(times.len(), 1);
        assert!((times[0] - (0.15 + 179.0 * 1.953125 / 1000.0)).abs() < 1e-9);

        let first_step_reports = f
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, PlaybackEvent::Iteration { step: 0, .. }))
            .count();
        assert_eq!(first_step_reports, 1);
    }

    #[test]
    fn pause_twice_and_resume_from_recorded_step() {
        let mut f = default_fixture();
        f.engine.load_score(score(2)).unwrap();
        f.engine.play().unwrap();
        f.clock.advance_ms(600.0);
        f.engine.poll();
        f.player.take();

        f.engine.pause().unwrap();
        let step = f.engine.current_step().unwrap();
        let tick = f.engine.current_tick().unwrap();
        assert_eq!(f.player.take(), vec![Call::Stop(PIANO)]);

        f.engine.pause().unwrap();
        assert_eq!(f.engine.state(), PlaybackState::Paused);
        assert_eq!(f.engine.current_step(), Some(step));
        assert_eq!(f.engine.current_tick(), Some(tick));
        assert!(f.player.take().is_empty());

        f.clock.advance_ms(3000.0);
        f.engine.play().unwrap();
        assert_ne!(step, 0);
        let calls = f.player.take();
        let first = calls
            .iter()
            .find_map(|c| match c {
                Call::Schedule(_, time, pitches) => Some((*time, pitches.clone())),
                Call::Stop(_) => None,
            })
            .unwrap();
        assert_eq!(first.1, vec![60]);
        let expected = 3.6 + (512.0 - tick as f64) * 2000.0 / 1024.0 / 1000.0;
        assert!((first.0 - expected).abs() < 1e-9);
    }

    #[test]
    fn stop_is_idempotent_and_rewinds() {
        let mut f = default_fixture();
        f.engine.load_score(score(2)).unwrap();
        f.engine.play().unwrap();
        f.clock.advance_ms(2500.0);
        f.engine.poll();
        // Steps handed off late are reported on the following poll.
        f.engine.poll();
        assert_eq!(f.engine.current_measure(), Some(1));

        f.engine.stop().unwrap();
        assert_eq!(f.engine.state(), PlaybackState::Stopped);
        assert_eq!(f.engine.current_step(), Some(0));
        assert_eq!(f.engine.current_tick(), Some(0));
        assert_eq!(f.engine.current_measure(), Some(0));

        f.events.lock().clear();
        f.player.take();
        f.engine.stop().unwrap();
        assert!(f.events.lock().is_empty());
        assert!(f.player.take().is_empty());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut f = default_fixture();
        f.engine.load_score(score(1)).unwrap();
        assert!(matches!(
            f.engine.pause(),
            Err(EngineError::Transition {
                from: PlaybackState::Stopped,
                action: PlaybackAction::Pause
            })
        ));
        f.engine.play().unwrap();
        assert!(f.engine.play().is_err());
    }

    #[test]
    fn jump_forward_and_backward() {
        let mut f = default_fixture();
        f.engine.load_score(score(4)).unwrap();
        f.engine.play().unwrap();

        f.engine.jump_to_measure(2).unwrap();
        assert_eq!(f.engine.state(), PlaybackState::Playing);
        assert_eq!(f.engine.current_measure(), Some(2));
        let queue = f.engine.queue().unwrap();
        assert_eq!(f.engine.current_step(), Some(queue.index_of_tick(2048)));
        assert_eq!(f.engine.current_tick(), Some(2048));

        f.engine.jump_to_measure(1).unwrap();
        assert_eq!(f.engine.current_measure(), Some(1));
        assert_eq!(f.engine.current_tick(), Some(1024));
        let queue = f.engine.queue().unwrap();
        assert_eq!(queue.steps()[f.engine.current_step().unwrap()].tick, 1024);

        f.engine.jump_to_measure(3).unwrap();
        assert_eq!(f.engine.current_measure(), Some(3));

        assert!(matches!(
            f.engine.jump_to_measure(4),
            Err(EngineError::MeasureOutOfRange {
                measure: 4,
                count: 4
            })
        ));
    }

    #[test]
    fn jump_resumes_scheduling_at_target() {
        let mut f = default_fixture();
        f.engine.load_score(score(4)).unwrap();
        f.engine.play().unwrap();
        f.player.take();

        f.engine.jump_to_measure(2).unwrap();
        assert_eq!(f.player.take(), vec![Call::Stop(PIANO)]);
        f.engine.poll();
        let calls = f.player.take();
        assert_eq!(calls[0], Call::Schedule(PIANO, 0.0, vec![62]));

        assert!(f.events.lock().contains(&PlaybackEvent::Iteration {
            step: 8,
            tick: 2048,
            measure: Some(2),
        }));
    }

    #[test]
    fn jump_while_stopped_sets_start_point() {
        let mut f = default_fixture();
        f.engine.load_score(score(3)).unwrap();
        f.engine.jump_to_measure(2).unwrap();
        assert_eq!(f.engine.state(), PlaybackState::Stopped);

        f.engine.play().unwrap();
        let calls = f.player.take();
        assert_eq!(calls[0], Call::Schedule(PIANO, 0.0, vec![62]));
    }

    #[test]
    fn iteration_events_follow_the_clock() {
        let mut f = default_fixture();
        f.engine.load_score(score(1)).unwrap();
        f.engine.play().unwrap();
        f.events.lock().clear();

        f.clock.advance_ms(510.0);
        f.engine.poll();
        assert_eq!(
            *f.events.lock(),
            vec![
                PlaybackEvent::Iteration {
                    step: 0,
                    tick: 0,
                    measure: Some(0)
                },
                PlaybackEvent::Iteration {
                    step: 1,
                    tick: 256,
                    measure: Some(0)
                },
            ]
        );
    }

    #[test]
    fn reaching_the_end_stops_playback() {
        let mut f = default_fixture();
        f.engine.load_score(score(1)).unwrap();
        f.engine.play().unwrap();
        for _ in 0..15 {
            f.clock.advance_ms(200.0);
            f.engine.poll();
        }
        assert_eq!(f.engine.state(), PlaybackState::Stopped);
        let events = f.events.lock();
        assert!(events.contains(&PlaybackEvent::Finished));
        assert_eq!(
            events.last(),
            Some(&PlaybackEvent::StateChange(PlaybackState::Stopped))
        );
    }

    #[test]
    fn unavailable_instrument_falls_back_to_piano() {
        let mut f = fixture(PlayerConfig::default(), vec![PIANO, InstrumentId::WOODBLOCK]);
        let measures = vec![Measure {
            notes: vec![ScoreNote {
                instrument: InstrumentId(40),
                ..ScoreNote::new(0.0, 67, 0.5)
            }],
        }];
        let violin = SheetScore::new("violin", 120.0, (4, 4), measures).unwrap();
        f.engine.load_score(Box::new(violin)).unwrap();
        f.engine.play().unwrap();
        assert_eq!(
            f.player.take(),
            vec![Call::Schedule(PIANO, 0.0, vec![67])]
        );
    }

    #[test]
    fn missing_fallback_leaves_engine_in_init() {
        let mut f = fixture(PlayerConfig::default(), vec![InstrumentId(40)]);
        let err = f.engine.load_score(score(1)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Load(LoadError::FallbackUnavailable(PIANO))
        ));
        assert_eq!(f.engine.state(), PlaybackState::Init);
        assert!(f.engine.play().is_err());
    }

    #[test]
    fn reload_resets_to_stopped() {
        let mut f = default_fixture();
        f.engine.load_score(score(1)).unwrap();
        f.engine.play().unwrap();
        f.engine.load_score(score(2)).unwrap();
        assert_eq!(f.engine.state(), PlaybackState::Stopped);
        assert_eq!(f.engine.measure_count(), 2);
        assert_eq!(f.engine.current_step(), Some(0));
    }

    #[test]
    fn metronome_runs_without_playback() {
        let mut f = default_fixture();
        f.engine.load_score(score(1)).unwrap();
        f.engine.start_metronome().unwrap();
        assert!(f.engine.needs_poll());
        assert!(f.events.lock().contains(&PlaybackEvent::Metronome(true)));

        let calls = f.player.take();
        assert_eq!(
            calls,
            vec![
                Call::Schedule(InstrumentId::WOODBLOCK, 0.0, vec![DOWNBEAT_PITCH]),
                Call::Schedule(InstrumentId::WOODBLOCK, 0.5, vec![BEAT_PITCH]),
            ]
        );

        f.engine.stop_metronome().unwrap();
        assert!(!f.engine.needs_poll());
        assert_eq!(f.player.take(), vec![Call::Stop(InstrumentId::WOODBLOCK)]);
    }

    #[test]
    fn tempo_change_is_visible_to_the_scheduler() {
        let mut f = default_fixture();
        f.engine.load_score(score(2)).unwrap();
        f.engine.play().unwrap();
        f.clock.advance_ms(1000.0);
        f.engine.poll();
        assert_eq!(f.engine.current_tick(), Some(512));

        f.engine.set_bpm(240.0).unwrap();
        assert_eq!(f.engine.whole_note_length(), 1000.0);
        f.clock.advance_ms(250.0);
        f.engine.poll();
        assert_eq!(f.engine.current_tick(), Some(768));
        assert!(matches!(
            f.engine.set_bpm(0.0),
            Err(EngineError::InvalidTempo(_))
        ));
    }

    #[test]
    fn reference_window_trails_the_playhead() {
        let mut f = default_fixture();
        assert_eq!(f.engine.reference_sequence(), None);
        f.engine.load_score(score(1)).unwrap();
        f.engine.play().unwrap();
        f.clock.advance_ms(1000.0);
        f.engine.poll();

        let rows = crate::alignment::decode_event_sequence(
            &f.engine.reference_sequence().unwrap(),
        )
        .unwrap();
        assert_eq!(rows.len(), 140);
        assert!(rows[0].is_empty());
        assert_eq!(rows[138], vec![60]);
    }

    #[test]
    fn threaded_engine_plays_to_the_end() {
        let config = PlayerConfig {
            schedule_interval_ms: 10,
            schedule_period_ms: 50,
            ..Default::default()
        };
        let player = RecordingPlayer::new(InstrumentId::general_midi());
        let engine = PlaybackEngine::new(config, Arc::new(SystemClock::new()), Box::new(player));
        let handle = spawn_engine(engine);

        let measures = vec![Measure {
            notes: vec![ScoreNote::new(0.0, 60, 0.25), ScoreNote::new(0.25, 62, 0.25)],
        }];
        let fast = SheetScore::new("fast", 960.0, (2, 4), measures).unwrap();
        handle.send(EngineCommand::LoadScore(Box::new(fast)));
        handle.send(EngineCommand::Play);

        let mut updates = Vec::new();
        while let Ok(update) = handle.update_rx.recv_timeout(Duration::from_secs(5)) {
            let done = matches!(update, EngineUpdate::Playback(PlaybackEvent::Finished));
            updates.push(update);
            if done {
                break;
            }
        }
        assert!(matches!(
            updates[0],
            EngineUpdate::Playback(PlaybackEvent::StateChange(PlaybackState::Stopped))
        ));
        assert!(updates.iter().any(|u| matches!(u, EngineUpdate::ScoreLoaded { measures: 1, .. })));
        assert!(matches!(
            updates.last(),
            Some(EngineUpdate::Playback(PlaybackEvent::Finished))
        ));

        handle.send(EngineCommand::Pause);
        let error = handle.update_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let error = match error {
            EngineUpdate::Playback(PlaybackEvent::StateChange(PlaybackState::Stopped)) => {
                handle.update_rx.recv_timeout(Duration::from_secs(5)).unwrap()
            }
            other => other,
        };
        assert!(matches!(error, EngineUpdate::Error { .. }));
    }
}
