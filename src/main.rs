use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use clap::{Parser, crate_version};
use crossbeam::channel::{Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use etude::audio::{EventDrain, InstrumentId, MidiOut, QueuedInstrumentPlayer};
use etude::input::connect_live_input;
use etude::timing::{AudioClock, DeviceClock, SystemClock};
use etude::{
    AlignmentService, EngineCommand, EngineHandle, EngineUpdate, PlaybackEngine, PlaybackEvent,
    PlaybackState, PlayerConfig, SheetScore, spawn_engine,
};

const DRAIN_INTERVAL: Duration = Duration::from_millis(2);
const BPM_STEP: f64 = 4.0;

#[derive(Parser)]
#[clap(
    version = crate_version!(),
    about = "Plays a score for practice and compares your playing with it."
)]
struct Cli {
    /// Score file (RON).
    score: PathBuf,
    /// Player configuration file (RON). Defaults apply when omitted.
    #[clap(long)]
    config: Option<PathBuf>,
    /// Part of the name of the MIDI input to follow.
    #[clap(long)]
    midi_in: Option<String>,
    /// Part of the name of the MIDI output to play the score on.
    #[clap(long)]
    midi_out: Option<String>,
    /// Start with the metronome running.
    #[clap(long)]
    metronome: bool,
    /// Time playback with the system clock instead of the audio device.
    #[clap(long)]
    no_audio: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    let score = SheetScore::load(&cli.score)?;

    let clock = open_clock(cli.no_audio);
    let midi_out = cli
        .midi_out
        .as_deref()
        .map(|hint| MidiOut::connect(Some(hint)))
        .transpose()?;

    let (player, drain) =
        QueuedInstrumentPlayer::new(config.event_capacity, InstrumentId::general_midi());
    let (drain_stop_tx, drain_stop_rx) = crossbeam::channel::bounded(1);
    let drain_thread = spawn_drain(drain, clock.clone(), midi_out, drain_stop_rx);

    let engine = PlaybackEngine::new(config.clone(), clock, Box::new(player));
    let handle = spawn_engine(engine);
    handle.send(EngineCommand::LoadScore(Box::new(score)));
    if cli.metronome {
        handle.send(EngineCommand::StartMetronome);
    }

    let mut alignment = AlignmentService::new(&config);
    alignment.add_listener(Box::new(|similarity| {
        info!(
            euclidean = similarity.euclidean_error,
            levenshtein = similarity.levenshtein_error,
            "Similarity"
        );
    }));
    let _input = cli
        .midi_in
        .as_deref()
        .map(|hint| connect_live_input(Some(hint), alignment.pressed_keys()))
        .transpose()?;

    info!("space: play/pause  s: stop  m: metronome  left/right: measure  +/-: tempo  q: quit");
    let result = run_terminal(&handle, &alignment);

    alignment.destroy();
    drop(handle);
    stop_drain(drain_stop_tx, drain_thread);
    result
}

fn open_clock(no_audio: bool) -> Arc<dyn AudioClock> {
    if no_audio {
        return Arc::new(SystemClock::new());
    }
    match DeviceClock::open() {
        Ok(clock) => Arc::new(clock),
        Err(e) => {
            warn!(error = %e, "Audio device unavailable, using the system clock");
            Arc::new(SystemClock::new())
        }
    }
}

/// Releases queued instrument events as the clock reaches them.
fn spawn_drain(
    mut drain: EventDrain,
    clock: Arc<dyn AudioClock>,
    mut midi_out: Option<MidiOut>,
    stop_rx: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let ticker = crossbeam::channel::tick(DRAIN_INTERVAL);
        loop {
            crossbeam::channel::select! {
                recv(stop_rx) -> _ => break,
                recv(ticker) -> _ => {
                    for event in drain.drain_due(clock.current_time()) {
                        match midi_out.as_mut() {
                            Some(out) => {
                                if let Err(e) = out.send(&event) {
                                    warn!(error = %e, "MIDI output failed");
                                }
                            }
                            None => debug!(?event, "Instrument event"),
                        }
                    }
                }
            }
        }
    })
}

fn stop_drain(stop_tx: Sender<()>, thread: JoinHandle<()>) {
    let _ = stop_tx.send(());
    let _ = thread.join();
}

/// What the terminal front end knows about the engine.
struct Status {
    state: PlaybackState,
    measure: usize,
    measures: usize,
    bpm: f64,
    metronome: bool,
}

fn run_terminal(handle: &EngineHandle, alignment: &AlignmentService) -> Result<(), Box<dyn Error>> {
    terminal::enable_raw_mode()?;
    let result = key_loop(handle, alignment);
    terminal::disable_raw_mode()?;
    result
}

fn key_loop(handle: &EngineHandle, alignment: &AlignmentService) -> Result<(), Box<dyn Error>> {
    let mut status = Status {
        state: PlaybackState::Init,
        measure: 0,
        measures: 0,
        bpm: 0.0,
        metronome: false,
    };

    loop {
        for update in handle.update_rx.try_iter() {
            apply_update(&mut status, update, alignment);
        }

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let command = match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            KeyCode::Char(' ') if status.state == PlaybackState::Playing => EngineCommand::Pause,
            KeyCode::Char(' ') => EngineCommand::Play,
            KeyCode::Char('s') => EngineCommand::Stop,
            KeyCode::Char('m') if status.metronome => EngineCommand::StopMetronome,
            KeyCode::Char('m') => EngineCommand::StartMetronome,
            KeyCode::Right if status.measure + 1 < status.measures => {
                EngineCommand::JumpToMeasure(status.measure + 1)
            }
            KeyCode::Left => EngineCommand::JumpToMeasure(status.measure.saturating_sub(1)),
            KeyCode::Char('+') if status.bpm > 0.0 => {
                status.bpm += BPM_STEP;
                EngineCommand::SetBpm(status.bpm)
            }
            KeyCode::Char('-') if status.bpm > BPM_STEP => {
                status.bpm -= BPM_STEP;
                EngineCommand::SetBpm(status.bpm)
            }
            _ => continue,
        };
        handle.send(command);
    }
    Ok(())
}

fn apply_update(status: &mut Status, update: EngineUpdate, alignment: &AlignmentService) {
    match update {
        EngineUpdate::ScoreLoaded {
            title,
            measures,
            bpm,
        } => {
            info!(%title, measures, bpm, "Ready");
            status.measures = measures;
            status.bpm = bpm;
            status.measure = 0;
        }
        EngineUpdate::Reference(reference) => alignment.set_reference(reference),
        EngineUpdate::Playback(PlaybackEvent::StateChange(state)) => {
            status.state = state;
            if state == PlaybackState::Stopped {
                status.measure = 0;
            }
        }
        EngineUpdate::Playback(PlaybackEvent::Iteration {
            measure: Some(measure),
            ..
        }) => {
            if measure != status.measure {
                info!(measure = measure + 1, of = status.measures, "Measure");
            }
            status.measure = measure;
        }
        EngineUpdate::Playback(PlaybackEvent::Metronome(on)) => status.metronome = on,
        EngineUpdate::Playback(PlaybackEvent::Finished) => info!("Finished"),
        EngineUpdate::Playback(PlaybackEvent::Iteration { measure: None, .. }) => {}
        EngineUpdate::Error { message } => warn!(%message, "Engine rejected command"),
    }
}
