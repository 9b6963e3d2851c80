use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam::channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use super::circular_queue::{EMPTY_ROW, KeyRow, MidiInfoCircularQueue};
use super::sequence::encode_event_sequence;
use super::similarity::{EditDistanceScorer, Similarity, SimilarityScorer};
use crate::config::PlayerConfig;

pub type SimilarityListener = Box<dyn Fn(&Similarity) + Send + Sync>;

struct Shared {
    /// Keys held right now, picked up by the next sample.
    pressed: ArcSwap<KeyRow>,
    queue: Mutex<MidiInfoCircularQueue>,
    /// Encoded reference window the live buffer is compared with.
    reference: ArcSwap<Vec<u8>>,
    scorer: RwLock<Option<Arc<dyn SimilarityScorer>>>,
    listeners: Mutex<Vec<Arc<dyn Fn(&Similarity) + Send + Sync>>>,
    samples: AtomicU64,
    score_every: u64,
}

impl Shared {
    fn set_pressed(&self, row: &[u8]) -> bool {
        match KeyRow::try_from(row) {
            Ok(row) => {
                self.pressed.store(Arc::new(row));
                true
            }
            Err(_) => {
                debug!(width = row.len(), "Ignoring pressed-key bitmap of the wrong width");
                false
            }
        }
    }

    fn sample(&self) {
        let row: KeyRow = **self.pressed.load();
        self.queue.lock().enqueue_row(&row);
        let samples = self.samples.fetch_add(1, Ordering::Relaxed) + 1;
        if samples % self.score_every == 0 {
            self.score_reference();
        }
    }

    fn event_sequence(&self) -> Vec<u8> {
        encode_event_sequence(&self.queue.lock().event_matrix())
    }

    fn score(&self, a: &[u8], b: &[u8]) -> Option<Similarity> {
        let scorer = self.scorer.read().clone()?;
        scorer.score(a, b)
    }

    fn score_reference(&self) -> Option<Similarity> {
        let reference = self.reference.load_full();
        if reference.is_empty() {
            return None;
        }
        let live = self.event_sequence();
        let similarity = self.score(&live, &reference)?;
        trace!(?similarity, "Scored live window");
        // Called outside the lock so a listener may add listeners.
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(&similarity);
        }
        Some(similarity)
    }
}

/// Cloneable writer for the pressed-key snapshot, for input callbacks that
/// run on other threads.
#[derive(Clone)]
pub struct PressedKeys {
    shared: Arc<Shared>,
}

impl PressedKeys {
    pub fn set(&self, row: &[u8]) -> bool {
        self.shared.set_pressed(row)
    }
}

/// One live alignment session: samples the pressed keys at a fixed rate
/// into a [`MidiInfoCircularQueue`] and scores the window against a
/// reference.
///
/// The sampling thread runs until [`destroy`](Self::destroy) or drop.
pub struct AlignmentService {
    shared: Arc<Shared>,
    stop_tx: Option<Sender<()>>,
    sampler: Option<JoinHandle<()>>,
}

impl AlignmentService {
    /// Starts a session sampling every `config.sample_interval()`.
    pub fn new(config: &PlayerConfig) -> Self {
        let mut service = Self::manual(config);
        let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
        let shared = service.shared.clone();
        let interval = config.sample_interval();
        service.sampler = Some(std::thread::spawn(move || {
            sampler_thread(shared, interval, stop_rx);
        }));
        service.stop_tx = Some(stop_tx);
        info!(
            rows = config.sample_length(),
            rate = config.sample_rate_hz,
            "Alignment sampling started"
        );
        service
    }

    /// A session without a sampling thread; the owner calls
    /// [`sample`](Self::sample) itself.
    pub fn manual(config: &PlayerConfig) -> Self {
        let scorer: Arc<dyn SimilarityScorer> = Arc::new(EditDistanceScorer);
        let shared = Shared {
            pressed: ArcSwap::from_pointee(EMPTY_ROW),
            queue: Mutex::new(MidiInfoCircularQueue::new(config.sample_length())),
            reference: ArcSwap::from_pointee(Vec::new()),
            scorer: RwLock::new(Some(scorer)),
            listeners: Mutex::new(Vec::new()),
            samples: AtomicU64::new(0),
            score_every: config.score_every_samples.max(1) as u64,
        };
        Self {
            shared: Arc::new(shared),
            stop_tx: None,
            sampler: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.sampler.is_some()
    }

    /// Replaces the snapshot taken on the next sample. Bitmaps that are not
    /// 88 keys wide are ignored.
    pub fn set_binary_pressed_keys(&self, row: &[u8]) -> bool {
        self.shared.set_pressed(row)
    }

    pub fn pressed_keys(&self) -> PressedKeys {
        PressedKeys {
            shared: self.shared.clone(),
        }
    }

    /// Takes one sample now.
    pub fn sample(&self) {
        self.shared.sample();
    }

    pub fn samples(&self) -> u64 {
        self.shared.samples.load(Ordering::Relaxed)
    }

    /// The buffered window, oldest row first, length-prefix encoded.
    pub fn event_sequence(&self) -> Vec<u8> {
        self.shared.event_sequence()
    }

    pub fn midi_matrix(&self) -> Vec<KeyRow> {
        self.shared.queue.lock().midi_matrix()
    }

    pub fn event_matrix(&self) -> Vec<Vec<u8>> {
        self.shared.queue.lock().event_matrix()
    }

    /// `None` while no scorer is installed.
    pub fn score_similarity(&self, a: &[u8], b: &[u8]) -> Option<Similarity> {
        self.shared.score(a, b)
    }

    pub fn set_scorer(&self, scorer: Option<Arc<dyn SimilarityScorer>>) {
        *self.shared.scorer.write() = scorer;
    }

    /// Installs an encoded event sequence as the comparison target.
    pub fn set_reference(&self, reference: Vec<u8>) {
        self.shared.reference.store(Arc::new(reference));
    }

    /// Scores the current window against the reference and notifies
    /// listeners. `None` without a reference or scorer.
    pub fn score_reference(&self) -> Option<Similarity> {
        self.shared.score_reference()
    }

    pub fn add_listener(&self, listener: SimilarityListener) {
        self.shared.listeners.lock().push(Arc::from(listener));
    }

    /// Stops the sampling thread. Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(sampler) = self.sampler.take() {
            let _ = sampler.join();
            info!(samples = self.samples(), "Alignment sampling stopped");
        }
    }
}

impl Drop for AlignmentService {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn sampler_thread(shared: Arc<Shared>, interval: Duration, stop_rx: Receiver<()>) {
    let ticker = crossbeam::channel::tick(interval);
    loop {
        crossbeam::channel::select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => shared.sample(),
        }
    }
}
