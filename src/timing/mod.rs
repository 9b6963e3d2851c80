mod clock;
mod scheduler;
mod state_machine;
mod step_queue;

pub use clock::{AudioClock, DeviceClock, ManualClock, SystemClock};
pub use scheduler::{PauseOutcome, PlaybackScheduler, PollOutcome, ScheduleSink};
pub use state_machine::{Edge, PlaybackAction, PlaybackState, TRANSITIONS};
pub use step_queue::{
    Articulation, NoteEvent, Step, StepQueue, TICK_DENOMINATOR, Tick, whole_notes_to_ticks,
};
