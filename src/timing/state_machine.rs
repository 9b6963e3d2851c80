use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackState {
    Init,
    Stopped,
    Paused,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackAction {
    LoadComplete,
    Play,
    Pause,
    Stop,
    Seek,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: PlaybackState,
    pub action: PlaybackAction,
    pub to: PlaybackState,
}

const fn edge(from: PlaybackState, action: PlaybackAction, to: PlaybackState) -> Edge {
    Edge { from, action, to }
}

use PlaybackAction as A;
use PlaybackState as S;

/// Every legal transition. Anything not listed is rejected.
pub const TRANSITIONS: &[Edge] = &[
    edge(S::Init, A::LoadComplete, S::Stopped),
    edge(S::Stopped, A::LoadComplete, S::Stopped),
    edge(S::Paused, A::LoadComplete, S::Stopped),
    edge(S::Playing, A::LoadComplete, S::Stopped),
    edge(S::Stopped, A::Play, S::Playing),
    edge(S::Paused, A::Play, S::Playing),
    edge(S::Playing, A::Pause, S::Paused),
    edge(S::Paused, A::Pause, S::Paused),
    edge(S::Stopped, A::Stop, S::Stopped),
    edge(S::Paused, A::Stop, S::Stopped),
    edge(S::Playing, A::Stop, S::Stopped),
    edge(S::Stopped, A::Seek, S::Stopped),
    edge(S::Paused, A::Seek, S::Paused),
    edge(S::Playing, A::Seek, S::Playing),
];

impl PlaybackState {
    pub fn get_outgoing_edges(self) -> impl Iterator<Item = &'static Edge> {
        TRANSITIONS.iter().filter(move |e| e.from == self)
    }

    /// Looks up the state reached by applying `action`.
    pub fn transition(self, action: PlaybackAction) -> Result<PlaybackState, EngineError> {
        self.get_outgoing_edges()
            .find(|e| e.action == action)
            .map(|e| e.to)
            .ok_or(EngineError::Transition { from: self, action })
    }
}
