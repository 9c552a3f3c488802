use std::sync::Arc;

use bagplay_format::{BagMetadata, BagTime};
use serde::{Deserialize, Serialize};

/// Playback tuning knobs, merged from [`OptionsUpdate`]s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackOptions {
    /// Seconds of bag time decoded ahead of the play head.
    pub prefetch_secs: f64,
    /// Bag seconds advanced per wall-clock second.
    pub speed: f64,
    /// Jump back to the start when the end of the bag is reached.
    pub looping: bool,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            prefetch_secs: 10.0,
            speed: 1.0,
            looping: true,
        }
    }
}

/// A partial options change; unset fields keep their current value.
/// Takes effect on the tick after it is applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionsUpdate {
    pub prefetch_secs: Option<f64>,
    pub speed: Option<f64>,
    pub looping: Option<bool>,
}

impl PlaybackOptions {
    pub fn merge(&mut self, update: OptionsUpdate) {
        if let Some(prefetch_secs) = update.prefetch_secs {
            self.prefetch_secs = prefetch_secs;
        }
        if let Some(speed) = update.speed {
            self.speed = speed;
        }
        if let Some(looping) = update.looping {
            self.looping = looping;
        }
    }
}

/// Snapshot published on the state channel after every observable change.
#[derive(Debug, Clone, Default)]
pub struct PlayerState {
    pub current_time: Option<BagTime>,
    pub metadata: Option<Arc<BagMetadata>>,
    pub options: PlaybackOptions,
    pub is_playing: bool,
}
