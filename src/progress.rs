use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod object;
pub mod sqlite;

/// Positions this close to the end of an episode count as having finished it.
pub const END_TOLERANCE_SECS: f64 = 0.5;

/// Resume point of a show inside its playlist.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// 0-based episode index into the playlist.
    pub index: usize,
    /// Seconds into the episode at `index`.
    pub offset: f64,
    /// The previous episode finished; the one at `index` starts from the top.
    pub completed: bool,
}

impl Default for ProgressRecord {
    fn default() -> Self {
        Self {
            index: 0,
            offset: 0.0,
            completed: true,
        }
    }
}

impl ProgressRecord {
    /// Where playback of the episode at `index` should begin.
    pub fn start_offset(&self) -> f64 {
        if self.completed {
            0.0
        } else {
            self.offset
        }
    }

    /// Move on to the next episode.
    pub fn advance(&mut self) {
        self.index += 1;
        self.offset = 0.0;
        self.completed = true;
    }

    /// Restart from the first episode once the playlist has been played through.
    /// Returns whether the record wrapped.
    pub fn wrap(&mut self, playlist_len: usize) -> bool {
        if self.index >= playlist_len {
            *self = Self::default();
            return true;
        }

        false
    }

    /// Playback of the current episode stopped at `position` seconds. Reaching the end
    /// (within [END_TOLERANCE_SECS]) advances to the next episode.
    pub fn stop_at(&mut self, position: f64, episode_duration: f64) {
        if position >= episode_duration - END_TOLERANCE_SECS {
            self.advance();
        } else {
            self.offset = position.max(0.0);
            self.completed = false;
        }
    }
}

/// Durable per-show progress.
///
/// This is only a persistence surface. The scheduler owns the authoritative copy of
/// every record and writes it back after each segment.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// The stored record of `show`, or `None` if it has never been saved.
    async fn get(&self, show: &str) -> Result<Option<ProgressRecord>>;

    /// Persist `record`; returns once the write is durable.
    async fn put(&self, show: &str, record: &ProgressRecord) -> Result<()>;
}
