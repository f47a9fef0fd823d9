use crate::error::CodecError;
use crate::persistence::mapfile::save_map;
use crate::world::map::MapStore;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveConfig {
    pub interval_seconds: u64,
}

impl AutosaveConfig {
    pub fn interval(self) -> Option<Duration> {
        if self.interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.interval_seconds.max(1)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutosaveState {
    interval: Option<Duration>,
    next_due: Option<Instant>,
}

impl AutosaveState {
    pub fn new(config: AutosaveConfig, now: Instant) -> Self {
        let interval = config.interval();
        let next_due = interval.map(|interval| now + interval);
        Self { interval, next_due }
    }

    pub fn enabled(&self) -> bool {
        self.interval.is_some()
    }

    pub fn due(&self, now: Instant) -> bool {
        self.next_due.map_or(false, |next| now >= next)
    }

    pub fn mark_saved(&mut self, now: Instant) {
        if let Some(interval) = self.interval {
            self.next_due = Some(now + interval);
        }
    }
}

/// Periodic save of one map file, skipped while nothing changed.
#[derive(Debug)]
pub struct Autosave {
    state: AutosaveState,
    path: PathBuf,
    saved_revision: u64,
}

impl Autosave {
    pub fn new(config: AutosaveConfig, path: impl Into<PathBuf>, revision: u64, now: Instant) -> Self {
        Self {
            state: AutosaveState::new(config, now),
            path: path.into(),
            saved_revision: revision,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saves when the interval elapsed and the store moved since the last save.
    /// Returns whether a save happened.
    pub fn tick(&mut self, store: &MapStore, now: Instant) -> Result<bool, CodecError> {
        if !self.state.due(now) {
            return Ok(false);
        }
        self.state.mark_saved(now);
        if store.revision() == self.saved_revision {
            return Ok(false);
        }
        save_map(&self.path, store)?;
        self.saved_revision = store.revision();
        Ok(true)
    }

    /// Records a save made outside the timer.
    pub fn mark_saved(&mut self, revision: u64, now: Instant) {
        self.saved_revision = revision;
        self.state.mark_saved(now);
    }
}
