//! Temporal debouncing of per-frame detections.
//!
//! A single metadata record with a detection is not trusted: the accelerator
//! produces one- and two-frame false positives. Detections are published only
//! after `min_consecutive` records in a row carried at least one detection.
//!
//! The filter is asymmetric. Entering `Active` is delayed; leaving it is
//! immediate on the first record without detections. There is no cooldown.

use std::collections::VecDeque;

use super::result::Detection;

/// Default history window (records).
pub const DEFAULT_DEBOUNCE_WINDOW: usize = 5;

/// Default consecutive records required before publishing.
pub const DEFAULT_MIN_CONSECUTIVE: u32 = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DebounceState {
    /// Detections are withheld.
    #[default]
    Quiet,
    /// Current-record detections are published verbatim.
    Active,
}

pub struct TemporalDebouncer {
    history: VecDeque<bool>,
    window: usize,
    consecutive: u32,
    min_consecutive: u32,
}

impl TemporalDebouncer {
    pub fn new(window: usize, min_consecutive: u32) -> Self {
        let window = window.max(1);
        Self {
            history: VecDeque::with_capacity(window),
            window,
            consecutive: 0,
            min_consecutive: min_consecutive.max(1),
        }
    }

    /// Feed one record's decoded detections; returns what may be published.
    ///
    /// While `Quiet` the result is always empty. Once `Active`, the input is
    /// returned unchanged (no accumulation across records).
    pub fn observe(&mut self, detections: Vec<Detection>) -> Vec<Detection> {
        let detected = !detections.is_empty();
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(detected);

        let was = self.state();
        if detected {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.consecutive = 0;
        }
        let now = self.state();
        if was != now {
            log::info!("detections {:?} -> {:?}", was, now);
        }

        match now {
            DebounceState::Active => detections,
            DebounceState::Quiet => Vec::new(),
        }
    }

    pub fn state(&self) -> DebounceState {
        if self.consecutive >= self.min_consecutive {
            DebounceState::Active
        } else {
            DebounceState::Quiet
        }
    }

    /// Consecutive records with at least one detection.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Most recent "detected" flags, oldest first, at most `window` long.
    pub fn history(&self) -> impl Iterator<Item = bool> + '_ {
        self.history.iter().copied()
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.consecutive = 0;
    }
}

impl Default for TemporalDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW, DEFAULT_MIN_CONSECUTIVE)
    }
}
