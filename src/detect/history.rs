//! Bounded per-window beat history and the beat-rate estimator built on it.

use std::collections::VecDeque;

/// The last `capacity` windows' confirmed beat positions (local indices),
/// oldest first. Pushing beyond capacity evicts the oldest window.
#[derive(Debug, Clone)]
pub struct PeakHistory {
    windows: VecDeque<Vec<usize>>,
    capacity: usize,
}

impl PeakHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, peaks: Vec<usize>) {
        if self.windows.len() == self.capacity {
            self.windows.pop_front();
        }
        self.windows.push_back(peaks);
    }

    /// Remove the newest beat of the newest window, if any.
    pub(crate) fn retract_latest(&mut self) -> Option<usize> {
        self.windows.back_mut().and_then(Vec::pop)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Vec<usize>> + ExactSizeIterator {
        self.windows.iter()
    }

    /// Beats per minute over the newest `min(n, len)` windows.
    ///
    /// Returns `0.0` when no window is considered.
    pub fn estimate_bpm(&self, n: usize, window_len: usize, sample_rate_hz: u32) -> f64 {
        let considered = n.min(self.windows.len());
        if considered == 0 || sample_rate_hz == 0 {
            return 0.0;
        }
        let beats: usize = self.windows.iter().rev().take(considered).map(Vec::len).sum();
        let secs = considered as f64 * window_len as f64 / sample_rate_hz as f64;
        if secs <= 0.0 {
            return 0.0;
        }
        beats as f64 / secs * 60.0
    }
}
