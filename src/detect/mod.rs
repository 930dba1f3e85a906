//! Adaptive dual-threshold heartbeat detector.
//!
//! Consumes one filtered window pair at a time (QRS-enhanced channel plus
//! band-limited channel). The first `warmup_windows` windows only seed the
//! signal/noise levels; afterwards every window yields its confirmed beats.
//!
//! Single mode confirms a candidate on the enhanced channel alone. Dual mode
//! additionally requires a supporting maximum in the band-limited channel,
//! searched in the `band_half_window` samples preceding the candidate. An
//! overlap tail from the previous band-limited window keeps that search
//! correct across buffer boundaries.
//!
//! Windows are keyed by their acquisition sequence number. When a window is
//! missing (dropped on overrun or by a failed filter) the refractory state
//! and the overlap tail are discarded, so no beat is retracted or
//! corroborated across the gap. The missing samples read as zero in the
//! concatenated signals.
//!
//! A detector instance is single-owner: callers must serialise windows.

pub mod history;
pub mod peaks;
pub mod threshold;

use tracing::{debug, info, warn};

use crate::config::{DetectorMode, MonitorConfig};
use crate::error::DetectError;
use history::PeakHistory;
use peaks::find_peaks;
use threshold::ThresholdState;

/// Detector parameters, all in samples or windows.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub window_len: usize,
    pub sample_rate_hz: u32,
    pub min_dist: usize,
    pub band_half_window: usize,
    pub history_windows: usize,
    pub warmup_windows: usize,
    pub mode: DetectorMode,
    pub clamped_band_noise_update: bool,
}

impl From<&MonitorConfig> for DetectorConfig {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            window_len: config.buffer_len,
            sample_rate_hz: config.sample_rate_hz,
            min_dist: config.min_dist_samples(),
            band_half_window: config.band_half_window,
            history_windows: config.history_windows,
            warmup_windows: config.warmup_windows,
            mode: config.detector_mode,
            clamped_band_noise_update: config.clamped_band_noise_update,
        }
    }
}

/// Public view of the warm-up state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorPhase {
    Warming,
    Steady,
}

enum Phase {
    Warming {
        remaining: usize,
        enhanced_segment: Vec<i32>,
        band_segment: Vec<i32>,
    },
    Steady,
}

/// Most recently confirmed beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfirmedPeak {
    pub global_index: usize,
    pub value: f64,
}

/// Result of one steady-state window, borrowing the detector's running state.
#[derive(Debug)]
pub struct Detection<'a> {
    pub window_index: u64,
    /// Confirmed local indices of this window.
    pub window_peaks: &'a [usize],
    pub history: &'a PeakHistory,
    /// Enhanced-channel samples of every window so far.
    pub enhanced_signal: &'a [i32],
    /// Band-limited samples of every window so far.
    pub band_signal: &'a [i32],
    /// Global sample indices of all confirmed beats.
    pub global_indices: &'a [usize],
    /// Global indices of the supporting band-limited maxima (dual mode only).
    pub band_global_indices: &'a [usize],
}

pub struct PeakDetector {
    config: DetectorConfig,
    phase: Phase,
    enhanced: ThresholdState,
    band: ThresholdState,
    history: PeakHistory,
    last_peak: Option<ConfirmedPeak>,
    overlap_tail: Vec<i32>,
    enhanced_signal: Vec<i32>,
    band_signal: Vec<i32>,
    global_indices: Vec<usize>,
    band_global_indices: Vec<usize>,
    /// Sequence number expected next.
    next_seq: u64,
}

impl PeakDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let warmup = config.warmup_windows.max(1);
        Self {
            phase: Phase::Warming {
                remaining: warmup,
                enhanced_segment: Vec::with_capacity(warmup * config.window_len),
                band_segment: Vec::with_capacity(warmup * config.window_len),
            },
            enhanced: ThresholdState::from_levels(0.0, 0.0),
            band: ThresholdState::from_levels(0.0, 0.0),
            history: PeakHistory::new(config.history_windows),
            last_peak: None,
            overlap_tail: Vec::new(),
            enhanced_signal: Vec::new(),
            band_signal: Vec::new(),
            global_indices: Vec::new(),
            band_global_indices: Vec::new(),
            next_seq: 0,
            config,
        }
    }

    /// Process the filtered window pair acquired as window `seq`.
    ///
    /// Returns `Ok(None)` while warming up. Both buffers must be exactly
    /// `window_len` long and `seq` must increase from call to call.
    pub fn process(
        &mut self,
        seq: u64,
        enhanced: &[i32],
        band: &[i32],
    ) -> Result<Option<Detection<'_>>, DetectError> {
        let expected = self.config.window_len;
        if enhanced.len() != expected || band.len() != expected {
            return Err(DetectError::LengthMismatch {
                expected,
                enhanced: enhanced.len(),
                band: band.len(),
            });
        }
        if seq < self.next_seq {
            return Err(DetectError::OutOfOrder {
                expected: self.next_seq,
                got: seq,
            });
        }
        if seq > self.next_seq {
            self.skip_gap(seq);
        }

        let window_index = seq;
        self.next_seq = seq + 1;
        self.enhanced_signal.extend_from_slice(enhanced);
        self.band_signal.extend_from_slice(band);

        if let Phase::Warming {
            remaining,
            enhanced_segment,
            band_segment,
        } = &mut self.phase
        {
            enhanced_segment.extend_from_slice(enhanced);
            band_segment.extend_from_slice(band);
            *remaining -= 1;
            if *remaining > 0 {
                return Ok(None);
            }
            let enhanced_levels = ThresholdState::from_segment(enhanced_segment);
            let band_levels = ThresholdState::from_segment(band_segment);
            self.enhanced = enhanced_levels;
            self.band = band_levels;
            self.overlap_tail = tail(band, self.config.min_dist).to_vec();
            self.phase = Phase::Steady;
            info!(
                window = window_index,
                sig_lev = self.enhanced.signal_level(),
                noise_lev = self.enhanced.noise_level(),
                thr1 = self.enhanced.thr1(),
                band_thr1 = self.band.thr1(),
                "detector_warmup_complete"
            );
            return Ok(None);
        }

        let base = window_index as usize * expected;
        let (window_peaks, window_band) = match self.config.mode {
            DetectorMode::Single => (self.steady_single(enhanced, base), Vec::new()),
            DetectorMode::Dual => self.steady_dual(enhanced, band, base),
        };

        self.global_indices.extend(window_peaks.iter().map(|&p| base + p));
        self.band_global_indices.extend(window_band);
        debug!(
            window = window_index,
            beats = window_peaks.len(),
            thr1 = self.enhanced.thr1(),
            "window_detected"
        );
        self.history.push(window_peaks);

        Ok(Some(Detection {
            window_index,
            window_peaks: self.history.iter().last().map(Vec::as_slice).unwrap_or(&[]),
            history: &self.history,
            enhanced_signal: &self.enhanced_signal,
            band_signal: &self.band_signal,
            global_indices: &self.global_indices,
            band_global_indices: &self.band_global_indices,
        }))
    }

    fn steady_single(&mut self, enhanced: &[i32], base: usize) -> Vec<usize> {
        let mut window_peaks = Vec::new();
        for p in find_peaks(enhanced, self.config.min_dist) {
            let value = enhanced[p] as f64;
            if self.enhanced.is_noise(value) {
                self.enhanced.update_noise(value);
                continue;
            }
            let global_index = base + p;
            self.retract_if_superseded(global_index, value, &mut window_peaks, &mut Vec::new());
            self.enhanced.update_signal(value);
            window_peaks.push(p);
            self.last_peak = Some(ConfirmedPeak { global_index, value });
        }
        window_peaks
    }

    fn steady_dual(&mut self, enhanced: &[i32], band: &[i32], base: usize) -> (Vec<usize>, Vec<usize>) {
        let tail_len = self.overlap_tail.len();
        let mut extended = Vec::with_capacity(tail_len + band.len());
        extended.extend_from_slice(&self.overlap_tail);
        extended.extend_from_slice(band);

        let half_window = self.config.band_half_window;
        let mut window_peaks = Vec::new();
        let mut window_band = Vec::new();

        for p in find_peaks(enhanced, self.config.min_dist) {
            let value = enhanced[p] as f64;
            let end = tail_len + p;
            let start = end.saturating_sub(half_window);
            let clamped = end < half_window;

            let Some((offset, band_peak)) = argmax(&extended[start..end]) else {
                // Nothing to corroborate against.
                self.enhanced.update_noise(value);
                continue;
            };
            let band_value = band_peak as f64;

            if self.enhanced.is_noise(value) || self.band.is_noise(band_value) {
                self.enhanced.update_noise(value);
                if !clamped || self.config.clamped_band_noise_update {
                    self.band.update_noise(band_value);
                }
                continue;
            }

            let global_index = base + p;
            self.retract_if_superseded(global_index, value, &mut window_peaks, &mut window_band);
            self.enhanced.update_signal(value);
            self.band.update_signal(band_value);
            window_peaks.push(p);
            window_band.push((base + start + offset).saturating_sub(tail_len));
            self.last_peak = Some(ConfirmedPeak { global_index, value });
        }

        self.overlap_tail = tail(&extended, self.config.min_dist).to_vec();
        (window_peaks, window_band)
    }

    /// Forget everything that ties the next window to the previous one.
    fn skip_gap(&mut self, seq: u64) {
        let missing = (seq - self.next_seq) as usize;
        warn!(
            expected = self.next_seq,
            seq,
            missing,
            "window gap, refractory state reset"
        );
        let padding = missing * self.config.window_len;
        self.enhanced_signal.resize(self.enhanced_signal.len() + padding, 0);
        self.band_signal.resize(self.band_signal.len() + padding, 0);
        self.last_peak = None;
        if matches!(self.phase, Phase::Steady) {
            self.overlap_tail.clear();
        }
    }

    /// A stronger candidate inside the refractory distance of the last
    /// confirmed beat retracts that beat, wherever it was recorded.
    fn retract_if_superseded(
        &mut self,
        global_index: usize,
        value: f64,
        window_peaks: &mut Vec<usize>,
        window_band: &mut Vec<usize>,
    ) {
        let Some(last) = self.last_peak else {
            return;
        };
        if global_index.saturating_sub(last.global_index) >= self.config.min_dist || value <= last.value {
            return;
        }
        // `last` lives in the current window exactly when it already holds a beat.
        if window_peaks.pop().is_some() {
            window_band.pop();
        } else {
            self.history.retract_latest();
            self.global_indices.pop();
            if self.config.mode == DetectorMode::Dual {
                self.band_global_indices.pop();
            }
        }
        debug!(
            retracted = last.global_index,
            replacement = global_index,
            "weaker_peak_retracted"
        );
    }

    /// Beats per minute over the newest `n` windows of history.
    pub fn estimate_bpm(&self, n: usize) -> f64 {
        self.history
            .estimate_bpm(n, self.config.window_len, self.config.sample_rate_hz)
    }

    pub fn phase(&self) -> DetectorPhase {
        match self.phase {
            Phase::Warming { .. } => DetectorPhase::Warming,
            Phase::Steady => DetectorPhase::Steady,
        }
    }

    pub fn enhanced_levels(&self) -> &ThresholdState {
        &self.enhanced
    }

    pub fn band_levels(&self) -> &ThresholdState {
        &self.band
    }

    pub fn history(&self) -> &PeakHistory {
        &self.history
    }

    pub fn last_peak(&self) -> Option<ConfirmedPeak> {
        self.last_peak
    }

    /// Enhanced-channel samples of every window processed so far.
    pub fn enhanced_signal(&self) -> &[i32] {
        &self.enhanced_signal
    }

    pub fn overlap_tail(&self) -> &[i32] {
        &self.overlap_tail
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }
}

/// Last `len` samples of `signal` (all of it when shorter).
fn tail(signal: &[i32], len: usize) -> &[i32] {
    &signal[signal.len().saturating_sub(len)..]
}

/// Offset and value of the first maximum.
fn argmax(values: &[i32]) -> Option<(usize, i32)> {
    let mut best: Option<(usize, i32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best
}
