//! Running signal/noise levels and the two thresholds derived from them.

/// Weight of a new observation in the exponential level updates.
const LEVEL_ALPHA: f64 = 0.125;

/// Signal/noise levels for one channel family.
///
/// `thr1` and `thr2` are private and recomputed on every level update, so
/// they can never drift from `NOISE + 0.25 * (SIG - NOISE)` and `0.5 * THR_1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdState {
    signal_level: f64,
    noise_level: f64,
    thr1: f64,
    thr2: f64,
}

impl ThresholdState {
    /// Initialise levels from a warm-up segment: `SIG = max`, `NOISE = mean`.
    /// An empty segment yields all-zero levels.
    pub fn from_segment(segment: &[i32]) -> Self {
        let max = segment.iter().copied().max().unwrap_or(0) as f64;
        let mean = if segment.is_empty() {
            0.0
        } else {
            segment.iter().map(|&v| v as f64).sum::<f64>() / segment.len() as f64
        };
        Self::from_levels(max, mean)
    }

    pub fn from_levels(signal_level: f64, noise_level: f64) -> Self {
        let mut state = Self {
            signal_level,
            noise_level,
            thr1: 0.0,
            thr2: 0.0,
        };
        state.recompute();
        state
    }

    #[inline]
    pub fn update_signal(&mut self, value: f64) {
        self.signal_level = LEVEL_ALPHA * value + (1.0 - LEVEL_ALPHA) * self.signal_level;
        self.recompute();
    }

    #[inline]
    pub fn update_noise(&mut self, value: f64) {
        self.noise_level = LEVEL_ALPHA * value + (1.0 - LEVEL_ALPHA) * self.noise_level;
        self.recompute();
    }

    /// Whether a candidate falls below the primary threshold.
    #[inline]
    pub fn is_noise(&self, value: f64) -> bool {
        value < self.thr1
    }

    fn recompute(&mut self) {
        self.thr1 = self.noise_level + 0.25 * (self.signal_level - self.noise_level);
        self.thr2 = 0.5 * self.thr1;
    }

    pub fn signal_level(&self) -> f64 {
        self.signal_level
    }

    pub fn noise_level(&self) -> f64 {
        self.noise_level
    }

    pub fn thr1(&self) -> f64 {
        self.thr1
    }

    pub fn thr2(&self) -> f64 {
        self.thr2
    }
}
