//! Software reference filters matching the accelerator's two outputs.
//!
//! Each call treats its block independently: history before the first
//! sample is taken to equal the first sample, so a flat block maps to zero.

use crate::error::FilterError;

use super::BlockFilter;

/// QRS enhancement: 5-point derivative, squaring, moving-window integration.
pub struct QrsEnhancer {
    integration_len: usize,
}

impl QrsEnhancer {
    /// Integration window of 150 ms at `sample_rate_hz`.
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            integration_len: samples_for(sample_rate_hz, 0.150),
        }
    }
}

impl BlockFilter for QrsEnhancer {
    fn filter(&self, input: &[i32]) -> Result<Vec<i32>, FilterError> {
        let Some(&first) = input.first() else {
            return Ok(Vec::new());
        };
        let at = |i: isize| -> i64 {
            if i < 0 {
                first as i64
            } else {
                input[i as usize] as i64
            }
        };
        let squared: Vec<i64> = (0..input.len() as isize)
            .map(|n| {
                let d = (2 * at(n) + at(n - 1) - at(n - 3) - 2 * at(n - 4)) / 8;
                d * d
            })
            .collect();
        Ok(moving_average(&squared, self.integration_len, 0)
            .into_iter()
            .map(saturate)
            .collect())
    }
}

/// Band limiting: short moving average minus a 200 ms baseline average.
pub struct BandLimiter {
    smooth_len: usize,
    baseline_len: usize,
}

impl BandLimiter {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            smooth_len: samples_for(sample_rate_hz, 0.025),
            baseline_len: samples_for(sample_rate_hz, 0.200),
        }
    }
}

impl BlockFilter for BandLimiter {
    fn filter(&self, input: &[i32]) -> Result<Vec<i32>, FilterError> {
        let Some(&first) = input.first() else {
            return Ok(Vec::new());
        };
        let wide: Vec<i64> = input.iter().map(|&v| v as i64).collect();
        let smooth = moving_average(&wide, self.smooth_len, first as i64);
        let baseline = moving_average(&wide, self.baseline_len, first as i64);
        Ok(smooth
            .into_iter()
            .zip(baseline)
            .map(|(s, b)| saturate(s - b))
            .collect())
    }
}

fn samples_for(sample_rate_hz: u32, secs: f64) -> usize {
    ((sample_rate_hz as f64 * secs).round() as usize).max(1)
}

/// Causal moving average; samples before the block are `pad`.
fn moving_average(x: &[i64], len: usize, pad: i64) -> Vec<i64> {
    let len = len.max(1);
    let mut sum = pad * len as i64;
    let mut out = Vec::with_capacity(x.len());
    for n in 0..x.len() {
        let leaving = if n >= len { x[n - len] } else { pad };
        sum += x[n] - leaving;
        out.push(sum / len as i64);
    }
    out
}

fn saturate(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse_block(len: usize, at: usize) -> Vec<i32> {
        (0..len)
            .map(|i| {
                let d = i as f64 - at as f64;
                (100.0 + 1000.0 * (-0.5 * (d / 2.5).powi(2)).exp()) as i32
            })
            .collect()
    }

    #[test]
    fn test_flat_block_maps_to_zero() {
        let flat = vec![500; 200];
        assert!(QrsEnhancer::new(200).filter(&flat).unwrap().iter().all(|&v| v == 0));
        assert!(BandLimiter::new(200).filter(&flat).unwrap().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_enhancer_peaks_after_qrs() {
        let block = pulse_block(200, 100);
        let out = QrsEnhancer::new(200).filter(&block).unwrap();
        assert_eq!(out.len(), 200);
        let (argmax, _) = out.iter().enumerate().max_by_key(|&(_, &v)| v).unwrap();
        // Integration delays the peak by up to one window (30 samples).
        assert!((100..=135).contains(&argmax), "peak at {argmax}");
        assert_eq!(out[50], 0);
    }

    #[test]
    fn test_band_limiter_removes_offset() {
        let block = pulse_block(200, 100);
        let out = BandLimiter::new(200).filter(&block).unwrap();
        assert_eq!(out[10], 0);
        let (argmax, &peak) = out.iter().enumerate().max_by_key(|&(_, &v)| v).unwrap();
        assert!((100..=106).contains(&argmax), "peak at {argmax}");
        assert!(peak > 500);
    }

    #[test]
    fn test_moving_average_padding() {
        assert_eq!(moving_average(&[4, 4, 4], 2, 0), vec![2, 4, 4]);
        assert_eq!(moving_average(&[4, 8], 1, 0), vec![4, 8]);
    }
}
