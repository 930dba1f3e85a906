//! Block filter stage: raw window in, two filtered windows out.
//!
//! The accelerator exposes two outputs per raw block: a QRS-enhanced
//! (integrated) signal and a band-limited signal. Each is a per-block
//! transformation of N samples into N samples, so blocks can be filtered in
//! any order and on any worker.

pub mod axi;
pub mod dma;
pub mod software;

use std::sync::Arc;
use std::time::Duration;

use crate::acquisition::Sample;
use crate::error::FilterError;
use dma::{DmaBlockFilter, DmaEngine, LoopbackDma};
use software::{BandLimiter, QrsEnhancer};

/// Transforms one block of samples into one block of equal length.
pub trait BlockFilter: Send + Sync {
    fn filter(&self, input: &[i32]) -> Result<Vec<i32>, FilterError>;
}

/// Filtered pair for one window.
#[derive(Debug, Clone)]
pub struct FilteredWindow {
    pub seq: u64,
    pub enhanced: Vec<i32>,
    pub band: Vec<i32>,
}

/// The two channel families needed by the detector.
#[derive(Clone)]
pub struct FilterBank {
    enhanced: Arc<dyn BlockFilter>,
    band: Arc<dyn BlockFilter>,
}

impl FilterBank {
    pub fn new(enhanced: Arc<dyn BlockFilter>, band: Arc<dyn BlockFilter>) -> Self {
        Self { enhanced, band }
    }

    /// Software filters only.
    pub fn software(sample_rate_hz: u32) -> Self {
        Self::new(
            Arc::new(QrsEnhancer::new(sample_rate_hz)),
            Arc::new(BandLimiter::new(sample_rate_hz)),
        )
    }

    /// Software filters behind the DMA transfer protocol, as the
    /// accelerator would be driven on the board.
    pub fn simulated_accelerator(sample_rate_hz: u32, timeout: Duration) -> Self {
        Self::new(
            Arc::new(DmaBlockFilter::new(LoopbackDma::new(QrsEnhancer::new(sample_rate_hz)), timeout)),
            Arc::new(DmaBlockFilter::new(LoopbackDma::new(BandLimiter::new(sample_rate_hz)), timeout)),
        )
    }

    /// The board: QRS enhancement on the accelerator behind `engine`, band
    /// limiting in software.
    pub fn accelerator<E: DmaEngine + 'static>(engine: E, sample_rate_hz: u32, timeout: Duration) -> Self {
        Self::new(
            Arc::new(DmaBlockFilter::new(engine, timeout)),
            Arc::new(BandLimiter::new(sample_rate_hz)),
        )
    }

    /// Run both channels over one raw window.
    pub fn apply(&self, seq: u64, raw: &[Sample]) -> Result<FilteredWindow, FilterError> {
        let input: Vec<i32> = raw.iter().map(|&s| s as i32).collect();
        let enhanced = checked(&input, self.enhanced.filter(&input)?)?;
        let band = checked(&input, self.band.filter(&input)?)?;
        Ok(FilteredWindow { seq, enhanced, band })
    }
}

fn checked(input: &[i32], output: Vec<i32>) -> Result<Vec<i32>, FilterError> {
    if output.len() != input.len() {
        return Err(FilterError::LengthMismatch {
            expected: input.len(),
            actual: output.len(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Truncating;

    impl BlockFilter for Truncating {
        fn filter(&self, input: &[i32]) -> Result<Vec<i32>, FilterError> {
            Ok(input[..input.len() / 2].to_vec())
        }
    }

    #[test]
    fn test_software_bank_preserves_length() {
        let bank = FilterBank::software(200);
        let raw: Vec<Sample> = (0..200).map(|i| (i % 17) as i16).collect();
        let out = bank.apply(3, &raw).unwrap();
        assert_eq!(out.seq, 3);
        assert_eq!(out.enhanced.len(), 200);
        assert_eq!(out.band.len(), 200);
    }

    #[test]
    fn test_accelerator_matches_software() {
        let raw: Vec<Sample> = (0..200).map(|i| if i == 60 { 800 } else { 0 }).collect();
        let software = FilterBank::software(200).apply(0, &raw).unwrap();
        let accel = FilterBank::simulated_accelerator(200, Duration::from_millis(50))
            .apply(0, &raw)
            .unwrap();
        assert_eq!(software.enhanced, accel.enhanced);
        assert_eq!(software.band, accel.band);
    }

    #[test]
    fn test_accelerator_bank_enhances_on_engine() {
        let raw: Vec<Sample> = (0..200).map(|i| if i == 60 { 800 } else { 0 }).collect();
        let engine = LoopbackDma::new(QrsEnhancer::new(200));
        let stall = engine.stall_handle();
        let bank = FilterBank::accelerator(engine, 200, Duration::from_millis(5));
        let software = FilterBank::software(200).apply(0, &raw).unwrap();
        assert_eq!(bank.apply(0, &raw).unwrap().enhanced, software.enhanced);

        stall.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(bank.apply(1, &raw), Err(FilterError::Timeout { .. })));
    }

    #[test]
    fn test_short_output_rejected() {
        let bank = FilterBank::new(Arc::new(Truncating), Arc::new(BandLimiter::new(200)));
        let err = bank.apply(0, &[0; 10]).unwrap_err();
        assert!(matches!(err, FilterError::LengthMismatch { expected: 10, actual: 5 }));
    }
}
