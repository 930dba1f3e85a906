//! Sample sources: the SPI ADC front end and a synthetic ECG generator.

use std::f64::consts::PI;
use std::time::{Duration, Instant};

use crate::error::SourceError;
use crate::hw::registers::spi;
use crate::hw::RegisterBus;

/// One acquisition tick's value.
pub type Sample = i16;

/// Produces one sample per call, blocking until it is ready.
///
/// Errors are fatal: the acquisition loop stops and reports them.
pub trait SampleSource: Send {
    fn read(&mut self) -> Result<Sample, SourceError>;
}

/// ADC read through an AXI Quad SPI core.
pub struct SpiSampleSource<B> {
    bus: B,
    timeout: Duration,
}

impl<B: RegisterBus> SpiSampleSource<B> {
    /// Configure the core as master and assert the slave-select mask.
    pub fn new(bus: B, cs_mask: u32, timeout: Duration) -> Result<Self, SourceError> {
        bus.write32(spi::SPICR, spi::SPICR_MASTER_ENABLE)?;
        bus.write32(spi::SPISSR, cs_mask)?;
        std::thread::sleep(Duration::from_millis(1));
        Ok(Self { bus, timeout })
    }

    fn wait_rx(&self) -> Result<(), SourceError> {
        let start = Instant::now();
        loop {
            let status = self.bus.read32(spi::SPISR)?;
            if status & spi::SPISR_RX_EMPTY == 0 {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(SourceError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_micros(10));
        }
    }
}

impl<B: RegisterBus> SampleSource for SpiSampleSource<B> {
    fn read(&mut self) -> Result<Sample, SourceError> {
        self.bus.write32(spi::SPI_DTR, spi::READ_COMMAND)?;
        self.wait_rx()?;
        let raw = self.bus.read32(spi::SPI_DRR)? & 0xFFFF;
        Ok(raw as u16 as i16)
    }
}

/// Deterministic ECG-like waveform: a narrow QRS pulse once per beat
/// on top of a slow baseline wander.
pub struct SyntheticEcg {
    sample_rate_hz: f64,
    beat_period: f64,
    amplitude: f64,
    n: u64,
    limit: Option<u64>,
}

impl SyntheticEcg {
    pub fn new(sample_rate_hz: u32, bpm: f64, amplitude: i16) -> Self {
        Self {
            sample_rate_hz: sample_rate_hz as f64,
            beat_period: 60.0 / bpm.max(1.0),
            amplitude: amplitude as f64,
            n: 0,
            limit: None,
        }
    }

    /// Stop with [`SourceError::Exhausted`] after `limit` samples.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn value_at(&self, n: u64) -> f64 {
        let t = n as f64 / self.sample_rate_hz;
        let phase = t % self.beat_period - 0.5 * self.beat_period;
        let qrs_width = 0.012;
        let qrs = self.amplitude * (-0.5 * (phase / qrs_width).powi(2)).exp();
        let t_wave = 0.2 * self.amplitude * (-0.5 * ((phase - 0.25) / 0.04).powi(2)).exp();
        let wander = 0.05 * self.amplitude * (2.0 * PI * 0.3 * t).sin();
        qrs + t_wave + wander
    }
}

impl SampleSource for SyntheticEcg {
    fn read(&mut self) -> Result<Sample, SourceError> {
        if let Some(limit) = self.limit {
            if self.n >= limit {
                return Err(SourceError::Exhausted(limit));
            }
        }
        let value = self.value_at(self.n);
        self.n += 1;
        Ok(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
    }
}
