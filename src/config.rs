//! Monitor configuration: sampling, detection and runtime knobs.
//! Loaded from JSON; every field has a default matching the reference board setup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which peak detector variant runs in steady state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorMode {
    /// Enhanced channel only.
    Single,
    /// Enhanced channel confirmed by the band-limited channel.
    Dual,
}

/// What happens when the work queue is full at handoff time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    DropOldest,
    DropNewest,
}

/// Register layout of the board peripherals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Drive the board peripherals instead of the synthetic source.
    pub enabled: bool,
    /// Physical base address of the AXI Quad SPI core.
    pub spi_base: usize,
    /// Slave-select mask written to SPISSR.
    pub spi_cs_mask: u32,
    /// Physical base address of the LED GPIO controller.
    pub gpio_base: usize,
    /// Physical base address of the filter IP core control registers.
    pub ip_base: usize,
    /// Physical base address of the AXI DMA feeding the filter IP core.
    pub dma_base: usize,
    /// Physical address of the DMA transfer buffers. Must be reserved
    /// memory; room for two blocks of 32-bit samples is mapped.
    pub dma_buffer_base: usize,
    /// Size of each mapped register window.
    pub register_span: usize,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            spi_base: 0x41E0_0000,
            spi_cs_mask: 0xFFFF_FFFE,
            gpio_base: 0x4120_0000,
            ip_base: 0x43C0_0000,
            dma_base: 0x4040_0000,
            dma_buffer_base: 0x1F00_0000,
            register_span: 0x1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling rate `fs` in Hz.
    pub sample_rate_hz: u32,
    /// Samples per buffer `N`.
    pub buffer_len: usize,
    /// Refractory distance between two beats, in seconds.
    pub min_dist_secs: f64,
    /// Band-limited search half-window `w`, in samples.
    pub band_half_window: usize,
    /// Peak history horizon, in windows.
    pub history_windows: usize,
    /// Windows averaged by the beat-rate estimator.
    pub bpm_average_windows: usize,
    /// Windows accumulated before thresholds are initialised.
    pub warmup_windows: usize,
    pub detector_mode: DetectorMode,
    /// Rejected band candidates found in a window clamped at index 0
    /// still update the band noise level when set.
    pub clamped_band_noise_update: bool,
    /// Bounded work queue depth between acquisition and workers.
    pub queue_capacity: usize,
    /// Worker threads running the filter stage.
    pub workers: usize,
    pub overrun_policy: OverrunPolicy,
    pub filter_timeout_ms: u64,
    pub source_timeout_ms: u64,
    /// Blink half period used when no heartbeat is detected.
    pub indicator_fallback_half_period_ms: u64,
    pub hardware: HardwareConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 200,
            buffer_len: 200,
            min_dist_secs: 0.25,
            band_half_window: 40,
            history_windows: 60,
            bpm_average_windows: 5,
            warmup_windows: 1,
            detector_mode: DetectorMode::Dual,
            clamped_band_noise_update: true,
            queue_capacity: 8,
            workers: 2,
            overrun_policy: OverrunPolicy::DropOldest,
            filter_timeout_ms: 500,
            source_timeout_ms: 50,
            indicator_fallback_half_period_ms: 1000,
            hardware: HardwareConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load and validate a JSON config file. Missing fields take defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: MonitorConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.sample_rate_hz == 0 {
            return invalid("sample_rate_hz must be > 0");
        }
        if self.buffer_len == 0 {
            return invalid("buffer_len must be > 0");
        }
        let min_dist = self.min_dist_samples();
        if min_dist == 0 {
            return invalid("min_dist_secs is shorter than one sample");
        }
        if min_dist > self.buffer_len {
            return invalid("min_dist_secs spans more than one buffer");
        }
        if self.warmup_windows == 0 {
            return invalid("warmup_windows must be >= 1");
        }
        if self.band_half_window == 0 {
            return invalid("band_half_window must be >= 1");
        }
        if self.history_windows == 0 {
            return invalid("history_windows must be >= 1");
        }
        if self.workers == 0 {
            return invalid("workers must be >= 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be >= 1");
        }
        Ok(())
    }

    /// Refractory distance in samples: `round(min_dist_secs * fs)`.
    pub fn min_dist_samples(&self) -> usize {
        (self.min_dist_secs * self.sample_rate_hz as f64).round().max(0.0) as usize
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sample_rate_hz as f64)
    }

    /// Duration covered by one buffer, in seconds.
    pub fn window_secs(&self) -> f64 {
        self.buffer_len as f64 / self.sample_rate_hz as f64
    }

    pub fn filter_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_timeout_ms)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn indicator_fallback(&self) -> Duration {
        Duration::from_millis(self.indicator_fallback_half_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_dist_samples(), 50);
        assert!((config.window_secs() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: MonitorConfig =
            serde_json::from_str(r#"{ "sample_rate_hz": 500, "detector_mode": "single" }"#).unwrap();
        assert_eq!(config.sample_rate_hz, 500);
        assert_eq!(config.detector_mode, DetectorMode::Single);
        assert_eq!(config.buffer_len, 200);
        assert_eq!(config.min_dist_samples(), 125);
        assert_eq!(config.hardware.gpio_base, 0x4120_0000);
        assert_eq!(config.hardware.ip_base, 0x43C0_0000);
        assert!(!config.hardware.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ecg-monitor-config-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{ "overrun_policy": "drop_newest", "workers": 4, "hardware": { "enabled": true } }"#,
        )
        .unwrap();
        let loaded = MonitorConfig::load_from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.overrun_policy, OverrunPolicy::DropNewest);
        assert_eq!(config.workers, 4);
        assert!(config.hardware.enabled);
        assert_eq!(config.hardware.spi_base, 0x41E0_0000);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let path = std::env::temp_dir().join(format!("ecg-monitor-invalid-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "workers": 0 }"#).unwrap();
        let loaded = MonitorConfig::load_from_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(loaded, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_refractory_longer_than_buffer() {
        let config = MonitorConfig {
            buffer_len: 20,
            ..MonitorConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_band_half_window() {
        let config = MonitorConfig {
            band_half_window: 0,
            ..MonitorConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("band_half_window")));
    }

    #[test]
    fn test_rejects_zero_warmup() {
        let config = MonitorConfig {
            warmup_windows: 0,
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
