//! Heart-rate indicator: maps the current rate to an LED color and blinks
//! it with a period matching the rate.
//!
//! The blink loop is a Tokio task on its own cadence. It reads the latest
//! rate from a watch channel at the start of every blink, so it never waits
//! on acquisition or detection.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::hw::registers::gpio;
use crate::hw::RegisterBus;

/// 3-bit RGB code driven onto the LED pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ColorCode(u8);

impl ColorCode {
    pub const OFF: ColorCode = ColorCode(0b000);
    /// 40..=100 bpm
    pub const NORMAL: ColorCode = ColorCode(0b010);
    /// 100 < bpm <= 170
    pub const ELEVATED: ColorCode = ColorCode(0b110);
    /// Anything else with a heartbeat
    pub const ALERT: ColorCode = ColorCode(0b100);

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for ColorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03b}", self.0)
    }
}

/// Color for a rate. No heartbeat (`bpm <= 0` or not a number) is off.
pub fn color_for_rate(bpm: f64) -> ColorCode {
    if !(bpm > 0.0) {
        ColorCode::OFF
    } else if (40.0..=100.0).contains(&bpm) {
        ColorCode::NORMAL
    } else if bpm > 100.0 && bpm <= 170.0 {
        ColorCode::ELEVATED
    } else {
        ColorCode::ALERT
    }
}

/// On (and off) time of one blink: half a beat, or `fallback` without a heartbeat.
pub fn half_period(bpm: f64, fallback: Duration) -> Duration {
    if bpm > 0.0 && bpm.is_finite() {
        Duration::try_from_secs_f64(30.0 / bpm).unwrap_or(fallback)
    } else {
        fallback
    }
}

/// Indicator output. Fire-and-forget: failures are the driver's to log.
pub trait IndicatorDriver: Send + Sync {
    fn set_color(&self, code: ColorCode);
    fn reset(&self);
}

/// RGB LED on an AXI GPIO channel.
pub struct GpioIndicator<B> {
    bus: B,
}

impl<B: RegisterBus> GpioIndicator<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B: RegisterBus> IndicatorDriver for GpioIndicator<B> {
    fn set_color(&self, code: ColorCode) {
        let value = code.bits() as u32 & gpio::COLOR_MASK;
        if let Err(e) = self.bus.write32(gpio::DATA, value) {
            warn!(error = %e, color = %code, "indicator write failed");
        }
    }

    fn reset(&self) {
        let result = self
            .bus
            .write32(gpio::TRI, gpio::ALL_OUTPUTS)
            .and_then(|_| self.bus.write32(gpio::DATA, 0));
        if let Err(e) = result {
            warn!(error = %e, "indicator reset failed");
        }
    }
}

/// Indicator that only logs, for runs without the board.
#[derive(Debug, Default)]
pub struct LogIndicator;

impl IndicatorDriver for LogIndicator {
    fn set_color(&self, code: ColorCode) {
        trace!(color = %code, "indicator");
    }

    fn reset(&self) {
        trace!("indicator reset");
    }
}

/// Running blink task. Dropping it leaves the task running; call `stop()`.
pub struct Indicator {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Indicator {
    /// Spawn the blink loop on the current Tokio runtime.
    pub fn spawn(driver: Arc<dyn IndicatorDriver>, rate: watch::Receiver<f64>, fallback: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(blink_loop(driver, rate, fallback, cancel.clone()));
        Self { cancel, task }
    }

    /// Stop blinking and leave the LED off.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "indicator task ended abnormally");
        }
    }
}

async fn blink_loop(
    driver: Arc<dyn IndicatorDriver>,
    rate: watch::Receiver<f64>,
    fallback: Duration,
    cancel: CancellationToken,
) {
    driver.reset();
    info!("indicator started");

    loop {
        let bpm = *rate.borrow();
        let half = half_period(bpm, fallback);

        driver.set_color(color_for_rate(bpm));
        if hold(half, &cancel).await {
            break;
        }
        driver.set_color(ColorCode::OFF);
        if hold(half, &cancel).await {
            break;
        }
    }

    driver.reset();
    info!("indicator stopped");
}

/// Sleep for `duration`. Returns true if cancelled first.
async fn hold(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
