//! End-to-end runs of the monitor on the synthetic source.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ecg_monitor::acquisition::SyntheticEcg;
use ecg_monitor::config::{DetectorMode, MonitorConfig};
use ecg_monitor::error::{ConfigError, MonitorError, SourceError};
use ecg_monitor::filter::dma::{DmaBlockFilter, LoopbackDma};
use ecg_monitor::filter::software::{BandLimiter, QrsEnhancer};
use ecg_monitor::filter::{BlockFilter, FilterBank};
use ecg_monitor::hw::registers::gpio;
use ecg_monitor::hw::SimRegisters;
use ecg_monitor::indicator::{ColorCode, GpioIndicator, Indicator, IndicatorDriver};
use ecg_monitor::pipeline::Monitor;
use ecg_monitor::state_machine::MonitorState;

const FS: u32 = 1000;

/// One buffer per beat at 120 bpm, so every QRS sits mid-window.
fn beat_aligned_config() -> MonitorConfig {
    MonitorConfig {
        sample_rate_hz: FS,
        buffer_len: 500,
        min_dist_secs: 0.25,
        band_half_window: 150,
        bpm_average_windows: 4,
        detector_mode: DetectorMode::Dual,
        indicator_fallback_half_period_ms: 50,
        ..MonitorConfig::default()
    }
}

fn short_window_config() -> MonitorConfig {
    MonitorConfig {
        sample_rate_hz: FS,
        buffer_len: 50,
        min_dist_secs: 0.01,
        band_half_window: 10,
        filter_timeout_ms: 5,
        ..MonitorConfig::default()
    }
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn synthetic_heart_drives_rate_and_indicator() {
    let config = beat_aligned_config();
    let monitor = Monitor::start(
        &config,
        Box::new(SyntheticEcg::new(FS, 120.0, 1000)),
        FilterBank::software(FS),
    )
    .unwrap();
    assert!(!monitor.session_id().is_empty());

    let regs = Arc::new(SimRegisters::new());
    let driver: Arc<dyn IndicatorDriver> = Arc::new(GpioIndicator::new(Arc::clone(&regs)));
    let indicator = Indicator::spawn(driver, monitor.rate(), config.indicator_fallback());

    let mut rate = monitor.rate();
    let bpm = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            rate.changed().await.unwrap();
            let bpm = *rate.borrow_and_update();
            if bpm > 0.0 {
                return bpm;
            }
        }
    })
    .await
    .expect("no heart rate published");

    assert!((110.0..=130.0).contains(&bpm), "bpm = {bpm}");
    assert_eq!(monitor.state(), MonitorState::Monitoring);

    // Long enough for the blink loop to pick up the new rate.
    tokio::time::sleep(Duration::from_millis(300)).await;
    indicator.stop().await;

    let stats = tokio::task::spawn_blocking(move || {
        let detected = monitor.with_detector(|d| d.history().iter().all(|w| w.len() == 1));
        assert!(detected, "expected one beat per window");
        monitor.stop()
    })
    .await
    .unwrap()
    .unwrap();

    assert!(stats.windows_processed >= 2);
    assert_eq!(stats.filter_failures, 0);

    let data = regs.writes_to(gpio::DATA);
    assert!(data.contains(&(ColorCode::ELEVATED.bits() as u32)), "writes: {data:?}");
    assert_eq!(data.last(), Some(&0));
    assert_eq!(regs.writes_to(gpio::TRI).first(), Some(&gpio::ALL_OUTPUTS));
}

#[test]
fn stalled_accelerator_drops_windows() {
    let config = short_window_config();
    let enhancer = LoopbackDma::new(QrsEnhancer::new(FS));
    let stall = enhancer.stall_handle();
    stall.store(true, Ordering::SeqCst);
    let enhanced: Arc<dyn BlockFilter> = Arc::new(DmaBlockFilter::new(enhancer, config.filter_timeout()));
    let band: Arc<dyn BlockFilter> = Arc::new(BandLimiter::new(FS));

    let monitor = Monitor::start(
        &config,
        Box::new(SyntheticEcg::new(FS, 75.0, 1000)),
        FilterBank::new(enhanced, band),
    )
    .unwrap();

    assert!(wait_for(Duration::from_secs(3), || monitor.stats().filter_failures >= 3));
    assert_eq!(monitor.state(), MonitorState::WarmingUp);
    assert_eq!(monitor.current_rate(), 0.0);

    let stats = monitor.stop().unwrap();
    assert_eq!(stats.windows_processed, 0);
    assert!(stats.filter_failures >= 3);
}

#[test]
fn exhausted_source_faults_monitor() {
    let config = short_window_config();
    let monitor = Monitor::start(
        &config,
        Box::new(SyntheticEcg::new(FS, 75.0, 1000).with_limit(120)),
        FilterBank::software(FS),
    )
    .unwrap();
    let state = monitor.subscribe_state();

    assert!(wait_for(Duration::from_secs(3), || *state.borrow() == MonitorState::Faulted));

    let err = monitor.stop().unwrap_err();
    assert!(matches!(err, MonitorError::Source(SourceError::Exhausted(120))));
    assert_eq!(*state.borrow(), MonitorState::Stopped);
}

#[test]
fn invalid_config_is_rejected() {
    let config = MonitorConfig {
        buffer_len: 20,
        ..MonitorConfig::default()
    };
    let result = Monitor::start(
        &config,
        Box::new(SyntheticEcg::new(200, 60.0, 1000)),
        FilterBank::software(200),
    );
    assert!(matches!(
        result,
        Err(MonitorError::Config(ConfigError::Invalid(_)))
    ));
}
