//! ECG monitor: fixed-rate double-buffered acquisition, accelerator block
//! filtering, adaptive heartbeat detection and a rate indicator.
//! Main library: module wiring and the `run()` entry point of the binary.

pub mod acquisition;
pub mod config;
pub mod detect;
pub mod error;
pub mod filter;
pub mod hw;
pub mod indicator;
pub mod metrics;
pub mod pipeline;
pub mod state_machine;

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use acquisition::{SampleSource, SpiSampleSource, SyntheticEcg};
use config::MonitorConfig;
use error::{FilterError, MonitorError, SourceError};
use filter::axi::{buffer_span, configure_ip_core, AxiDmaEngine};
use filter::FilterBank;
use hw::MappedRegion;
use indicator::{color_for_rate, GpioIndicator, Indicator, IndicatorDriver, LogIndicator};
use pipeline::Monitor;

/// Rate of the built-in synthetic heart.
const DEMO_BPM: f64 = 72.0;
const DEMO_AMPLITUDE: i16 = 1000;

/// Run the monitor until Ctrl-C or an acquisition fault.
///
/// The first command-line argument, if any, is a JSON config file. Without
/// `hardware.enabled` the monitor runs on a synthetic heart. Set
/// `ECG_MONITOR_LOG=json` for JSON log lines.
pub fn run() -> Result<(), MonitorError> {
    init_tracing();
    info!("ecg-monitor starting");

    let config = match std::env::args_os().nth(1) {
        Some(path) => MonitorConfig::load_from_file(Path::new(&path))?,
        None => MonitorConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| MonitorError::Spawn {
            name: "runtime",
            source,
        })?;
    runtime.block_on(serve(config))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ecg_monitor=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if std::env::var("ECG_MONITOR_LOG").is_ok_and(|v| v == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Everything the monitor drives: board peripherals, or the synthetic demo.
struct Devices {
    source: Box<dyn SampleSource>,
    indicator: Arc<dyn IndicatorDriver>,
    filters: FilterBank,
}

fn open_devices(config: &MonitorConfig) -> Result<Devices, MonitorError> {
    let hw = &config.hardware;
    if !hw.enabled {
        info!(bpm = DEMO_BPM, "using synthetic source");
        return Ok(Devices {
            source: Box::new(SyntheticEcg::new(config.sample_rate_hz, DEMO_BPM, DEMO_AMPLITUDE)),
            indicator: Arc::new(LogIndicator),
            filters: FilterBank::simulated_accelerator(config.sample_rate_hz, config.filter_timeout()),
        });
    }

    let spi = MappedRegion::open("spi", hw.spi_base, hw.register_span).map_err(SourceError::from)?;
    let gpio = MappedRegion::open("gpio", hw.gpio_base, hw.register_span).map_err(SourceError::from)?;
    let source = SpiSampleSource::new(spi, hw.spi_cs_mask, config.source_timeout())?;

    let ip = MappedRegion::open("filter-ip", hw.ip_base, hw.register_span).map_err(FilterError::from)?;
    configure_ip_core(&ip, config.buffer_len).map_err(FilterError::from)?;
    let dma = MappedRegion::open("dma", hw.dma_base, hw.register_span).map_err(FilterError::from)?;
    let buffers = MappedRegion::open("dma-buffers", hw.dma_buffer_base, buffer_span(config.buffer_len))
        .map_err(FilterError::from)?;
    let buffers_phys = buffers.phys_base();
    let engine = AxiDmaEngine::new(dma, buffers, buffers_phys, config.buffer_len)?;

    Ok(Devices {
        source: Box::new(source),
        indicator: Arc::new(GpioIndicator::new(gpio)),
        filters: FilterBank::accelerator(engine, config.sample_rate_hz, config.filter_timeout()),
    })
}

async fn serve(config: MonitorConfig) -> Result<(), MonitorError> {
    let devices = open_devices(&config)?;
    let monitor = Monitor::start(&config, devices.source, devices.filters)?;

    let indicator = Indicator::spawn(devices.indicator, monitor.rate(), config.indicator_fallback());
    let mut rate = monitor.rate();
    let mut state = monitor.subscribe_state();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("shutdown requested");
                break;
            }
            changed = rate.changed() => {
                if changed.is_err() {
                    break;
                }
                let bpm = *rate.borrow_and_update();
                info!(bpm, color = %color_for_rate(bpm), "heart_rate");
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if !current.is_running() {
                    warn!(state = %current, "monitor no longer running");
                    break;
                }
            }
        }
    }

    indicator.stop().await;
    let stats = tokio::task::spawn_blocking(move || monitor.stop())
        .await
        .map_err(|_| MonitorError::Panicked("shutdown"))??;
    info!(
        windows_acquired = stats.windows_acquired,
        windows_processed = stats.windows_processed,
        overruns = stats.overruns,
        filter_failures = stats.filter_failures,
        "ecg-monitor finished"
    );
    Ok(())
}
