//! Fixed-rate, double-buffered acquisition loop.
//!
//! A dedicated OS thread fills one of two buffers sample by sample at `fs`,
//! then hands a private copy downstream and switches to the other buffer.
//! Downstream processing never blocks the loop: the handoff target decides
//! how to queue (or drop) windows.

pub mod source;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::{MonitorError, SourceError};
use crate::metrics::{metric_names, MetricsRegistry};
pub use source::{Sample, SampleSource, SpiSampleSource, SyntheticEcg};

/// A filled buffer on its way to the processing stage.
#[derive(Debug, Clone)]
pub struct RawWindow {
    /// Monotonic buffer sequence number.
    pub seq: u64,
    pub samples: Vec<Sample>,
    pub captured_at: Instant,
}

/// Receiver of filled buffers. Must not block the caller.
pub trait Handoff: Send + Sync {
    fn handoff(&self, window: RawWindow);
}

/// Two fixed buffers used alternately.
pub(crate) struct PingPong {
    buffers: [Box<[Sample]>; 2],
    active: usize,
}

impl PingPong {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            buffers: [
                vec![0; len].into_boxed_slice(),
                vec![0; len].into_boxed_slice(),
            ],
            active: 0,
        }
    }

    /// The buffer currently being written.
    pub(crate) fn active_mut(&mut self) -> &mut [Sample] {
        &mut self.buffers[self.active]
    }

    pub(crate) fn active_index(&self) -> usize {
        self.active
    }

    /// Copy out the filled buffer and switch writing to the other one.
    pub(crate) fn handoff(&mut self) -> Vec<Sample> {
        let copy = self.buffers[self.active].to_vec();
        self.active ^= 1;
        copy
    }

    #[cfg(test)]
    pub(crate) fn buffer_mut(&mut self, index: usize) -> &mut [Sample] {
        &mut self.buffers[index]
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub buffer_len: usize,
    pub sample_period: Duration,
}

/// Keeps the acquisition thread alive. `stop()` finishes the buffer in
/// flight, joins the thread and reports how it ended.
pub struct AcquisitionHandle {
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<u64, SourceError>>>,
}

impl AcquisitionHandle {
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Whether the loop has exited (stopped or failed).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop and join. Returns the number of buffers handed off, or the
    /// source error that terminated the loop.
    pub fn stop(mut self) -> Result<u64, MonitorError> {
        self.request_stop();
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result.map_err(MonitorError::from),
                Err(_) => Err(MonitorError::Panicked("acquisition")),
            },
            None => Ok(0),
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Start the acquisition thread. `on_fault` runs on the acquisition thread
/// if the source fails.
pub fn start_acquisition<F>(
    mut source: Box<dyn SampleSource>,
    config: AcquisitionConfig,
    handoff: Arc<dyn Handoff>,
    metrics: Arc<MetricsRegistry>,
    on_fault: F,
) -> Result<AcquisitionHandle, MonitorError>
where
    F: FnOnce(&SourceError) + Send + 'static,
{
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_loop = Arc::clone(&stop_flag);

    let thread = std::thread::Builder::new()
        .name("ecg-acquisition".into())
        .spawn(move || {
            let result = run_acquisition_loop(source.as_mut(), &config, handoff.as_ref(), &metrics, &stop_loop);
            match &result {
                Ok(windows) => info!(windows, "acquisition loop stopped"),
                Err(e) => {
                    error!(error = %e, "acquisition loop failed");
                    on_fault(e);
                }
            }
            result
        })
        .map_err(|source| MonitorError::Spawn {
            name: "acquisition",
            source,
        })?;

    Ok(AcquisitionHandle {
        stop_flag,
        thread: Some(thread),
    })
}

fn run_acquisition_loop(
    source: &mut dyn SampleSource,
    config: &AcquisitionConfig,
    handoff: &dyn Handoff,
    metrics: &MetricsRegistry,
    stop_flag: &AtomicBool,
) -> Result<u64, SourceError> {
    let period = config.sample_period;
    let mut buffers = PingPong::new(config.buffer_len);
    let mut seq = 0u64;
    let mut next_tick = Instant::now();

    info!(
        buffer_len = config.buffer_len,
        period_us = period.as_micros() as u64,
        "acquisition loop started"
    );

    while !stop_flag.load(Ordering::Relaxed) {
        for slot in buffers.active_mut().iter_mut() {
            *slot = source.read()?;

            next_tick += period;
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            } else {
                let lag = now - next_tick;
                metrics.record(metric_names::ACQ_TICK_LAG, lag.as_micros() as f64);
                if lag > period {
                    // Too far behind to catch up without bursting reads.
                    next_tick = now;
                }
            }
        }

        let filled = buffers.active_index();
        let samples = buffers.handoff();
        debug!(seq, buffer = filled, "buffer_filled");
        handoff.handoff(RawWindow {
            seq,
            samples,
            captured_at: Instant::now(),
        });
        seq += 1;
    }

    Ok(seq)
}
