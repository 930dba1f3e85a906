//! Processing pipeline: bounded work queue, filter worker pool and the
//! ordered detection stage.
//!
//! Acquisition hands each filled buffer to a [`WorkQueue`]. Workers take
//! windows in arrival order, filter them in parallel, then pass through a
//! gate that admits them to the detector strictly in dequeue order. The
//! detector is the only stateful stage, so it runs under the gate lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as cb;
use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acquisition::{self, AcquisitionConfig, AcquisitionHandle, Handoff, RawWindow, SampleSource};
use crate::config::{MonitorConfig, OverrunPolicy};
use crate::detect::{DetectorConfig, PeakDetector};
use crate::error::MonitorError;
use crate::filter::{FilterBank, FilteredWindow};
use crate::metrics::{metric_names, MetricsRegistry, PipelineCounters, PipelineStats};
use crate::state_machine::{MonitorState, StateMachine};

/// Bounded queue between acquisition and the workers. Never blocks the
/// producer: when full, one window is dropped according to the policy.
pub struct WorkQueue {
    tx: Mutex<Option<cb::Sender<RawWindow>>>,
    rx: cb::Receiver<RawWindow>,
    policy: OverrunPolicy,
    counters: Arc<PipelineCounters>,
}

impl WorkQueue {
    pub fn new(capacity: usize, policy: OverrunPolicy, counters: Arc<PipelineCounters>) -> Self {
        let (tx, rx) = cb::bounded(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            policy,
            counters,
        }
    }

    pub fn receiver(&self) -> cb::Receiver<RawWindow> {
        self.rx.clone()
    }

    /// Stop accepting windows. Queued windows stay available to receivers,
    /// which see a disconnect once drained.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Handoff for WorkQueue {
    fn handoff(&self, window: RawWindow) {
        self.counters.windows_acquired.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            debug!(seq = window.seq, "queue closed, window dropped");
            return;
        };

        match tx.try_send(window) {
            Ok(()) => {}
            Err(cb::TrySendError::Full(window)) => {
                let overruns = self.counters.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                match self.policy {
                    OverrunPolicy::DropNewest => {
                        warn!(dropped = window.seq, overruns, "processing overrun, newest window dropped");
                    }
                    OverrunPolicy::DropOldest => {
                        let evicted = self.rx.try_recv().ok().map(|w| w.seq);
                        warn!(
                            dropped = ?evicted,
                            queued = window.seq,
                            overruns,
                            "processing overrun, oldest window dropped"
                        );
                        if let Err(e) = tx.try_send(window) {
                            warn!(dropped = e.into_inner().seq, "window dropped after eviction");
                        }
                    }
                }
            }
            Err(cb::TrySendError::Disconnected(window)) => {
                debug!(seq = window.seq, "no workers, window dropped");
            }
        }
    }
}

struct GateState {
    next_ticket: u64,
    detector: PeakDetector,
}

/// Admits filtered windows to the detector in ticket order.
struct OrderedGate {
    state: Mutex<GateState>,
    turn: Condvar,
}

/// State shared by all workers.
struct Shared {
    rx: cb::Receiver<RawWindow>,
    /// Held across recv so tickets follow dequeue order.
    dequeue: Mutex<u64>,
    gate: OrderedGate,
    filters: FilterBank,
    bpm_average_windows: usize,
    rate_tx: watch::Sender<f64>,
    state: Arc<StateMachine>,
    counters: Arc<PipelineCounters>,
    metrics: Arc<MetricsRegistry>,
}

impl Shared {
    fn next_window(&self) -> Option<(u64, RawWindow)> {
        let mut next = self.dequeue.lock();
        let window = self.rx.recv().ok()?;
        let ticket = *next;
        *next += 1;
        Some((ticket, window))
    }

    /// Wait for `ticket`'s turn, run detection on the result, pass the turn on.
    fn detect_in_order(&self, ticket: u64, filtered: Option<FilteredWindow>) {
        let mut gate = self.gate.state.lock();
        self.gate.turn.wait_while(&mut gate, |g| g.next_ticket != ticket);

        if let Some(window) = filtered {
            self.detect(&mut gate.detector, window);
        }

        gate.next_ticket += 1;
        drop(gate);
        self.gate.turn.notify_all();
    }

    fn detect(&self, detector: &mut PeakDetector, window: FilteredWindow) {
        let span = self.metrics.span(metric_names::DETECT_DONE);
        let outcome = match detector.process(window.seq, &window.enhanced, &window.band) {
            Ok(Some(detection)) => Some((detection.window_index, detection.window_peaks.len())),
            Ok(None) => None,
            Err(e) => {
                warn!(seq = window.seq, error = %e, "window rejected by detector");
                span.finish();
                return;
            }
        };
        span.finish();
        self.counters.windows_processed.fetch_add(1, Ordering::Relaxed);

        let Some((window_index, peaks)) = outcome else {
            debug!(seq = window.seq, "warming up");
            return;
        };

        let bpm = detector.estimate_bpm(self.bpm_average_windows);
        if self.state.current() != MonitorState::Faulted {
            self.rate_tx.send_replace(bpm);
        }
        self.state.advance_from(MonitorState::WarmingUp, MonitorState::Monitoring);
        debug!(seq = window.seq, window_index, peaks, bpm, "window processed");
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>) {
    debug!(worker = id, "worker started");
    while let Some((ticket, window)) = shared.next_window() {
        shared
            .metrics
            .record(metric_names::QUEUE_WAIT, window.captured_at.elapsed().as_micros() as f64);

        let span = shared.metrics.span(metric_names::FILTER_DONE);
        let filtered = match shared.filters.apply(window.seq, &window.samples) {
            Ok(filtered) => Some(filtered),
            Err(e) => {
                shared.counters.filter_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker = id,
                    seq = window.seq,
                    error = %e,
                    recoverable = e.is_recoverable(),
                    "filter failed, window dropped"
                );
                None
            }
        };
        span.finish();

        shared.detect_in_order(ticket, filtered);
    }
    debug!(worker = id, "worker stopped");
}

fn spawn_workers(count: usize, shared: &Arc<Shared>) -> Result<Vec<JoinHandle<()>>, MonitorError> {
    let mut workers = Vec::with_capacity(count);
    for id in 0..count {
        let worker_shared = Arc::clone(shared);
        let handle = std::thread::Builder::new()
            .name(format!("ecg-worker-{id}"))
            .spawn(move || worker_loop(id, worker_shared))
            .map_err(|source| MonitorError::Spawn { name: "worker", source })?;
        workers.push(handle);
    }
    Ok(workers)
}

fn join_workers(workers: Vec<JoinHandle<()>>) -> Result<(), MonitorError> {
    let mut result = Ok(());
    for worker in workers {
        if worker.join().is_err() {
            result = Err(MonitorError::Panicked("worker"));
        }
    }
    result
}

/// A running monitor session: acquisition thread, worker pool and the
/// published heart rate.
pub struct Monitor {
    session_id: String,
    acquisition: Option<AcquisitionHandle>,
    queue: Arc<WorkQueue>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl Monitor {
    /// Validate `config` and start acquiring from `source`.
    pub fn start(config: &MonitorConfig, source: Box<dyn SampleSource>, filters: FilterBank) -> Result<Self, MonitorError> {
        config.validate()?;
        let session_id = Uuid::new_v4().to_string();

        let counters = Arc::new(PipelineCounters::default());
        let metrics = Arc::new(MetricsRegistry::new());
        let state = Arc::new(StateMachine::new());
        let queue = Arc::new(WorkQueue::new(
            config.queue_capacity,
            config.overrun_policy,
            Arc::clone(&counters),
        ));
        let (rate_tx, _) = watch::channel(0.0);

        let shared = Arc::new(Shared {
            rx: queue.receiver(),
            dequeue: Mutex::new(0),
            gate: OrderedGate {
                state: Mutex::new(GateState {
                    next_ticket: 0,
                    detector: PeakDetector::new(DetectorConfig::from(config)),
                }),
                turn: Condvar::new(),
            },
            filters,
            bpm_average_windows: config.bpm_average_windows,
            rate_tx,
            state: Arc::clone(&state),
            counters,
            metrics: Arc::clone(&metrics),
        });

        let workers = match spawn_workers(config.workers, &shared) {
            Ok(workers) => workers,
            Err(e) => {
                queue.close();
                return Err(e);
            }
        };

        let _ = state.transition(MonitorState::WarmingUp);
        let fault_state = Arc::clone(&state);
        let acquisition = acquisition::start_acquisition(
            source,
            AcquisitionConfig {
                buffer_len: config.buffer_len,
                sample_period: config.sample_period(),
            },
            Arc::clone(&queue) as Arc<dyn Handoff>,
            metrics,
            move |_| {
                let _ = fault_state.transition(MonitorState::Faulted);
            },
        );
        let acquisition = match acquisition {
            Ok(handle) => handle,
            Err(e) => {
                queue.close();
                let _ = join_workers(workers);
                let _ = state.transition(MonitorState::Stopped);
                return Err(e);
            }
        };

        info!(
            session_id = %session_id,
            sample_rate_hz = config.sample_rate_hz,
            buffer_len = config.buffer_len,
            workers = config.workers,
            mode = ?config.detector_mode,
            "monitor started"
        );

        Ok(Self {
            session_id,
            acquisition: Some(acquisition),
            queue,
            workers,
            shared,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Receiver of the current heart-rate estimate (bpm, 0 until known).
    pub fn rate(&self) -> watch::Receiver<f64> {
        self.shared.rate_tx.subscribe()
    }

    pub fn current_rate(&self) -> f64 {
        *self.shared.rate_tx.borrow()
    }

    pub fn state(&self) -> MonitorState {
        self.shared.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MonitorState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.shared.metrics
    }

    /// Inspect the detector. Blocks detection while `f` runs.
    pub fn with_detector<R>(&self, f: impl FnOnce(&PeakDetector) -> R) -> R {
        f(&self.shared.gate.state.lock().detector)
    }

    /// Stop acquisition, let the workers drain the queue and join them.
    ///
    /// Returns the final counters, or the error that faulted acquisition.
    pub fn stop(mut self) -> Result<PipelineStats, MonitorError> {
        let acquired = match self.acquisition.take() {
            Some(handle) => handle.stop(),
            None => Ok(0),
        };
        self.queue.close();
        let joined = join_workers(std::mem::take(&mut self.workers));
        let _ = self.shared.state.transition(MonitorState::Stopped);

        let stats = self.stats();
        info!(
            session_id = %self.session_id,
            windows_acquired = stats.windows_acquired,
            windows_processed = stats.windows_processed,
            overruns = stats.overruns,
            filter_failures = stats.filter_failures,
            "monitor stopped"
        );

        acquired?;
        joined?;
        Ok(stats)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        // Dropping the handle stops and joins the acquisition thread.
        self.acquisition.take();
        self.queue.close();
        let _ = join_workers(std::mem::take(&mut self.workers));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorMode;
    use crate::error::FilterError;
    use crate::filter::BlockFilter;
    use std::time::{Duration, Instant};

    fn window(seq: u64, len: usize) -> RawWindow {
        RawWindow {
            seq,
            samples: vec![seq as i16; len],
            captured_at: Instant::now(),
        }
    }

    fn drain(queue: &WorkQueue) -> Vec<u64> {
        let rx = queue.receiver();
        std::iter::from_fn(|| rx.try_recv().ok()).map(|w| w.seq).collect()
    }

    #[test]
    fn test_drop_oldest_on_overrun() {
        let counters = Arc::new(PipelineCounters::default());
        let queue = WorkQueue::new(2, OverrunPolicy::DropOldest, Arc::clone(&counters));
        for seq in 0..4 {
            queue.handoff(window(seq, 4));
        }
        assert_eq!(drain(&queue), vec![2, 3]);
        let stats = counters.snapshot();
        assert_eq!(stats.windows_acquired, 4);
        assert_eq!(stats.overruns, 2);
    }

    #[test]
    fn test_drop_newest_on_overrun() {
        let counters = Arc::new(PipelineCounters::default());
        let queue = WorkQueue::new(2, OverrunPolicy::DropNewest, Arc::clone(&counters));
        for seq in 0..4 {
            queue.handoff(window(seq, 4));
        }
        assert_eq!(drain(&queue), vec![0, 1]);
        assert_eq!(counters.snapshot().overruns, 2);
    }

    #[test]
    fn test_closed_queue_drains_then_disconnects() {
        let queue = WorkQueue::new(4, OverrunPolicy::DropOldest, Arc::new(PipelineCounters::default()));
        queue.handoff(window(0, 4));
        queue.close();
        queue.handoff(window(1, 4));
        let rx = queue.receiver();
        assert_eq!(rx.recv().unwrap().seq, 0);
        assert!(rx.recv().is_err());
    }

    /// Identity filter that is slow on even-valued blocks and fails on `fail_on`.
    struct Uneven {
        fail_on: Option<i32>,
    }

    impl BlockFilter for Uneven {
        fn filter(&self, input: &[i32]) -> Result<Vec<i32>, FilterError> {
            let tag = input[0];
            if Some(tag) == self.fail_on {
                return Err(FilterError::Engine("injected".into()));
            }
            if tag % 2 == 0 {
                std::thread::sleep(Duration::from_millis(15));
            }
            Ok(input.to_vec())
        }
    }

    fn detector_config(window_len: usize, min_dist: usize) -> DetectorConfig {
        DetectorConfig {
            window_len,
            sample_rate_hz: 200,
            min_dist,
            band_half_window: 4,
            history_windows: 16,
            warmup_windows: 1,
            mode: DetectorMode::Single,
            clamped_band_noise_update: true,
        }
    }

    fn shared_with(filter: Uneven, queue: &WorkQueue) -> Arc<Shared> {
        shared_with_config(filter, queue, detector_config(8, 2))
    }

    fn shared_with_config(filter: Uneven, queue: &WorkQueue, config: DetectorConfig) -> Arc<Shared> {
        let filter: Arc<dyn BlockFilter> = Arc::new(filter);
        let state = Arc::new(StateMachine::new());
        state.transition(MonitorState::WarmingUp).unwrap();
        Arc::new(Shared {
            rx: queue.receiver(),
            dequeue: Mutex::new(0),
            gate: OrderedGate {
                state: Mutex::new(GateState {
                    next_ticket: 0,
                    detector: PeakDetector::new(config),
                }),
                turn: Condvar::new(),
            },
            filters: FilterBank::new(Arc::clone(&filter), filter),
            bpm_average_windows: 4,
            rate_tx: watch::channel(0.0).0,
            state,
            counters: Arc::new(PipelineCounters::default()),
            metrics: Arc::new(MetricsRegistry::new()),
        })
    }

    #[test]
    fn test_detection_follows_dequeue_order() {
        let queue = WorkQueue::new(16, OverrunPolicy::DropNewest, Arc::new(PipelineCounters::default()));
        let shared = shared_with(Uneven { fail_on: None }, &queue);
        for seq in 0..6 {
            queue.handoff(window(seq, 8));
        }
        queue.close();

        let workers = spawn_workers(3, &shared).unwrap();
        join_workers(workers).unwrap();

        let gate = shared.gate.state.lock();
        assert_eq!(gate.next_ticket, 6);
        // Slow even windows finish filtering late but are still detected in order.
        let expected: Vec<i32> = (0..6).flat_map(|v| std::iter::repeat(v).take(8)).collect();
        assert_eq!(gate.detector.enhanced_signal(), expected.as_slice());
        assert_eq!(gate.detector.history().len(), 5);
        assert_eq!(shared.counters.snapshot().windows_processed, 6);
        assert_eq!(shared.state.current(), MonitorState::Monitoring);
    }

    #[test]
    fn test_filter_failure_skips_window_without_stalling() {
        let queue = WorkQueue::new(16, OverrunPolicy::DropNewest, Arc::new(PipelineCounters::default()));
        let shared = shared_with(Uneven { fail_on: Some(1) }, &queue);
        for seq in 0..5 {
            queue.handoff(window(seq, 8));
        }
        queue.close();

        let workers = spawn_workers(2, &shared).unwrap();
        join_workers(workers).unwrap();

        let stats = shared.counters.snapshot();
        assert_eq!(stats.filter_failures, 1);
        assert_eq!(stats.windows_processed, 4);
        let gate = shared.gate.state.lock();
        assert_eq!(gate.next_ticket, 5);
        // The failed window reads as zeros.
        let expected: Vec<i32> = [0, 0, 2, 3, 4]
            .into_iter()
            .flat_map(|v| std::iter::repeat(v).take(8))
            .collect();
        assert_eq!(gate.detector.enhanced_signal(), expected.as_slice());
    }

    #[test]
    fn test_failed_window_keeps_later_beats_in_place() {
        const LEN: usize = 16;
        let queue = WorkQueue::new(16, OverrunPolicy::DropNewest, Arc::new(PipelineCounters::default()));
        let shared = shared_with_config(Uneven { fail_on: Some(2) }, &queue, detector_config(LEN, 6));
        // Sample 0 carries the tag the test filter keys on.
        let beats: [(u64, usize, i16); 4] = [(0, 8, 100), (1, 14, 80), (2, 8, 100), (3, 2, 90)];
        for (seq, pos, value) in beats {
            let mut w = window(seq, LEN);
            w.samples = vec![0; LEN];
            w.samples[0] = seq as i16;
            w.samples[pos] = value;
            queue.handoff(w);
        }
        queue.close();

        join_workers(spawn_workers(2, &shared).unwrap()).unwrap();

        assert_eq!(shared.counters.snapshot().filter_failures, 1);
        let gate = shared.gate.state.lock();
        let history: Vec<Vec<usize>> = gate.detector.history().iter().cloned().collect();
        assert_eq!(history, vec![vec![14], vec![2]]);
        // Window 3 starts at sample 48 even though window 2 never reached the detector.
        assert_eq!(gate.detector.last_peak().map(|p| p.global_index), Some(3 * LEN + 2));
    }

    #[test]
    fn test_rate_frozen_when_faulted() {
        let queue = WorkQueue::new(16, OverrunPolicy::DropNewest, Arc::new(PipelineCounters::default()));
        let shared = shared_with(Uneven { fail_on: None }, &queue);
        let rate = shared.rate_tx.subscribe();
        shared.state.transition(MonitorState::Faulted).unwrap();
        // A spike in the steady window would otherwise publish a rate.
        let mut spike = vec![1; 8];
        spike[4] = 90;
        for (seq, samples) in [vec![1; 8], spike].into_iter().enumerate() {
            let mut w = window(seq as u64, 8);
            w.samples = samples.iter().map(|&v| v as i16).collect();
            queue.handoff(w);
        }
        queue.close();

        join_workers(spawn_workers(1, &shared).unwrap()).unwrap();
        assert_eq!(shared.counters.filter_failures.load(Ordering::Relaxed), 0);
        assert_eq!(shared.counters.snapshot().windows_processed, 2);
        assert_eq!(*rate.borrow(), 0.0);
        assert_eq!(shared.state.current(), MonitorState::Faulted);
    }
}
