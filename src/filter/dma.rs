//! Accelerator filter driven through split DMA transfers.
//!
//! A block goes through four steps: push N samples, wait for the push,
//! pull N samples, wait for the pull. Every wait is bounded by a timeout so a
//! stuck accelerator costs one window instead of blocking a worker forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::FilterError;

use super::BlockFilter;

/// One-shot completion flag with a timed wait.
#[derive(Default)]
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn reset(&self) {
        *self.done.lock() = false;
    }

    pub fn complete(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    /// Block until completed or `timeout` elapses. Returns whether it completed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            let _ = self.cond.wait_while_for(&mut done, |done| !*done, timeout);
        }
        *done
    }
}

/// Memory-to-stream / stream-to-memory channel pair of the accelerator.
pub trait DmaEngine: Send {
    fn start_send(&mut self, data: &[i32]) -> Result<(), FilterError>;
    fn wait_send(&mut self, timeout: Duration) -> Result<(), FilterError>;
    fn start_recv(&mut self, len: usize) -> Result<(), FilterError>;
    fn wait_recv(&mut self, timeout: Duration, out: &mut [i32]) -> Result<(), FilterError>;
}

/// [`BlockFilter`] on top of a DMA engine. Calls are serialised on the engine.
pub struct DmaBlockFilter<E> {
    engine: Mutex<E>,
    timeout: Duration,
}

impl<E: DmaEngine> DmaBlockFilter<E> {
    pub fn new(engine: E, timeout: Duration) -> Self {
        Self {
            engine: Mutex::new(engine),
            timeout,
        }
    }
}

impl<E: DmaEngine> BlockFilter for DmaBlockFilter<E> {
    fn filter(&self, input: &[i32]) -> Result<Vec<i32>, FilterError> {
        let mut engine = self.engine.lock();
        engine.start_send(input)?;
        engine.wait_send(self.timeout)?;
        engine.start_recv(input.len())?;
        let mut out = vec![0; input.len()];
        engine.wait_recv(self.timeout, &mut out)?;
        Ok(out)
    }
}

/// Simulated accelerator: the streamed block goes through a software filter.
///
/// `stall_handle()` returns a switch that makes transfers never complete.
pub struct LoopbackDma<F> {
    inner: F,
    pending: Vec<i32>,
    recv_len: usize,
    sent: Completion,
    received: Completion,
    stalled: Arc<AtomicBool>,
}

impl<F: BlockFilter> LoopbackDma<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            recv_len: 0,
            sent: Completion::default(),
            received: Completion::default(),
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stall_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stalled)
    }

    fn timeout_error(stage: &'static str, timeout: Duration) -> FilterError {
        warn!(stage, timeout_ms = timeout.as_millis() as u64, "dma_transfer_timeout");
        FilterError::Timeout {
            stage,
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

impl<F: BlockFilter> DmaEngine for LoopbackDma<F> {
    fn start_send(&mut self, data: &[i32]) -> Result<(), FilterError> {
        self.sent.reset();
        self.received.reset();
        self.pending = self.inner.filter(data)?;
        if !self.stalled.load(Ordering::SeqCst) {
            self.sent.complete();
        }
        Ok(())
    }

    fn wait_send(&mut self, timeout: Duration) -> Result<(), FilterError> {
        if self.sent.wait(timeout) {
            Ok(())
        } else {
            Err(Self::timeout_error("push", timeout))
        }
    }

    fn start_recv(&mut self, len: usize) -> Result<(), FilterError> {
        if len != self.pending.len() {
            return Err(FilterError::LengthMismatch {
                expected: self.pending.len(),
                actual: len,
            });
        }
        self.recv_len = len;
        if !self.stalled.load(Ordering::SeqCst) {
            self.received.complete();
        }
        Ok(())
    }

    fn wait_recv(&mut self, timeout: Duration, out: &mut [i32]) -> Result<(), FilterError> {
        if !self.received.wait(timeout) {
            return Err(Self::timeout_error("pull", timeout));
        }
        if out.len() != self.recv_len {
            return Err(FilterError::LengthMismatch {
                expected: self.recv_len,
                actual: out.len(),
            });
        }
        out.copy_from_slice(&self.pending);
        Ok(())
    }
}
