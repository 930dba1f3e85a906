//! On-board accelerator: the filter IP core streamed through an AXI DMA in
//! simple (register direct) mode.
//!
//! The DMA reads the input block from, and writes the filtered block to, a
//! reserved buffer window: input at offset 0, output right after the input
//! capacity. Completion is polled on the channel status registers.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::FilterError;
use crate::hw::registers::{axi_dma, ipcore};
use crate::hw::RegisterBus;

use super::dma::DmaEngine;

const WORD: usize = std::mem::size_of::<u32>();
const POLL_INTERVAL: Duration = Duration::from_micros(100);
const RESET_TIMEOUT: Duration = Duration::from_millis(100);

/// Bytes of buffer window needed for blocks of up to `capacity` samples.
pub fn buffer_span(capacity: usize) -> usize {
    2 * capacity * WORD
}

/// Program the block length of the filter IP core.
pub fn configure_ip_core<B: RegisterBus>(ip: &B, window_len: usize) -> io::Result<()> {
    let value = u32::try_from(window_len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "window length exceeds 32 bits"))?;
    ip.write32(ipcore::WINDOW_SIZE, value)?;
    info!(window_len, "filter_ip_configured");
    Ok(())
}

/// [`DmaEngine`] driving the AXI DMA registers `regs`, with transfer
/// buffers in `buffers` at physical address `buffers_phys`.
pub struct AxiDmaEngine<R, M> {
    regs: R,
    buffers: M,
    src_addr: u32,
    dst_addr: u32,
    capacity: usize,
    recv_len: usize,
}

impl<R: RegisterBus, M: RegisterBus> AxiDmaEngine<R, M> {
    /// Reset both channels and start them.
    pub fn new(regs: R, buffers: M, buffers_phys: usize, capacity: usize) -> Result<Self, FilterError> {
        let end = buffers_phys.checked_add(buffer_span(capacity));
        let (Ok(src_addr), Some(Ok(_))) = (u32::try_from(buffers_phys), end.map(u32::try_from)) else {
            return Err(FilterError::Engine(format!(
                "dma buffers at 0x{buffers_phys:x} are outside the 32-bit address range"
            )));
        };
        let engine = Self {
            regs,
            buffers,
            src_addr,
            dst_addr: src_addr + (capacity * WORD) as u32,
            capacity,
            recv_len: 0,
        };
        engine.reset()?;
        info!(
            src = %format!("0x{:08x}", engine.src_addr),
            dst = %format!("0x{:08x}", engine.dst_addr),
            capacity,
            "axi_dma_ready"
        );
        Ok(engine)
    }

    /// Soft-reset both channels, then set them running.
    pub fn reset(&self) -> Result<(), FilterError> {
        self.regs.write32(axi_dma::MM2S_DMACR, axi_dma::DMACR_RESET)?;
        self.regs.write32(axi_dma::S2MM_DMACR, axi_dma::DMACR_RESET)?;

        let start = Instant::now();
        loop {
            let mm2s = self.regs.read32(axi_dma::MM2S_DMACR)?;
            let s2mm = self.regs.read32(axi_dma::S2MM_DMACR)?;
            if (mm2s | s2mm) & axi_dma::DMACR_RESET == 0 {
                break;
            }
            if start.elapsed() > RESET_TIMEOUT {
                return Err(FilterError::Engine("dma reset timeout".to_string()));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        self.regs.write32(axi_dma::MM2S_DMACR, axi_dma::DMACR_RS)?;
        self.regs.write32(axi_dma::S2MM_DMACR, axi_dma::DMACR_RS)?;
        debug!("axi_dma_reset");
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<(), FilterError> {
        if len > self.capacity {
            return Err(FilterError::LengthMismatch {
                expected: self.capacity,
                actual: len,
            });
        }
        Ok(())
    }

    /// Poll `status_reg` until the channel is idle.
    fn wait_idle(&self, status_reg: usize, stage: &'static str, timeout: Duration) -> Result<(), FilterError> {
        let start = Instant::now();
        loop {
            let status = self.regs.read32(status_reg)?;
            if status & axi_dma::DMASR_ERR_IRQ != 0 {
                warn!(stage, status = %format!("0x{status:08x}"), "dma_channel_error");
                // A faulted channel halts until reset.
                if let Err(e) = self.reset() {
                    warn!(error = %e, "dma reset after channel error failed");
                }
                return Err(FilterError::Engine(format!(
                    "{stage} channel error, status 0x{status:08x}"
                )));
            }
            if status & axi_dma::DMASR_IDLE != 0 {
                return Ok(());
            }
            if status & axi_dma::DMASR_HALTED != 0 {
                return Err(FilterError::Engine(format!("{stage} channel halted")));
            }
            if start.elapsed() >= timeout {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(stage, timeout_ms, "dma_transfer_timeout");
                return Err(FilterError::Timeout { stage, timeout_ms });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl<R: RegisterBus, M: RegisterBus> DmaEngine for AxiDmaEngine<R, M> {
    fn start_send(&mut self, data: &[i32]) -> Result<(), FilterError> {
        self.check_len(data.len())?;
        for (i, &sample) in data.iter().enumerate() {
            self.buffers.write32(i * WORD, sample as u32)?;
        }
        self.regs.write32(axi_dma::MM2S_SA, self.src_addr)?;
        self.regs.write32(axi_dma::MM2S_LENGTH, (data.len() * WORD) as u32)?;
        Ok(())
    }

    fn wait_send(&mut self, timeout: Duration) -> Result<(), FilterError> {
        self.wait_idle(axi_dma::MM2S_DMASR, "push", timeout)
    }

    fn start_recv(&mut self, len: usize) -> Result<(), FilterError> {
        self.check_len(len)?;
        self.regs.write32(axi_dma::S2MM_DA, self.dst_addr)?;
        self.regs.write32(axi_dma::S2MM_LENGTH, (len * WORD) as u32)?;
        self.recv_len = len;
        Ok(())
    }

    fn wait_recv(&mut self, timeout: Duration, out: &mut [i32]) -> Result<(), FilterError> {
        self.wait_idle(axi_dma::S2MM_DMASR, "pull", timeout)?;
        if out.len() != self.recv_len {
            return Err(FilterError::LengthMismatch {
                expected: self.recv_len,
                actual: out.len(),
            });
        }
        let base = self.capacity * WORD;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.buffers.read32(base + i * WORD)? as i32;
        }
        Ok(())
    }
}
