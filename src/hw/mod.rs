//! Register-level access to the board peripherals.
//!
//! Drivers talk to a [`RegisterBus`] rather than raw pointers so the same
//! SPI and GPIO code runs against `/dev/mem` on the board and against
//! [`SimRegisters`] in tests.

pub mod mmap;
pub mod registers;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

pub use mmap::MappedRegion;

/// 32-bit register window addressed by byte offset.
pub trait RegisterBus: Send + Sync {
    fn read32(&self, offset: usize) -> io::Result<u32>;
    fn write32(&self, offset: usize, value: u32) -> io::Result<()>;
}

impl<T: RegisterBus + ?Sized> RegisterBus for Arc<T> {
    fn read32(&self, offset: usize) -> io::Result<u32> {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) -> io::Result<()> {
        (**self).write32(offset, value)
    }
}

#[derive(Default)]
struct SimState {
    values: HashMap<usize, u32>,
    scripted: HashMap<usize, VecDeque<u32>>,
    writes: Vec<(usize, u32)>,
    fail: bool,
}

/// In-memory register file.
///
/// Reads return scripted values first (one per read, in order), then the
/// last written value, then zero. Every write is logged.
#[derive(Default)]
pub struct SimRegisters {
    state: Mutex<SimState>,
}

impl SimRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resting value of a register.
    pub fn set(&self, offset: usize, value: u32) {
        self.state.lock().values.insert(offset, value);
    }

    /// Queue values returned by successive reads of `offset`.
    pub fn script_reads(&self, offset: usize, values: impl IntoIterator<Item = u32>) {
        self.state
            .lock()
            .scripted
            .entry(offset)
            .or_default()
            .extend(values);
    }

    /// Make every subsequent access fail with an I/O error.
    pub fn fail_all(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.lock().writes.clone()
    }

    /// Values written to one register, oldest first.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|&(_, v)| v)
            .collect()
    }
}

impl RegisterBus for SimRegisters {
    fn read32(&self, offset: usize) -> io::Result<u32> {
        let mut state = self.state.lock();
        if state.fail {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated bus fault"));
        }
        if let Some(value) = state.scripted.get_mut(&offset).and_then(VecDeque::pop_front) {
            return Ok(value);
        }
        Ok(state.values.get(&offset).copied().unwrap_or(0))
    }

    fn write32(&self, offset: usize, value: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated bus fault"));
        }
        state.values.insert(offset, value);
        state.writes.push((offset, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_reads_then_resting_value() {
        let regs = SimRegisters::new();
        regs.set(0x64, 0);
        regs.script_reads(0x64, [1, 1]);
        assert_eq!(regs.read32(0x64).unwrap(), 1);
        assert_eq!(regs.read32(0x64).unwrap(), 1);
        assert_eq!(regs.read32(0x64).unwrap(), 0);
    }

    #[test]
    fn test_write_log() {
        let regs = SimRegisters::new();
        regs.write32(0x0, 2).unwrap();
        regs.write32(0x4, 0).unwrap();
        regs.write32(0x0, 0).unwrap();
        assert_eq!(regs.writes_to(0x0), vec![2, 0]);
        assert_eq!(regs.read32(0x0).unwrap(), 0);
        assert_eq!(regs.writes().len(), 3);
    }

    #[test]
    fn test_fault_injection() {
        let regs = SimRegisters::new();
        regs.fail_all(true);
        assert!(regs.read32(0x0).is_err());
        assert!(regs.write32(0x0, 1).is_err());
    }
}
