//! `/dev/mem` register window for running on the board.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

use tracing::info;

use super::RegisterBus;

/// A page-aligned mapping of a physical register window.
pub struct MappedRegion {
    name: String,
    phys_base: usize,
    size: usize,
    /// Start of the mapping (page aligned).
    map_base: *mut libc::c_void,
    map_len: usize,
    /// First register of the window inside the mapping.
    regs: *mut u8,
    _file: File,
}

// Access goes through volatile reads/writes of aligned 32-bit registers.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn open(name: impl Into<String>, phys_base: usize, size: usize) -> io::Result<Self> {
        let name = name.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/mem")
            .map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "cannot open /dev/mem; run as root",
                    )
                } else {
                    e
                }
            })?;

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return Err(io::Error::last_os_error());
        }
        let page_size = page_size as usize;
        let page_offset = phys_base & (page_size - 1);
        let aligned_base = phys_base - page_offset;
        let map_len = size + page_offset;

        let map_base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                aligned_base as libc::off_t,
            )
        };
        if map_base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let regs = unsafe { (map_base as *mut u8).add(page_offset) };

        info!(region = %name, phys_base = %format!("0x{phys_base:08x}"), size, "register_window_mapped");

        Ok(Self {
            name,
            phys_base,
            size,
            map_base,
            map_len,
            regs,
            _file: file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phys_base(&self) -> usize {
        self.phys_base
    }

    fn check(&self, offset: usize) -> io::Result<()> {
        if offset % 4 != 0 || offset + 4 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset 0x{offset:x} outside region {} (size 0x{:x})", self.name, self.size),
            ));
        }
        Ok(())
    }
}

impl RegisterBus for MappedRegion {
    fn read32(&self, offset: usize) -> io::Result<u32> {
        self.check(offset)?;
        // SAFETY: offset is aligned and within the mapped window.
        Ok(unsafe { ptr::read_volatile(self.regs.add(offset) as *const u32) })
    }

    fn write32(&self, offset: usize, value: u32) -> io::Result<()> {
        self.check(offset)?;
        // SAFETY: offset is aligned and within the mapped window.
        unsafe { ptr::write_volatile(self.regs.add(offset) as *mut u32, value) };
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map_base, self.map_len);
        }
    }
}
