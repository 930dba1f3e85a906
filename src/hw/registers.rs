//! Register maps of the peripherals used by the monitor.

/// AXI Quad SPI core (ADC front end).
pub mod spi {
    /// Control register
    pub const SPICR: usize = 0x60;
    /// Status register
    pub const SPISR: usize = 0x64;
    /// Data transmit register
    pub const SPI_DTR: usize = 0x68;
    /// Data receive register
    pub const SPI_DRR: usize = 0x6C;
    /// Slave-select register
    pub const SPISSR: usize = 0x70;

    /// Master mode, SPI enable, manual slave select.
    pub const SPICR_MASTER_ENABLE: u32 = 0x86;
    /// Conversion command shifted out for every sample.
    pub const READ_COMMAND: u32 = 0x0101;

    // Status bits
    pub const SPISR_RX_EMPTY: u32 = 1 << 0;
}

/// AXI GPIO driving the RGB indicator LED.
pub mod gpio {
    /// Channel 1 data register
    pub const DATA: usize = 0x0;
    /// Channel 1 tri-state register (0 = output)
    pub const TRI: usize = 0x4;

    pub const ALL_OUTPUTS: u32 = 0x0;
    pub const COLOR_MASK: u32 = 0b111;
}

/// AXI DMA in simple (register direct) mode.
pub mod axi_dma {
    /// MM2S control register
    pub const MM2S_DMACR: usize = 0x00;
    /// MM2S status register
    pub const MM2S_DMASR: usize = 0x04;
    /// MM2S source address
    pub const MM2S_SA: usize = 0x18;
    /// MM2S transfer length in bytes; writing it starts the transfer
    pub const MM2S_LENGTH: usize = 0x28;

    /// S2MM control register
    pub const S2MM_DMACR: usize = 0x30;
    /// S2MM status register
    pub const S2MM_DMASR: usize = 0x34;
    /// S2MM destination address
    pub const S2MM_DA: usize = 0x48;
    /// S2MM transfer length in bytes; writing it starts the transfer
    pub const S2MM_LENGTH: usize = 0x58;

    // Control bits
    pub const DMACR_RS: u32 = 1 << 0;
    pub const DMACR_RESET: u32 = 1 << 2;

    // Status bits
    pub const DMASR_HALTED: u32 = 1 << 0;
    pub const DMASR_IDLE: u32 = 1 << 1;
    pub const DMASR_ERR_IRQ: u32 = 1 << 14;
}

/// ECG filter pipeline IP core.
pub mod ipcore {
    /// Samples per processed block
    pub const WINDOW_SIZE: usize = 0x8;
}
