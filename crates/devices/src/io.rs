/// A device reachable through port I/O.
///
/// `offset` is relative to the registered base port. `size` is the access
/// width in bytes (1, 2, or 4), forwarded verbatim from the vCPU exit; devices
/// that only support some widths ignore the rest per their own silent-sink
/// policy.
pub trait PortIoDevice: Send + Sync {
    fn pio_read(&self, offset: u16, size: u8) -> u32;
    fn pio_write(&self, offset: u16, size: u8, value: u32);
}

/// A device reachable through memory-mapped I/O.
///
/// `offset` is relative to the registered base GPA; `size` is 1, 2, 4, or 8.
pub trait MmioDevice: Send + Sync {
    fn mmio_read(&self, offset: u64, size: u8) -> u64;
    fn mmio_write(&self, offset: u64, size: u8, value: u64);
}
