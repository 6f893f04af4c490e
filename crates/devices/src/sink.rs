use crate::io::{MmioDevice, PortIoDevice};

/// Silent sink for harmless legacy ports the guest probes during boot
/// (POST/diagnostic port, DMA page registers, absent COM ports, the PCI
/// mechanism-2 window). Reads return 0; writes are dropped.
///
/// Registering these explicitly keeps strict mode meaningful: only genuinely
/// unmapped addresses fault.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortSink;

impl PortIoDevice for PortSink {
    fn pio_read(&self, _offset: u16, _size: u8) -> u32 {
        0
    }

    fn pio_write(&self, _offset: u16, _size: u8, _value: u32) {}
}

impl MmioDevice for PortSink {
    fn mmio_read(&self, _offset: u64, _size: u8) -> u64 {
        0
    }

    fn mmio_write(&self, _offset: u64, _size: u8, _value: u64) {}
}
