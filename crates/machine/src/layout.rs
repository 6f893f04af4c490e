//! Fixed guest platform layout.
//!
//! These constants are shared with the guest loader, which must advertise the
//! same addresses and IRQs through the ACPI tables it synthesises (virtio
//! windows appear in the DSDT as `LNRO0005` devices).

pub use vela_memory::{MMIO_GAP_END, MMIO_GAP_START};

pub const IOAPIC_MMIO_BASE: u64 = 0xFEC0_0000;
pub use vela_devices::IOAPIC_MMIO_SIZE;

pub const VIRTIO_BLK_MMIO_BASE: u64 = 0xD000_0000;
pub const VIRTIO_BLK_IRQ: u32 = 5;

pub const VIRTIO_NET_MMIO_BASE: u64 = 0xD000_0200;
pub const VIRTIO_NET_IRQ: u32 = 6;

pub use vela_devices::COM1_BASE;
pub const COM1_IRQ: u32 = 4;

/// ACPI PM1a block base port; the reset register sits at offset 8.
pub const ACPI_PM_BASE_PORT: u16 = 0x600;

/// Legacy ports the guest probes during boot that get a silent sink:
/// POST/diag `0x80`, DMA page `0x87`, COM2-4, and the PCI mechanism-2
/// data window.
pub const SILENT_PIO_RANGES: &[(u16, u32)] = &[
    (0x80, 1),
    (0x87, 1),
    (0x2E8, 8),
    (0x2F8, 8),
    (0x3E8, 8),
    (0xC000, 0x1000),
];
