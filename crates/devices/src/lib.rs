//! Platform device models.
//!
//! Every device implements [`PortIoDevice`] and/or [`MmioDevice`] with `&self`
//! receivers and guards its own state with an internal mutex. That keeps
//! interrupt injection reentrancy-safe: a device worker thread may inject an
//! IRQ (taking the IOAPIC lock) while a vCPU thread is inside a dispatch on a
//! different device.

mod acpi;
mod address_space;
mod io;
mod ioapic;
mod serial;
mod sink;

pub use acpi::{
    AcpiPm, PowerHooks, ACPI_PM_REG_COUNT, PM1_CNT_OFFSET, PM1_EN_OFFSET, PM1_STS_OFFSET,
    RESET_REG_OFFSET, RESET_REG_VALUE, SLP_EN, SLP_TYP_S5,
};
pub use address_space::{AddressSpace, AddressSpaceError, BusError, DispatchOutcome};
pub use io::{MmioDevice, PortIoDevice};
pub use ioapic::{IoApic, IoApicInjector, RedirEntry, IOAPIC_MMIO_SIZE, IOAPIC_REDIR_ENTRIES};
pub use serial::{ConsoleSink, Serial16550, COM1_BASE, SERIAL_REG_COUNT};
pub use sink::PortSink;

/// Capability used by devices to wake the guest.
///
/// `pin` is an IOAPIC input pin number. Implementations consult the
/// redirection table and, when the pin is unmasked and programmed, issue a
/// fixed-interrupt request to the hypervisor.
pub trait IrqSink: Send + Sync {
    fn inject(&self, pin: u32);
}

/// An [`IrqSink`] that drops every injection; useful in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIrq;

impl IrqSink for NoIrq {
    fn inject(&self, _pin: u32) {}
}
