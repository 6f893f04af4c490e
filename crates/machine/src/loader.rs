use std::path::Path;

use vela_hv::Register;
use vela_memory::GuestRam;

use crate::error::VmError;

/// One virtio-mmio window the loader must describe to the guest (DSDT
/// `LNRO0005` entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioMmioWindow {
    pub base: u64,
    pub size: u64,
    pub irq: u32,
}

/// Everything a loader needs to place a kernel and boot state into RAM.
pub struct BootContext<'a> {
    pub ram: &'a GuestRam,
    pub cpu_count: u32,
    pub kernel_path: &'a Path,
    pub initrd_path: Option<&'a Path>,
    pub cmdline: &'a str,
    pub virtio_windows: &'a [VirtioMmioWindow],
}

/// Guest-OS loader capability.
///
/// Consumed once at VM construction: parses the kernel image, writes it plus
/// boot protocol structures and ACPI tables into guest RAM, and returns the
/// initial register state for the boot processor. Application processors
/// start in the hypervisor's wait-for-SIPI state and get no registers here.
pub trait GuestLoader: Send + Sync {
    fn load(&self, ctx: &BootContext<'_>) -> Result<Vec<(Register, u64)>, VmError>;
}
