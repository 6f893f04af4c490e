//! Hypervisor capability interface.
//!
//! The VMM core never talks to a host virtualization service directly; it is
//! handed an implementation of [`Hypervisor`] at construction time. The trait
//! surface mirrors what the supported platforms (WHP, KVM, Hypervisor.framework)
//! have in common: create a partition, map host memory into guest physical
//! address space, create vCPUs, run them until an exit, cancel in-flight runs,
//! and request fixed-interrupt delivery.
//!
//! Exits are decoded by the binding into [`VcpuExit`]. MMIO/PIO exits carry an
//! access descriptor whose `value` field is in/out: the dispatcher mutates it
//! for reads and the binding consumes it via [`Vcpu::complete_mmio`] /
//! [`Vcpu::complete_pio`] before the next [`Vcpu::run`].

use std::sync::Arc;

use thiserror::Error;

pub mod testing;

/// Errors surfaced by a hypervisor binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HvError {
    /// The platform virtualization service is missing or disabled.
    #[error("hypervisor platform is not available")]
    Unavailable,
    /// Partition, vCPU, or mapping creation failed for resource reasons.
    #[error("hypervisor resources exhausted: {0}")]
    ResourceExhausted(String),
    /// Any run/control failure not otherwise classified.
    #[error("hypervisor internal error: {0}")]
    Internal(String),
}

/// Direction of an I/O access from the guest's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Guest reads from the device (PIO `IN`, MMIO load).
    Read,
    /// Guest writes to the device (PIO `OUT`, MMIO store).
    Write,
}

/// A memory-mapped I/O access decoded from a vCPU exit.
///
/// `value` is the written data for [`Direction::Write`]; for
/// [`Direction::Read`] it is filled in by the dispatcher and handed back to
/// the binding through [`Vcpu::complete_mmio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioAccess {
    pub gpa: u64,
    /// Access width in bytes: 1, 2, 4, or 8.
    pub size: u8,
    pub direction: Direction,
    pub value: u64,
}

/// A port I/O access decoded from a vCPU exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioAccess {
    pub port: u16,
    /// Access width in bytes: 1, 2, or 4.
    pub size: u8,
    pub direction: Direction,
    pub value: u32,
}

/// Decoded reason a [`Vcpu::run`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExit {
    /// The binding already handled the exit (e.g. an MSR access); resume.
    Continue,
    Mmio(MmioAccess),
    Pio(PioAccess),
    /// The guest executed `HLT` with interrupts enabled.
    Halt,
    /// The guest requested a platform shutdown (e.g. triple fault treated as
    /// shutdown by the binding, or an explicit shutdown exit).
    Shutdown,
    /// The run was cancelled via [`VmPartition::cancel_run`].
    Canceled,
}

/// Guest physical memory mapping permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFlags {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl MapFlags {
    pub const fn rwx() -> Self {
        Self { read: true, write: true, execute: true }
    }
}

/// A span of host memory handed to the hypervisor for GPA mapping.
///
/// The caller guarantees the span stays valid and committed for the lifetime
/// of the partition it is mapped into.
#[derive(Debug, Clone, Copy)]
pub struct HostRegion {
    pub ptr: *mut u8,
    pub len: u64,
}

/// Fixed-interrupt delivery request, built from an IOAPIC redirection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptRequest {
    pub vector: u8,
    /// Destination APIC ID (physical mode) or destination set (logical mode).
    pub destination: u32,
    /// `true` = logical destination mode, `false` = physical.
    pub logical_destination: bool,
    /// `true` = level triggered, `false` = edge triggered.
    pub level_triggered: bool,
}

/// Registers a [`GuestLoader`] (in `vela-machine`) can program on the boot
/// processor. Segment registers take a packed `base` value; bindings expand
/// them to their native representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    Rip,
    Rflags,
    Cr0,
    Cr3,
    Cr4,
    Efer,
    CsBase,
    DsBase,
    EsBase,
    FsBase,
    GsBase,
    SsBase,
    GdtrBase,
    GdtrLimit,
    IdtrBase,
    IdtrLimit,
}

/// Entry point to a host virtualization service.
pub trait Hypervisor: Send + Sync {
    /// Short human-readable binding name for logs (e.g. `"whp"`, `"kvm"`).
    fn name(&self) -> &str;

    /// Creates a partition sized for `cpu_count` virtual processors.
    ///
    /// Returns [`HvError::Unavailable`] when the platform lacks the service.
    fn create_vm(&self, cpu_count: u32) -> Result<Arc<dyn VmPartition>, HvError>;
}

/// A created VM partition.
///
/// All methods take `&self`: the partition handle is shared between vCPU
/// worker threads, device emulators (interrupt injection), and the control
/// plane (cancellation).
pub trait VmPartition: Send + Sync {
    /// Maps `region` at `gpa` in the guest physical address space.
    fn map_memory(&self, gpa: u64, region: HostRegion, flags: MapFlags) -> Result<(), HvError>;

    fn create_vcpu(&self, vp_index: u32) -> Result<Box<dyn Vcpu>, HvError>;

    /// Requests delivery of a fixed interrupt to the guest.
    fn request_interrupt(&self, request: &InterruptRequest) -> Result<(), HvError>;

    /// Cancels an in-flight [`Vcpu::run`] on the given processor, making it
    /// return [`VcpuExit::Canceled`] promptly. Callable from any thread; a
    /// cancel with no run in flight applies to the next run.
    fn cancel_run(&self, vp_index: u32);
}

/// A single virtual processor. Owned by exactly one worker thread.
pub trait Vcpu: Send {
    fn vp_index(&self) -> u32;

    fn set_registers(&mut self, regs: &[(Register, u64)]) -> Result<(), HvError>;

    /// Runs the processor until the next exit.
    fn run(&mut self) -> Result<VcpuExit, HvError>;

    /// Completes a decoded MMIO exit, handing the (possibly mutated) access
    /// value back to the binding so guest register state can be updated.
    fn complete_mmio(&mut self, access: &MmioAccess) -> Result<(), HvError>;

    /// Completes a decoded PIO exit.
    fn complete_pio(&mut self, access: &PioAccess) -> Result<(), HvError>;
}
