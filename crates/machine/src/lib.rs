//! VM lifecycle and platform wiring.
//!
//! [`Vm`] composes guest RAM, the address-space router, the interrupt fabric,
//! ACPI power control, the serial console, and virtio-mmio devices on top of
//! a [`vela_hv::Hypervisor`] capability, then drives one worker thread per
//! vCPU through the exit dispatch loop. [`VmSpec`] is the persisted per-VM
//! description; [`GuestLoader`] is the boot-protocol capability supplied by
//! the embedder.

mod error;
pub mod layout;
mod loader;
mod spec;
mod vm;

pub use error::VmError;
pub use loader::{BootContext, GuestLoader, VirtioMmioWindow};
pub use spec::{PortForward, SharedFolder, VmPowerState, VmSpec, VM_SPEC_FILE};
pub use vm::{Vm, VmConfig};
