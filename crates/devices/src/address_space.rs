use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use vela_hv::{Direction, MmioAccess, PioAccess};

use crate::io::{MmioDevice, PortIoDevice};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressSpaceError {
    #[error("PIO range [0x{base:x}, 0x{end:x}) overlaps an existing registration")]
    PioOverlap { base: u16, end: u32 },
    #[error("MMIO range [0x{base:x}, 0x{end:x}) overlaps an existing registration")]
    MmioOverlap { base: u64, end: u64 },
    #[error("empty device range at 0x{base:x}")]
    EmptyRange { base: u64 },
}

/// Raised in strict mode when the guest touches an unmapped address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("unmapped PIO port 0x{port:04x}")]
    UnmappedPio { port: u16 },
    #[error("unmapped guest physical address 0x{gpa:x}")]
    UnmappedMmio { gpa: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Unhandled,
}

struct PioRange {
    end: u32,
    device: Arc<dyn PortIoDevice>,
}

struct MmioRange {
    end: u64,
    device: Arc<dyn MmioDevice>,
}

/// Routes guest PIO and MMIO accesses to registered device handlers.
///
/// Registration happens once during VM construction; dispatch is lock-free
/// afterwards (the maps are never mutated again and devices synchronise
/// internally).
///
/// Unhandled accesses follow the Linux-boot-tolerant policy: reads return 0
/// and writes are dropped. Strict mode upgrades them to [`BusError`], which
/// the vCPU loop turns into an error exit.
pub struct AddressSpace {
    pio: BTreeMap<u16, PioRange>,
    mmio: BTreeMap<u64, MmioRange>,
    strict: bool,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self { pio: BTreeMap::new(), mmio: BTreeMap::new(), strict: false }
    }

    pub fn strict() -> Self {
        Self { pio: BTreeMap::new(), mmio: BTreeMap::new(), strict: true }
    }

    pub fn register_pio(
        &mut self,
        base: u16,
        len: u32,
        device: Arc<dyn PortIoDevice>,
    ) -> Result<(), AddressSpaceError> {
        if len == 0 {
            return Err(AddressSpaceError::EmptyRange { base: u64::from(base) });
        }
        let end = u32::from(base) + len;
        if end > 0x1_0000 {
            return Err(AddressSpaceError::PioOverlap { base, end });
        }
        // The previous range must end at or before `base`, and the next range
        // must start at or after `end`.
        if let Some((_, prev)) = self.pio.range(..=base).next_back() {
            if prev.end > u32::from(base) {
                return Err(AddressSpaceError::PioOverlap { base, end });
            }
        }
        if let Some((&next_base, _)) = self.pio.range(base..).next() {
            if u32::from(next_base) < end {
                return Err(AddressSpaceError::PioOverlap { base, end });
            }
        }
        self.pio.insert(base, PioRange { end, device });
        Ok(())
    }

    pub fn register_mmio(
        &mut self,
        base: u64,
        len: u64,
        device: Arc<dyn MmioDevice>,
    ) -> Result<(), AddressSpaceError> {
        if len == 0 {
            return Err(AddressSpaceError::EmptyRange { base });
        }
        let end = base
            .checked_add(len)
            .ok_or(AddressSpaceError::MmioOverlap { base, end: u64::MAX })?;
        if let Some((_, prev)) = self.mmio.range(..=base).next_back() {
            if prev.end > base {
                return Err(AddressSpaceError::MmioOverlap { base, end });
            }
        }
        if let Some((&next_base, _)) = self.mmio.range(base..).next() {
            if next_base < end {
                return Err(AddressSpaceError::MmioOverlap { base, end });
            }
        }
        self.mmio.insert(base, MmioRange { end, device });
        Ok(())
    }

    fn lookup_pio(&self, port: u16) -> Option<(u16, &PioRange)> {
        let (&base, range) = self.pio.range(..=port).next_back()?;
        if u32::from(port) < range.end {
            Some((base, range))
        } else {
            None
        }
    }

    fn lookup_mmio(&self, gpa: u64) -> Option<(u64, &MmioRange)> {
        let (&base, range) = self.mmio.range(..=gpa).next_back()?;
        if gpa < range.end {
            Some((base, range))
        } else {
            None
        }
    }

    /// Dispatches a port I/O access, mutating `access.value` for reads.
    pub fn dispatch_pio(&self, access: &mut PioAccess) -> Result<DispatchOutcome, BusError> {
        match self.lookup_pio(access.port) {
            Some((base, range)) => {
                let offset = access.port - base;
                match access.direction {
                    Direction::Read => {
                        access.value = range.device.pio_read(offset, access.size);
                    }
                    Direction::Write => {
                        range.device.pio_write(offset, access.size, access.value);
                    }
                }
                Ok(DispatchOutcome::Handled)
            }
            None if self.strict => Err(BusError::UnmappedPio { port: access.port }),
            None => {
                if access.direction == Direction::Read {
                    access.value = 0;
                }
                Ok(DispatchOutcome::Unhandled)
            }
        }
    }

    /// Dispatches an MMIO access, mutating `access.value` for reads.
    pub fn dispatch_mmio(&self, access: &mut MmioAccess) -> Result<DispatchOutcome, BusError> {
        match self.lookup_mmio(access.gpa) {
            Some((base, range)) => {
                let offset = access.gpa - base;
                match access.direction {
                    Direction::Read => {
                        access.value = range.device.mmio_read(offset, access.size);
                    }
                    Direction::Write => {
                        range.device.mmio_write(offset, access.size, access.value);
                    }
                }
                Ok(DispatchOutcome::Handled)
            }
            None if self.strict => Err(BusError::UnmappedMmio { gpa: access.gpa }),
            None => {
                if access.direction == Direction::Read {
                    access.value = 0;
                }
                Ok(DispatchOutcome::Unhandled)
            }
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}
