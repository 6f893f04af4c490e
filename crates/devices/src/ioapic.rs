use std::sync::{Arc, Mutex};

use tracing::trace;
use vela_hv::{InterruptRequest, VmPartition};

use crate::io::MmioDevice;
use crate::IrqSink;

/// Size of the IOAPIC MMIO window the platform decodes.
pub const IOAPIC_MMIO_SIZE: u64 = 0x0010_0000;

/// Number of redirection table entries (version register advertises 24).
pub const IOAPIC_REDIR_ENTRIES: usize = 24;

const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;
const IOEOI: u64 = 0x40;

const REG_ID: u8 = 0x00;
const REG_VER: u8 = 0x01;
const REG_ARB: u8 = 0x02;
const REG_REDTBL: u8 = 0x10;

/// 24 entries, version 0x20.
const VERSION_VALUE: u32 = 0x0017_0020;

const RTE_MASKED: u64 = 1 << 16;
const RTE_REMOTE_IRR: u64 = 1 << 14;

/// Decoded redirection table entry snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirEntry {
    pub vector: u8,
    pub masked: bool,
    /// Destination-mode bit: `true` = logical.
    pub logical_destination: bool,
    /// Trigger-mode bit: `true` = level.
    pub level_triggered: bool,
    pub remote_irr: bool,
    pub destination: u8,
}

impl RedirEntry {
    fn decode(raw: u64) -> Self {
        Self {
            vector: (raw & 0xFF) as u8,
            masked: raw & RTE_MASKED != 0,
            logical_destination: raw & (1 << 11) != 0,
            level_triggered: raw & (1 << 15) != 0,
            remote_irr: raw & RTE_REMOTE_IRR != 0,
            destination: (raw >> 56) as u8,
        }
    }
}

struct IoApicState {
    index: u8,
    id: u8,
    redir: [u64; IOAPIC_REDIR_ENTRIES],
}

/// IOAPIC model: the `IOREGSEL`/`IOWIN` register window, 24 redirection
/// entries, and an EOI register that clears Remote-IRR by vector match.
///
/// The redirection table is guarded by a single mutex; injection performs its
/// read-modify-write of Remote-IRR under the same lock.
pub struct IoApic {
    state: Mutex<IoApicState>,
}

impl IoApic {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IoApicState {
                index: 0,
                id: 0,
                // Reset state: every entry masked.
                redir: [RTE_MASKED; IOAPIC_REDIR_ENTRIES],
            }),
        }
    }

    /// Decoded snapshot of the redirection entry for `pin`.
    pub fn redirection(&self, pin: u32) -> Option<RedirEntry> {
        let state = self.state.lock().unwrap();
        state.redir.get(pin as usize).map(|&raw| RedirEntry::decode(raw))
    }

    /// Builds the fixed-interrupt request for `pin`, or `None` when the entry
    /// is masked or has no vector programmed.
    ///
    /// For level-triggered entries this also latches Remote-IRR, which stays
    /// set until the guest's EOI reaches [`IoApic::mmio_write`] at the EOI
    /// register.
    pub fn interrupt_for(&self, pin: u32) -> Option<InterruptRequest> {
        let mut state = self.state.lock().unwrap();
        let raw = state.redir.get(pin as usize).copied()?;
        let entry = RedirEntry::decode(raw);
        if entry.masked || entry.vector == 0 {
            return None;
        }
        if entry.level_triggered {
            state.redir[pin as usize] |= RTE_REMOTE_IRR;
        }
        Some(InterruptRequest {
            vector: entry.vector,
            destination: u32::from(entry.destination),
            logical_destination: entry.logical_destination,
            level_triggered: entry.level_triggered,
        })
    }

    fn read_register(state: &IoApicState) -> u32 {
        match state.index {
            REG_ID => u32::from(state.id & 0x0F) << 24,
            REG_VER => VERSION_VALUE,
            REG_ARB => 0,
            reg if reg >= REG_REDTBL
                && usize::from(reg - REG_REDTBL) < IOAPIC_REDIR_ENTRIES * 2 =>
            {
                let idx = usize::from(reg - REG_REDTBL);
                let entry = state.redir[idx / 2];
                if idx % 2 == 0 {
                    entry as u32
                } else {
                    (entry >> 32) as u32
                }
            }
            _ => 0,
        }
    }

    fn write_register(state: &mut IoApicState, value: u32) {
        match state.index {
            REG_ID => state.id = ((value >> 24) & 0x0F) as u8,
            reg if reg >= REG_REDTBL
                && usize::from(reg - REG_REDTBL) < IOAPIC_REDIR_ENTRIES * 2 =>
            {
                let idx = usize::from(reg - REG_REDTBL);
                let entry = &mut state.redir[idx / 2];
                if idx % 2 == 0 {
                    // Remote-IRR is read-only to the guest.
                    let irr = *entry & RTE_REMOTE_IRR;
                    *entry = (*entry & 0xFFFF_FFFF_0000_0000)
                        | (u64::from(value) & !RTE_REMOTE_IRR)
                        | irr;
                } else {
                    *entry = (*entry & 0x0000_0000_FFFF_FFFF) | (u64::from(value) << 32);
                }
            }
            _ => {}
        }
    }

    fn eoi(state: &mut IoApicState, vector: u8) {
        if vector == 0 {
            return;
        }
        for entry in &mut state.redir {
            if (*entry & 0xFF) as u8 == vector {
                *entry &= !RTE_REMOTE_IRR;
            }
        }
    }
}

impl Default for IoApic {
    fn default() -> Self {
        Self::new()
    }
}

impl MmioDevice for IoApic {
    fn mmio_read(&self, offset: u64, _size: u8) -> u64 {
        let state = self.state.lock().unwrap();
        match offset {
            IOREGSEL => u64::from(state.index),
            IOWIN => u64::from(Self::read_register(&state)),
            _ => 0,
        }
    }

    fn mmio_write(&self, offset: u64, _size: u8, value: u64) {
        let mut state = self.state.lock().unwrap();
        match offset {
            IOREGSEL => state.index = (value & 0xFF) as u8,
            IOWIN => Self::write_register(&mut state, value as u32),
            IOEOI => Self::eoi(&mut state, (value & 0xFF) as u8),
            _ => {}
        }
    }
}

/// Translates an IOAPIC pin into a hypervisor fixed-interrupt request.
///
/// This is the single injection entry point shared by every device IRQ
/// callback; it may be called from vCPU threads and device worker threads
/// alike.
pub struct IoApicInjector {
    ioapic: Arc<IoApic>,
    partition: Arc<dyn VmPartition>,
}

impl IoApicInjector {
    pub fn new(ioapic: Arc<IoApic>, partition: Arc<dyn VmPartition>) -> Self {
        Self { ioapic, partition }
    }
}

impl IrqSink for IoApicInjector {
    fn inject(&self, pin: u32) {
        let Some(request) = self.ioapic.interrupt_for(pin) else {
            trace!(pin, "dropping IRQ: pin masked or unprogrammed");
            return;
        };
        if let Err(err) = self.partition.request_interrupt(&request) {
            tracing::warn!(pin, vector = request.vector, %err, "interrupt request failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(ioapic: &IoApic, reg: u8) {
        ioapic.mmio_write(IOREGSEL, 4, u64::from(reg));
    }

    fn write_reg(ioapic: &IoApic, reg: u8, value: u32) {
        select(ioapic, reg);
        ioapic.mmio_write(IOWIN, 4, u64::from(value));
    }

    fn read_reg(ioapic: &IoApic, reg: u8) -> u32 {
        select(ioapic, reg);
        ioapic.mmio_read(IOWIN, 4) as u32
    }

    #[test]
    fn id_version_and_arbitration_registers() {
        let ioapic = IoApic::new();
        assert_eq!(read_reg(&ioapic, REG_VER), 0x0017_0020);
        assert_eq!(read_reg(&ioapic, REG_ARB), 0);

        write_reg(&ioapic, REG_ID, 0xAB00_0000);
        // Only 4 bits of the ID are significant.
        assert_eq!(read_reg(&ioapic, REG_ID), 0x0B00_0000);
    }

    #[test]
    fn entries_reset_masked() {
        let ioapic = IoApic::new();
        for pin in 0..IOAPIC_REDIR_ENTRIES as u32 {
            let entry = ioapic.redirection(pin).unwrap();
            assert!(entry.masked);
            assert_eq!(entry.vector, 0);
        }
        assert!(ioapic.redirection(IOAPIC_REDIR_ENTRIES as u32).is_none());
    }

    #[test]
    fn rte_halves_read_back_without_cross_talk() {
        let ioapic = IoApic::new();
        for pin in 0..IOAPIC_REDIR_ENTRIES as u8 {
            let low = REG_REDTBL + pin * 2;
            let high = low + 1;
            write_reg(&ioapic, low, 0x0000_8921 | u32::from(pin));
            write_reg(&ioapic, high, u32::from(pin) << 24);
        }
        for pin in 0..IOAPIC_REDIR_ENTRIES as u8 {
            let low = REG_REDTBL + pin * 2;
            let high = low + 1;
            assert_eq!(read_reg(&ioapic, low), 0x0000_8921 | u32::from(pin));
            assert_eq!(read_reg(&ioapic, high), u32::from(pin) << 24);
        }
    }

    #[test]
    fn interrupt_for_decodes_the_programmed_entry() {
        let ioapic = IoApic::new();
        // RTE[4]: vector 0x21, physical destination 0, edge, unmasked.
        write_reg(&ioapic, REG_REDTBL + 8, 0x21);
        write_reg(&ioapic, REG_REDTBL + 9, 0);

        let request = ioapic.interrupt_for(4).unwrap();
        assert_eq!(
            request,
            InterruptRequest {
                vector: 0x21,
                destination: 0,
                logical_destination: false,
                level_triggered: false,
            }
        );
        // Edge-triggered delivery never latches Remote-IRR.
        assert!(!ioapic.redirection(4).unwrap().remote_irr);
    }

    #[test]
    fn masked_or_unprogrammed_pins_do_not_inject() {
        let ioapic = IoApic::new();
        assert!(ioapic.interrupt_for(3).is_none());

        // Vector 0 with the mask cleared still drops.
        write_reg(&ioapic, REG_REDTBL + 6, 0);
        assert!(ioapic.interrupt_for(3).is_none());

        write_reg(&ioapic, REG_REDTBL + 6, 0x30 | (1 << 16));
        assert!(ioapic.interrupt_for(3).is_none());

        // Out-of-range pin.
        assert!(ioapic.interrupt_for(64).is_none());
    }

    #[test]
    fn level_triggered_delivery_latches_remote_irr_until_eoi() {
        let ioapic = IoApic::new();
        // RTE[9]: vector 0x51, level triggered.
        write_reg(&ioapic, REG_REDTBL + 18, 0x51 | (1 << 15));

        let request = ioapic.interrupt_for(9).unwrap();
        assert!(request.level_triggered);
        assert!(ioapic.redirection(9).unwrap().remote_irr);

        // Remote-IRR is visible in the low half but not writable by the guest.
        let low = read_reg(&ioapic, REG_REDTBL + 18);
        assert_ne!(low & (1 << 14), 0);
        write_reg(&ioapic, REG_REDTBL + 18, 0x51 | (1 << 15));
        assert!(ioapic.redirection(9).unwrap().remote_irr);

        // EOI for an unrelated vector leaves it latched.
        ioapic.mmio_write(IOEOI, 4, 0x52);
        assert!(ioapic.redirection(9).unwrap().remote_irr);

        // EOI with the matching vector clears it.
        ioapic.mmio_write(IOEOI, 4, 0x51);
        assert!(!ioapic.redirection(9).unwrap().remote_irr);
    }

    #[test]
    fn eoi_with_vector_zero_is_a_no_op() {
        let ioapic = IoApic::new();
        write_reg(&ioapic, REG_REDTBL, 0x40 | (1 << 15));
        // Pin 0: latch Remote-IRR, then EOI(0) must not clear it even though
        // freshly-reset entries have vector 0.
        ioapic.interrupt_for(0).unwrap();
        ioapic.mmio_write(IOEOI, 4, 0);
        assert!(ioapic.redirection(0).unwrap().remote_irr);
    }
}
