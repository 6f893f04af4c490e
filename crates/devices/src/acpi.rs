use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::io::PortIoDevice;

pub const PM1_STS_OFFSET: u16 = 0;
pub const PM1_EN_OFFSET: u16 = 2;
pub const PM1_CNT_OFFSET: u16 = 4;
pub const RESET_REG_OFFSET: u16 = 8;

/// Number of ports the PM block occupies (status/enable/control plus the
/// reset register at offset 8).
pub const ACPI_PM_REG_COUNT: u32 = 9;

/// Writing this sentinel to the reset register triggers a system reset.
pub const RESET_REG_VALUE: u8 = 0x06;

/// `SLP_TYP` code the FADT advertises for S5.
pub const SLP_TYP_S5: u16 = 5;

/// `SLP_EN` bit in `PM1_CNT`.
pub const SLP_EN: u16 = 1 << 13;

const SCI_EN: u16 = 1;

/// Power-management actions the platform supplies at construction.
///
/// `shutdown` and `reset` must be idempotent; the guest may hammer `PM1_CNT`
/// while the VM is already tearing down.
pub trait PowerHooks: Send + Sync {
    fn shutdown(&self);
    fn reset(&self);
    /// Raised when an enabled PM1 status bit becomes pending.
    fn sci(&self) {}
}

#[derive(Default)]
struct Pm1State {
    sts: u16,
    en: u16,
    cnt: u16,
}

/// ACPI fixed-hardware PM1 block plus reset register.
///
/// The guest initiates shutdown by writing `SLP_EN | (SLP_TYP << 10)` to
/// `PM1_CNT`; a hardware power button is not modelled (the FADT declares the
/// control-method button, and the controller asks the guest to power off via
/// the console instead).
pub struct AcpiPm {
    state: Mutex<Pm1State>,
    hooks: Arc<dyn PowerHooks>,
}

impl AcpiPm {
    pub fn new(hooks: Arc<dyn PowerHooks>) -> Self {
        Self { state: Mutex::new(Pm1State::default()), hooks }
    }

    /// Control-method power button: a deliberate no-op. Shutdown happens when
    /// the guest writes `SLP_EN` to `PM1_CNT`.
    pub fn power_button(&self) {
        info!("ACPI: power button pressed (no-op; guest shuts down via SLP_EN)");
    }

    /// Fires the SCI hook when an enabled status bit is pending.
    pub fn raise_sci(&self) {
        let pending = {
            let state = self.state.lock().unwrap();
            state.sts & state.en != 0
        };
        if pending {
            self.hooks.sci();
        }
    }
}

impl PortIoDevice for AcpiPm {
    fn pio_read(&self, offset: u16, size: u8) -> u32 {
        let state = self.state.lock().unwrap();
        match offset {
            PM1_STS_OFFSET => {
                if size == 4 {
                    u32::from(state.sts) | (u32::from(state.en) << 16)
                } else {
                    u32::from(state.sts)
                }
            }
            PM1_EN_OFFSET => u32::from(state.en),
            // SCI_EN always reads set: ACPI mode is permanently enabled.
            PM1_CNT_OFFSET => u32::from(state.cnt | SCI_EN),
            RESET_REG_OFFSET => 0,
            _ => 0,
        }
    }

    fn pio_write(&self, offset: u16, size: u8, value: u32) {
        enum Action {
            None,
            Shutdown,
            Reset,
        }

        let action = {
            let mut state = self.state.lock().unwrap();
            match offset {
                PM1_STS_OFFSET => {
                    // Write-1-to-clear; a 32-bit write also updates PM1_EN.
                    state.sts &= !(value as u16);
                    if size == 4 {
                        state.en = (value >> 16) as u16;
                    }
                    Action::None
                }
                PM1_EN_OFFSET => {
                    state.en = value as u16;
                    Action::None
                }
                PM1_CNT_OFFSET => {
                    state.cnt = value as u16 | SCI_EN;
                    if value as u16 & SLP_EN != 0 {
                        let slp_typ = (value as u16 >> 10) & 7;
                        debug!(slp_typ, "ACPI: SLP_EN written");
                        if slp_typ == SLP_TYP_S5 {
                            Action::Shutdown
                        } else {
                            Action::None
                        }
                    } else {
                        Action::None
                    }
                }
                RESET_REG_OFFSET => {
                    if (value & 0xFF) as u8 == RESET_REG_VALUE {
                        Action::Reset
                    } else {
                        Action::None
                    }
                }
                _ => Action::None,
            }
        };

        // Hooks run without the PM1 lock held; shutdown/reset re-enter the VM.
        match action {
            Action::None => {}
            Action::Shutdown => {
                info!("ACPI: S5 power off requested");
                self.hooks.shutdown();
            }
            Action::Reset => {
                info!("ACPI: system reset requested via reset register");
                self.hooks.reset();
            }
        }
    }
}
