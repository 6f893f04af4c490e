use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::io::PortIoDevice;

/// COM1 base port; IRQ 4 by PC convention.
pub const COM1_BASE: u16 = 0x3F8;
/// Number of 16550 registers.
pub const SERIAL_REG_COUNT: u32 = 8;

/// Destination for bytes the guest transmits on the UART.
pub trait ConsoleSink: Send + Sync {
    fn write(&self, bytes: &[u8]);
}

const LSR_DATA_READY: u8 = 0x01;
// THR empty + transmitter idle: we sink bytes synchronously.
const LSR_TX_IDLE: u8 = 0x60;

const IER_RX_AVAIL: u8 = 0x01;

struct UartState {
    rx: VecDeque<u8>,
    ier: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    msr: u8,
    scr: u8,
    dll: u8,
    dlm: u8,
}

/// Minimal 16550 UART for the guest serial console.
///
/// Transmit is synchronous into the [`ConsoleSink`]; receive is a FIFO fed by
/// the console pump thread, which checks [`Serial16550::interrupt_pending`]
/// after pushing bytes and injects IRQ 4 when the UART is requesting service.
pub struct Serial16550 {
    state: Mutex<UartState>,
    sink: Arc<dyn ConsoleSink>,
}

impl Serial16550 {
    pub fn new(sink: Arc<dyn ConsoleSink>) -> Self {
        Self {
            state: Mutex::new(UartState {
                rx: VecDeque::new(),
                ier: 0,
                fcr: 0,
                lcr: 0x03,
                mcr: 0,
                msr: 0,
                scr: 0,
                dll: 1,
                dlm: 0,
            }),
            sink,
        }
    }

    /// Queues a byte for the guest to read from RBR.
    pub fn push_rx(&self, byte: u8) {
        self.state.lock().unwrap().rx.push_back(byte);
    }

    /// Whether the UART would assert its interrupt line (receive-data
    /// interrupt enabled and data pending).
    pub fn interrupt_pending(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.ier & IER_RX_AVAIL != 0 && !state.rx.is_empty()
    }

    fn dlab(state: &UartState) -> bool {
        state.lcr & 0x80 != 0
    }

    fn read_iir(state: &UartState) -> u8 {
        let fifo_bits = if state.fcr & 0x01 != 0 { 0xC0 } else { 0x00 };
        if state.ier & IER_RX_AVAIL != 0 && !state.rx.is_empty() {
            // Receive data available.
            fifo_bits | 0x04
        } else {
            // No interrupt pending.
            fifo_bits | 0x01
        }
    }
}

impl PortIoDevice for Serial16550 {
    fn pio_read(&self, offset: u16, _size: u8) -> u32 {
        let mut state = self.state.lock().unwrap();
        let value = match offset {
            0 if Self::dlab(&state) => state.dll,
            0 => state.rx.pop_front().unwrap_or(0),
            1 if Self::dlab(&state) => state.dlm,
            1 => state.ier,
            2 => Self::read_iir(&state),
            3 => state.lcr,
            4 => state.mcr,
            5 => {
                let mut lsr = LSR_TX_IDLE;
                if !state.rx.is_empty() {
                    lsr |= LSR_DATA_READY;
                }
                lsr
            }
            6 => state.msr,
            7 => state.scr,
            _ => 0,
        };
        u32::from(value)
    }

    fn pio_write(&self, offset: u16, _size: u8, value: u32) {
        let byte = value as u8;
        let mut state = self.state.lock().unwrap();
        match offset {
            0 if Self::dlab(&state) => state.dll = byte,
            0 => {
                drop(state);
                self.sink.write(&[byte]);
            }
            1 if Self::dlab(&state) => state.dlm = byte,
            1 => state.ier = byte,
            2 => state.fcr = byte,
            3 => state.lcr = byte,
            4 => state.mcr = byte,
            7 => state.scr = byte,
            _ => {}
        }
    }
}
