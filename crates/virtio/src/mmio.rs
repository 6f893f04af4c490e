use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};
use vela_devices::MmioDevice;
use vela_memory::GuestMemory;

use crate::devices::{Chain, VirtioDeviceOps};
use crate::queue::{VirtQueue, VirtQueueConfig};

/// `'virt'` in little-endian.
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;
pub const VIRTIO_MMIO_VERSION: u32 = 2;
pub const VIRTIO_MMIO_VENDOR_ID: u32 = 0x414C_4556;

/// Bytes of MMIO each virtio-mmio window decodes (registers + config space).
pub const VIRTIO_MMIO_SIZE: u64 = 0x200;

pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;
pub const STATUS_DEVICE_NEEDS_RESET: u32 = 0x40;
pub const STATUS_FAILED: u32 = 0x80;

/// Used-ring update bit in `InterruptStatus`.
pub const INT_STATUS_USED_RING: u32 = 1;
/// Configuration-change bit in `InterruptStatus`.
pub const INT_STATUS_CONFIG: u32 = 2;

const REG_MAGIC: u64 = 0x00;
const REG_VERSION: u64 = 0x04;
const REG_DEVICE_ID: u64 = 0x08;
const REG_VENDOR_ID: u64 = 0x0C;
const REG_DEVICE_FEATURES: u64 = 0x10;
const REG_DEVICE_FEATURES_SEL: u64 = 0x14;
const REG_DRIVER_FEATURES: u64 = 0x20;
const REG_DRIVER_FEATURES_SEL: u64 = 0x24;
const REG_QUEUE_SEL: u64 = 0x30;
const REG_QUEUE_NUM_MAX: u64 = 0x34;
const REG_QUEUE_NUM: u64 = 0x38;
const REG_QUEUE_READY: u64 = 0x44;
const REG_QUEUE_NOTIFY: u64 = 0x50;
const REG_INTERRUPT_STATUS: u64 = 0x60;
const REG_INTERRUPT_ACK: u64 = 0x64;
const REG_STATUS: u64 = 0x70;
const REG_QUEUE_DESC_LOW: u64 = 0x80;
const REG_QUEUE_DESC_HIGH: u64 = 0x84;
const REG_QUEUE_DRIVER_LOW: u64 = 0x90;
const REG_QUEUE_DRIVER_HIGH: u64 = 0x94;
const REG_QUEUE_DEVICE_LOW: u64 = 0xA0;
const REG_QUEUE_DEVICE_HIGH: u64 = 0xA4;
const REG_CONFIG: u64 = 0x100;

/// Raises the device's interrupt line towards the guest.
pub trait IrqTrigger: Send + Sync {
    fn raise(&self);
}

#[derive(Debug, Default, Clone, Copy)]
struct QueueSlot {
    size: u16,
    ready: bool,
    desc_gpa: u64,
    driver_gpa: u64,
    device_gpa: u64,
}

struct Transport {
    device: Box<dyn VirtioDeviceOps>,
    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u64,
    queue_sel: u32,
    slots: Vec<QueueSlot>,
    queues: Vec<Option<VirtQueue>>,
    status: u32,
    interrupt_status: u32,
}

impl Transport {
    fn slot(&mut self) -> Option<&mut QueueSlot> {
        self.slots.get_mut(self.queue_sel as usize)
    }
}

/// Virtio-mmio v2 transport bridging one device to a guest MMIO window.
///
/// Queue processing runs synchronously on the notifying vCPU thread; the
/// transport mutex is the device's serialisation point.
pub struct VirtioMmio {
    mem: Arc<dyn GuestMemory>,
    irq: Arc<dyn IrqTrigger>,
    inner: Mutex<Transport>,
}

impl VirtioMmio {
    pub fn new(
        device: Box<dyn VirtioDeviceOps>,
        mem: Arc<dyn GuestMemory>,
        irq: Arc<dyn IrqTrigger>,
    ) -> Self {
        let queues = usize::from(device.num_queues());
        Self {
            mem,
            irq,
            inner: Mutex::new(Transport {
                device,
                device_features_sel: 0,
                driver_features_sel: 0,
                driver_features: 0,
                queue_sel: 0,
                slots: vec![QueueSlot::default(); queues],
                queues: (0..queues).map(|_| None).collect(),
                status: 0,
                interrupt_status: 0,
            }),
        }
    }

    /// Current `InterruptStatus` value, for tests and platform plumbing.
    pub fn interrupt_status(&self) -> u32 {
        self.inner.lock().unwrap().interrupt_status
    }

    fn reset(inner: &mut Transport) {
        debug!("virtio: device reset");
        inner.device.reset();
        inner.device_features_sel = 0;
        inner.driver_features_sel = 0;
        inner.driver_features = 0;
        inner.queue_sel = 0;
        for slot in &mut inner.slots {
            *slot = QueueSlot::default();
        }
        for queue in &mut inner.queues {
            *queue = None;
        }
        inner.status = 0;
        inner.interrupt_status = 0;
    }

    fn queue_ready_write(inner: &mut Transport, value: u32) {
        let sel = inner.queue_sel as usize;
        if sel >= inner.slots.len() {
            return;
        }
        if value == 0 {
            inner.slots[sel].ready = false;
            inner.queues[sel] = None;
            return;
        }
        let slot = inner.slots[sel];
        let config = VirtQueueConfig {
            size: slot.size,
            desc_addr: slot.desc_gpa,
            avail_addr: slot.driver_gpa,
            used_addr: slot.device_gpa,
        };
        let max = inner.device.queue_max(sel as u16);
        if config.size > max {
            warn!(queue = sel, size = config.size, max, "queue size above QueueNumMax");
            return;
        }
        match VirtQueue::new(config) {
            Ok(queue) => {
                inner.slots[sel].ready = true;
                inner.queues[sel] = Some(queue);
            }
            Err(err) => warn!(queue = sel, %err, "rejecting QueueReady"),
        }
    }

    /// Walks `queue` until the available ring is drained. Returns `true` when
    /// the guest should receive a used-ring interrupt.
    fn process_queue(&self, inner: &mut Transport, queue_index: u16) -> bool {
        if inner.status & STATUS_FAILED != 0 {
            return false;
        }
        if inner.status & STATUS_DRIVER_OK == 0 {
            trace!(queue = queue_index, "notify before DRIVER_OK ignored");
            return false;
        }
        let idx = usize::from(queue_index);
        let mut irq_needed = false;
        loop {
            let Some(queue) = inner.queues.get_mut(idx).and_then(Option::as_mut) else {
                break;
            };
            let chain = match queue.pop_descriptor_chain(&*self.mem) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(err) => {
                    warn!(queue = queue_index, %err, "bad descriptor chain");
                    break;
                }
            };

            let mut readable = Vec::new();
            let mut writable = Vec::new();
            let mut resolved = true;
            for desc in chain.descriptors() {
                if desc.len == 0 {
                    continue;
                }
                let len = desc.len as usize;
                if desc.is_write_only() {
                    match self.mem.get_slice_mut(desc.addr, len) {
                        Ok(slice) => writable.push(slice),
                        Err(err) => {
                            warn!(%err, "descriptor outside guest RAM");
                            resolved = false;
                            break;
                        }
                    }
                } else {
                    match self.mem.get_slice(desc.addr, len) {
                        Ok(slice) => readable.push(slice),
                        Err(err) => {
                            warn!(%err, "descriptor outside guest RAM");
                            resolved = false;
                            break;
                        }
                    }
                }
            }

            let used_len = if resolved {
                let mut chain_view = Chain { readable, writable };
                match inner.device.process_chain(queue_index, &mut chain_view) {
                    Ok(len) => len,
                    Err(err) => {
                        warn!(queue = queue_index, %err, "device rejected chain");
                        0
                    }
                }
            } else {
                0
            };

            let queue = inner.queues[idx].as_mut().expect("queue vanished during processing");
            match queue.add_used(&*self.mem, chain.head_index(), used_len) {
                Ok(wants_irq) => irq_needed |= wants_irq,
                Err(err) => {
                    warn!(queue = queue_index, %err, "failed to publish used entry");
                    break;
                }
            }
        }
        irq_needed
    }

    fn set_status(inner: &mut Transport, value: u32) {
        if value == 0 {
            Self::reset(inner);
            return;
        }
        let newly_set = value & !inner.status;
        if newly_set & STATUS_FEATURES_OK != 0 {
            let negotiated = inner.device.device_features() & inner.driver_features;
            debug!(features = negotiated, "virtio: features negotiated");
            inner.device.negotiated_features(negotiated);
        }
        if newly_set & STATUS_FAILED != 0 {
            warn!("virtio: driver reported FAILED");
        }
        inner.status |= value;
    }
}

impl MmioDevice for VirtioMmio {
    fn mmio_read(&self, offset: u64, size: u8) -> u64 {
        let inner = &mut *self.inner.lock().unwrap();
        if offset >= REG_CONFIG {
            let mut buf = [0u8; 8];
            let len = usize::from(size).min(8);
            inner.device.read_config(offset - REG_CONFIG, &mut buf[..len]);
            return u64::from_le_bytes(buf);
        }
        let value = match offset {
            REG_MAGIC => VIRTIO_MMIO_MAGIC,
            REG_VERSION => VIRTIO_MMIO_VERSION,
            REG_DEVICE_ID => inner.device.device_id(),
            REG_VENDOR_ID => VIRTIO_MMIO_VENDOR_ID,
            REG_DEVICE_FEATURES => {
                let features = inner.device.device_features();
                match inner.device_features_sel {
                    0 => features as u32,
                    1 => (features >> 32) as u32,
                    _ => 0,
                }
            }
            REG_QUEUE_NUM_MAX => {
                let sel = inner.queue_sel as usize;
                if sel < inner.slots.len() {
                    u32::from(inner.device.queue_max(sel as u16))
                } else {
                    0
                }
            }
            REG_QUEUE_READY => {
                u32::from(inner.slot().map(|slot| slot.ready).unwrap_or(false))
            }
            REG_INTERRUPT_STATUS => inner.interrupt_status,
            REG_STATUS => inner.status,
            _ => 0,
        };
        u64::from(value)
    }

    fn mmio_write(&self, offset: u64, size: u8, value: u64) {
        let mut raise_irq = false;
        {
            let inner = &mut *self.inner.lock().unwrap();
            if offset >= REG_CONFIG {
                let bytes = value.to_le_bytes();
                let len = usize::from(size).min(8);
                inner.device.write_config(offset - REG_CONFIG, &bytes[..len]);
                return;
            }
            let value = value as u32;
            match offset {
                REG_DEVICE_FEATURES_SEL => inner.device_features_sel = value,
                REG_DRIVER_FEATURES_SEL => inner.driver_features_sel = value,
                REG_DRIVER_FEATURES => match inner.driver_features_sel {
                    0 => {
                        inner.driver_features =
                            (inner.driver_features & !0xFFFF_FFFF) | u64::from(value);
                    }
                    1 => {
                        inner.driver_features = (inner.driver_features & 0xFFFF_FFFF)
                            | (u64::from(value) << 32);
                    }
                    _ => {}
                },
                REG_QUEUE_SEL => inner.queue_sel = value,
                REG_QUEUE_NUM => {
                    if let Some(slot) = inner.slot() {
                        slot.size = value as u16;
                    }
                }
                REG_QUEUE_READY => Self::queue_ready_write(inner, value),
                REG_QUEUE_NOTIFY => {
                    if self.process_queue(inner, value as u16) {
                        inner.interrupt_status |= INT_STATUS_USED_RING;
                        raise_irq = true;
                    }
                }
                REG_INTERRUPT_ACK => inner.interrupt_status &= !value,
                REG_STATUS => Self::set_status(inner, value),
                REG_QUEUE_DESC_LOW => {
                    if let Some(slot) = inner.slot() {
                        slot.desc_gpa = (slot.desc_gpa & !0xFFFF_FFFF) | u64::from(value);
                    }
                }
                REG_QUEUE_DESC_HIGH => {
                    if let Some(slot) = inner.slot() {
                        slot.desc_gpa =
                            (slot.desc_gpa & 0xFFFF_FFFF) | (u64::from(value) << 32);
                    }
                }
                REG_QUEUE_DRIVER_LOW => {
                    if let Some(slot) = inner.slot() {
                        slot.driver_gpa = (slot.driver_gpa & !0xFFFF_FFFF) | u64::from(value);
                    }
                }
                REG_QUEUE_DRIVER_HIGH => {
                    if let Some(slot) = inner.slot() {
                        slot.driver_gpa =
                            (slot.driver_gpa & 0xFFFF_FFFF) | (u64::from(value) << 32);
                    }
                }
                REG_QUEUE_DEVICE_LOW => {
                    if let Some(slot) = inner.slot() {
                        slot.device_gpa = (slot.device_gpa & !0xFFFF_FFFF) | u64::from(value);
                    }
                }
                REG_QUEUE_DEVICE_HIGH => {
                    if let Some(slot) = inner.slot() {
                        slot.device_gpa =
                            (slot.device_gpa & 0xFFFF_FFFF) | (u64::from(value) << 32);
                    }
                }
                _ => {}
            }
        }
        // The IRQ callback takes the IOAPIC lock; keep it outside ours.
        if raise_irq {
            self.irq.raise();
        }
    }
}
