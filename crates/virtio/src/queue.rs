use std::sync::atomic::{fence, Ordering};

use thiserror::Error;
use vela_memory::{GuestMemory, GuestMemoryError};

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Driver hint in `avail.flags`: skip the used-ring interrupt.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Bytes per descriptor table entry.
const DESC_ENTRY_SIZE: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VirtQueueError {
    #[error("queue size {0} is not a non-zero power of two")]
    InvalidSize(u16),
    #[error("descriptor index {index} out of range for queue of {size}")]
    InvalidDescriptorIndex { index: u16, size: u16 },
    #[error("descriptor chain starting at {head} exceeds the queue size")]
    ChainTooLong { head: u16 },
    #[error("indirect descriptor table inside an indirect table")]
    NestedIndirect,
    #[error("indirect descriptor table length {0} is not a non-zero multiple of 16")]
    InvalidIndirectLength(u32),
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
}

/// A descriptor table entry, as laid out in guest memory (virtio 1.x).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }

    fn read(
        mem: &dyn GuestMemory,
        table: u64,
        index: u16,
    ) -> Result<Self, VirtQueueError> {
        let base = table
            .checked_add(u64::from(index) * DESC_ENTRY_SIZE)
            .ok_or(GuestMemoryError::OutOfBounds { gpa: table, len: 16 })?;
        Ok(Self {
            addr: mem.read_u64_le(base)?,
            len: mem.read_u32_le(base + 8)?,
            flags: mem.read_u16_le(base + 12)?,
            next: mem.read_u16_le(base + 14)?,
        })
    }
}

/// A chain popped from the available ring, fully expanded (including one
/// level of indirect descriptors).
#[derive(Debug, Clone)]
pub struct DescriptorChain {
    head: u16,
    descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    /// Index of the head descriptor; written back into the used ring.
    pub fn head_index(&self) -> u16 {
        self.head
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }
}

/// Guest addresses of a queue's three rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtQueueConfig {
    pub size: u16,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
}

/// Device-side view of one split virtqueue.
///
/// `last_avail_idx` is the device's monotonic cursor into the available ring;
/// it wraps modulo 2^16 while ring slots are addressed modulo the queue size.
#[derive(Debug)]
pub struct VirtQueue {
    config: VirtQueueConfig,
    last_avail_idx: u16,
    used_idx: u16,
}

impl VirtQueue {
    pub fn new(config: VirtQueueConfig) -> Result<Self, VirtQueueError> {
        if config.size == 0 || !config.size.is_power_of_two() {
            return Err(VirtQueueError::InvalidSize(config.size));
        }
        Ok(Self { config, last_avail_idx: 0, used_idx: 0 })
    }

    pub fn size(&self) -> u16 {
        self.config.size
    }

    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx
    }

    pub fn used_idx(&self) -> u16 {
        self.used_idx
    }

    /// Pops the next pending descriptor chain, or `None` when the device has
    /// caught up with the driver.
    pub fn pop_descriptor_chain(
        &mut self,
        mem: &dyn GuestMemory,
    ) -> Result<Option<DescriptorChain>, VirtQueueError> {
        let avail_idx = mem.read_u16_le(self.config.avail_addr + 2)?;
        if avail_idx == self.last_avail_idx {
            return Ok(None);
        }
        // The driver published avail.idx; make sure the ring contents it
        // wrote before that store are visible.
        fence(Ordering::Acquire);

        let slot = u64::from(self.last_avail_idx % self.config.size);
        let head = mem.read_u16_le(self.config.avail_addr + 4 + slot * 2)?;
        let descriptors = self.walk_chain(mem, head)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(DescriptorChain { head, descriptors }))
    }

    fn walk_chain(
        &self,
        mem: &dyn GuestMemory,
        head: u16,
    ) -> Result<Vec<Descriptor>, VirtQueueError> {
        let size = self.config.size;
        if head >= size {
            return Err(VirtQueueError::InvalidDescriptorIndex { index: head, size });
        }

        let mut descriptors = Vec::new();
        let mut index = head;
        loop {
            // A chain longer than the queue must contain a loop.
            if descriptors.len() >= usize::from(size) {
                return Err(VirtQueueError::ChainTooLong { head });
            }
            let desc = Descriptor::read(mem, self.config.desc_addr, index)?;
            if desc.is_indirect() {
                self.expand_indirect(mem, &desc, head, &mut descriptors)?;
                break;
            }
            let has_next = desc.has_next();
            let next = desc.next;
            descriptors.push(desc);
            if !has_next {
                break;
            }
            if next >= size {
                return Err(VirtQueueError::InvalidDescriptorIndex { index: next, size });
            }
            index = next;
        }
        Ok(descriptors)
    }

    fn expand_indirect(
        &self,
        mem: &dyn GuestMemory,
        indirect: &Descriptor,
        head: u16,
        out: &mut Vec<Descriptor>,
    ) -> Result<(), VirtQueueError> {
        if indirect.len == 0 || indirect.len % DESC_ENTRY_SIZE as u32 != 0 {
            return Err(VirtQueueError::InvalidIndirectLength(indirect.len));
        }
        let table_len = (indirect.len / DESC_ENTRY_SIZE as u32) as u16;
        let mut index = 0u16;
        loop {
            if out.len() >= usize::from(self.config.size) {
                return Err(VirtQueueError::ChainTooLong { head });
            }
            if index >= table_len {
                return Err(VirtQueueError::InvalidDescriptorIndex {
                    index,
                    size: table_len,
                });
            }
            let desc = Descriptor::read(mem, indirect.addr, index)?;
            if desc.is_indirect() {
                return Err(VirtQueueError::NestedIndirect);
            }
            let has_next = desc.has_next();
            let next = desc.next;
            out.push(desc);
            if !has_next {
                return Ok(());
            }
            index = next;
        }
    }

    /// Publishes a completed chain to the used ring.
    ///
    /// Returns `true` when the driver wants a used-ring interrupt for this
    /// entry (i.e. `VIRTQ_AVAIL_F_NO_INTERRUPT` is clear).
    pub fn add_used(
        &mut self,
        mem: &dyn GuestMemory,
        head: u16,
        len: u32,
    ) -> Result<bool, VirtQueueError> {
        let slot = u64::from(self.used_idx % self.config.size);
        let entry = self.config.used_addr + 4 + slot * 8;
        mem.write_u32_le(entry, u32::from(head))?;
        mem.write_u32_le(entry + 4, len)?;

        // Publish the entry before the index so the driver never observes an
        // incremented used.idx with a stale ring slot.
        fence(Ordering::Release);
        self.used_idx = self.used_idx.wrapping_add(1);
        mem.write_u16_le(self.config.used_addr + 2, self.used_idx)?;

        let avail_flags = mem.read_u16_le(self.config.avail_addr)?;
        Ok(avail_flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0)
    }
}
