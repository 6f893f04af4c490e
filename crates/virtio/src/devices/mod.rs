use thiserror::Error;

pub mod blk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VirtioDeviceError {
    /// The descriptor chain does not have the layout the device expects.
    #[error("malformed descriptor chain")]
    BadChain,
    #[error("unsupported request")]
    Unsupported,
}

/// One descriptor chain, resolved to host memory.
///
/// `readable` holds the driver-filled (device-readable) segments and
/// `writable` the device-writable segments, each in chain order. The slices
/// borrow guest RAM directly, so devices consume them on the notifying vCPU
/// thread and do not retain them.
pub struct Chain<'m> {
    pub readable: Vec<&'m [u8]>,
    pub writable: Vec<&'m mut [u8]>,
}

impl Chain<'_> {
    pub fn readable_len(&self) -> usize {
        self.readable.iter().map(|s| s.len()).sum()
    }

    pub fn writable_len(&self) -> usize {
        self.writable.iter().map(|s| s.len()).sum()
    }

    /// Copies `out.len()` bytes from the readable stream starting at
    /// `offset`. Returns `false` when the stream is too short.
    pub fn read_exact_at(&self, mut offset: usize, out: &mut [u8]) -> bool {
        let mut written = 0;
        for seg in &self.readable {
            if offset >= seg.len() {
                offset -= seg.len();
                continue;
            }
            let avail = &seg[offset..];
            let take = avail.len().min(out.len() - written);
            out[written..written + take].copy_from_slice(&avail[..take]);
            written += take;
            offset = 0;
            if written == out.len() {
                return true;
            }
        }
        written == out.len()
    }
}

/// Device side of the virtio-mmio bridge.
///
/// The transport handles feature windows, queue configuration, the status
/// state machine, and interrupt status; implementations only see fully
/// resolved descriptor chains and their configuration space.
pub trait VirtioDeviceOps: Send {
    /// Virtio device type (1 = net, 2 = block, ...).
    fn device_id(&self) -> u32;

    /// Feature bits offered to the driver.
    fn device_features(&self) -> u64;

    fn num_queues(&self) -> u16 {
        1
    }

    /// Maximum queue size for `queue`, reported through `QueueNumMax`.
    fn queue_max(&self, queue: u16) -> u16;

    /// Called once the driver sets `FEATURES_OK`, with the acknowledged
    /// subset (`device_features & driver_features`).
    fn negotiated_features(&mut self, _features: u64) {}

    /// Processes one descriptor chain from `queue`.
    ///
    /// Returns the number of bytes written to the chain's writable segments,
    /// recorded in the used ring entry.
    fn process_chain(
        &mut self,
        queue: u16,
        chain: &mut Chain<'_>,
    ) -> Result<u32, VirtioDeviceError>;

    /// Reads device-specific configuration space (offset relative to `0x100`).
    fn read_config(&self, offset: u64, data: &mut [u8]);

    /// Writes device-specific configuration space.
    fn write_config(&mut self, _offset: u64, _data: &[u8]) {}

    /// Returns the device to its power-on state (driver wrote status 0).
    fn reset(&mut self) {}
}
