//! Virtio transport and device models.
//!
//! [`queue`] implements the split virtqueue (descriptor table, available
//! ring, used ring). [`mmio`] implements the virtio-mmio v2 transport
//! register layout and bridges notifies into [`devices::VirtioDeviceOps`]
//! implementations. Device bodies live under [`devices`].

pub mod devices;
pub mod mmio;
pub mod queue;

/// VIRTIO_F_VERSION_1: the device is a virtio 1.x (non-legacy) device.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
