use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing::warn;

use crate::devices::{Chain, VirtioDeviceError, VirtioDeviceOps};
use crate::VIRTIO_F_VERSION_1;

pub const VIRTIO_DEVICE_ID_BLK: u32 = 2;

pub const VIRTIO_BLK_SECTOR_SIZE: u64 = 512;
pub const VIRTIO_BLK_QUEUE_MAX: u16 = 256;

pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

const REQUEST_HEADER_SIZE: usize = 16;
const DEVICE_ID_LEN: usize = 20;
const CONFIG_SIZE: usize = 24;

/// Random-access storage behind a virtio-blk device.
///
/// I/O failures surface to the guest as the `IOERR` status byte; they are
/// never fatal to the VM.
pub trait BlockBackend: Send {
    fn capacity_bytes(&self) -> u64;
    fn read_at(&mut self, offset: u64, dst: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, src: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
    fn device_id(&self) -> [u8; DEVICE_ID_LEN] {
        [0; DEVICE_ID_LEN]
    }
}

/// In-memory disk for tests and scratch volumes.
#[derive(Debug, Clone)]
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    pub fn new(size: usize) -> Self {
        Self { data: vec![0; size] }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl BlockBackend for MemDisk {
    fn capacity_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        let offset = usize::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let src = self
            .data
            .get(offset..offset.saturating_add(dst.len()))
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, src: &[u8]) -> io::Result<()> {
        let offset = usize::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let dst = self
            .data
            .get_mut(offset..offset.saturating_add(src.len()))
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn device_id(&self) -> [u8; DEVICE_ID_LEN] {
        let mut id = [0u8; DEVICE_ID_LEN];
        id[..11].copy_from_slice(b"vela-memdsk");
        id
    }
}

/// Raw disk image backed by a host file.
pub struct FileDisk {
    file: Mutex<File>,
    capacity: u64,
}

impl FileDisk {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity = file.metadata()?.len();
        Ok(Self { file: Mutex::new(file), capacity })
    }
}

impl BlockBackend for FileDisk {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(dst)
    }

    fn write_at(&mut self, offset: u64, src: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().unwrap().sync_data()
    }

    fn device_id(&self) -> [u8; DEVICE_ID_LEN] {
        let mut id = [0u8; DEVICE_ID_LEN];
        id[..12].copy_from_slice(b"vela-rawdisk");
        id
    }
}

/// Virtio block device.
///
/// Requests are `{header, data..., status}` chains: a 16-byte read-only
/// header, sector-aligned data segments, and a write-only status byte as the
/// final segment.
pub struct VirtioBlk<B: BlockBackend> {
    backend: B,
    features: u64,
}

impl<B: BlockBackend> VirtioBlk<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, features: 0 }
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn capacity_sectors(&self) -> u64 {
        self.backend.capacity_bytes() / VIRTIO_BLK_SECTOR_SIZE
    }

    /// Validates a transfer's shape and bounds; returns the byte offset.
    fn transfer_offset(&self, sector: u64, len: u64) -> Option<u64> {
        if len == 0 || len % VIRTIO_BLK_SECTOR_SIZE != 0 {
            return None;
        }
        let offset = sector.checked_mul(VIRTIO_BLK_SECTOR_SIZE)?;
        let end = offset.checked_add(len)?;
        if end > self.backend.capacity_bytes() {
            return None;
        }
        Some(offset)
    }

    fn handle_read(&mut self, sector: u64, data: &mut [&mut [u8]]) -> (u8, u32) {
        let total: u64 = data.iter().map(|s| s.len() as u64).sum();
        let Some(mut offset) = self.transfer_offset(sector, total) else {
            return (VIRTIO_BLK_S_IOERR, 0);
        };
        let mut written = 0u32;
        for seg in data {
            if let Err(err) = self.backend.read_at(offset, seg) {
                warn!(sector, %err, "virtio-blk read failed");
                return (VIRTIO_BLK_S_IOERR, written);
            }
            offset += seg.len() as u64;
            written += seg.len() as u32;
        }
        (VIRTIO_BLK_S_OK, written)
    }

    fn handle_write(&mut self, sector: u64, data: &[&[u8]]) -> u8 {
        let total: u64 = data.iter().map(|s| s.len() as u64).sum();
        let Some(mut offset) = self.transfer_offset(sector, total) else {
            return VIRTIO_BLK_S_IOERR;
        };
        for seg in data {
            if let Err(err) = self.backend.write_at(offset, seg) {
                warn!(sector, %err, "virtio-blk write failed");
                return VIRTIO_BLK_S_IOERR;
            }
            offset += seg.len() as u64;
        }
        VIRTIO_BLK_S_OK
    }

    fn handle_get_id(&mut self, data: &mut [&mut [u8]]) -> (u8, u32) {
        let id = self.backend.device_id();
        let mut remaining: &[u8] = &id;
        let mut written = 0u32;
        for seg in data {
            if remaining.is_empty() {
                break;
            }
            let take = seg.len().min(remaining.len());
            seg[..take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            written += take as u32;
        }
        (VIRTIO_BLK_S_OK, written)
    }
}

impl<B: BlockBackend> VirtioDeviceOps for VirtioBlk<B> {
    fn device_id(&self) -> u32 {
        VIRTIO_DEVICE_ID_BLK
    }

    fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1 | VIRTIO_BLK_F_FLUSH
    }

    fn queue_max(&self, _queue: u16) -> u16 {
        VIRTIO_BLK_QUEUE_MAX
    }

    fn negotiated_features(&mut self, features: u64) {
        self.features = features;
    }

    fn reset(&mut self) {
        self.features = 0;
    }

    fn process_chain(
        &mut self,
        _queue: u16,
        chain: &mut Chain<'_>,
    ) -> Result<u32, VirtioDeviceError> {
        // The status byte is the final write-only segment; without one there
        // is nowhere to report failure, so the chain is rejected outright.
        let Some(status_seg) = chain.writable.pop() else {
            return Err(VirtioDeviceError::BadChain);
        };
        if status_seg.is_empty() {
            return Err(VirtioDeviceError::BadChain);
        }

        let mut header = [0u8; REQUEST_HEADER_SIZE];
        if !chain.read_exact_at(0, &mut header) {
            status_seg[0] = VIRTIO_BLK_S_IOERR;
            return Ok(1);
        }
        let request_type = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(header[8..16].try_into().unwrap());

        let (status, data_written) = match request_type {
            VIRTIO_BLK_T_IN => self.handle_read(sector, &mut chain.writable),
            VIRTIO_BLK_T_OUT => {
                // Data follows the 16-byte header in the readable stream.
                let mut skip = REQUEST_HEADER_SIZE;
                let mut data: Vec<&[u8]> = Vec::with_capacity(chain.readable.len());
                for seg in &chain.readable {
                    if skip >= seg.len() {
                        skip -= seg.len();
                        continue;
                    }
                    data.push(&seg[skip..]);
                    skip = 0;
                }
                (self.handle_write(sector, &data), 0)
            }
            VIRTIO_BLK_T_FLUSH if self.features & VIRTIO_BLK_F_FLUSH == 0 => {
                (VIRTIO_BLK_S_UNSUPP, 0)
            }
            VIRTIO_BLK_T_FLUSH => match self.backend.flush() {
                Ok(()) => (VIRTIO_BLK_S_OK, 0),
                Err(err) => {
                    warn!(%err, "virtio-blk flush failed");
                    (VIRTIO_BLK_S_IOERR, 0)
                }
            },
            VIRTIO_BLK_T_GET_ID => self.handle_get_id(&mut chain.writable),
            other => {
                warn!(request_type = other, "virtio-blk: unsupported request");
                (VIRTIO_BLK_S_UNSUPP, 0)
            }
        };

        status_seg[0] = status;
        Ok(data_written + 1)
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        // struct virtio_blk_config prefix: capacity, size_max, seg_max,
        // geometry, blk_size. Only capacity and blk_size are meaningful here.
        let mut cfg = [0u8; CONFIG_SIZE];
        cfg[0..8].copy_from_slice(&self.capacity_sectors().to_le_bytes());
        cfg[12..16].copy_from_slice(&u32::from(VIRTIO_BLK_QUEUE_MAX - 2).to_le_bytes());
        cfg[20..24].copy_from_slice(&(VIRTIO_BLK_SECTOR_SIZE as u32).to_le_bytes());

        let Ok(start) = usize::try_from(offset) else {
            data.fill(0);
            return;
        };
        if start >= cfg.len() {
            data.fill(0);
            return;
        }
        let end = (start + data.len()).min(cfg.len());
        data[..end - start].copy_from_slice(&cfg[start..end]);
        if end - start < data.len() {
            data[end - start..].fill(0);
        }
    }
}
