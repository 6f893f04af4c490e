//! End-to-end virtio-blk exercises through the MMIO transport.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use vela_devices::MmioDevice;
use vela_memory::{GuestMemory, GuestRam};
use vela_virtio::devices::blk::{
    FileDisk, MemDisk, VirtioBlk, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP,
    VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use vela_virtio::mmio::{
    IrqTrigger, VirtioMmio, INT_STATUS_USED_RING, STATUS_ACKNOWLEDGE, STATUS_DRIVER,
    STATUS_DRIVER_OK, STATUS_FEATURES_OK, VIRTIO_MMIO_MAGIC, VIRTIO_MMIO_VERSION,
};
use vela_virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

const DESC: u64 = 0x1000;
const AVAIL: u64 = 0x2000;
const USED: u64 = 0x3000;
const HDR: u64 = 0x4000;
const DATA: u64 = 0x5000;
const STATUS: u64 = 0x6000;

#[derive(Default)]
struct CountingIrq(AtomicU32);

impl IrqTrigger for CountingIrq {
    fn raise(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    mem: Arc<GuestRam>,
    mmio: VirtioMmio,
    irq: Arc<CountingIrq>,
}

fn reg_read(mmio: &VirtioMmio, offset: u64) -> u32 {
    mmio.mmio_read(offset, 4) as u32
}

fn reg_write(mmio: &VirtioMmio, offset: u64, value: u32) {
    mmio.mmio_write(offset, 4, u64::from(value));
}

fn harness(disk: MemDisk) -> Harness {
    let mem = Arc::new(GuestRam::new(0x20000).unwrap());
    let irq = Arc::new(CountingIrq::default());
    let mmio = VirtioMmio::new(
        Box::new(VirtioBlk::new(disk)),
        mem.clone() as Arc<dyn GuestMemory>,
        irq.clone(),
    );
    driver_init(&mmio);
    Harness { mem, mmio, irq }
}

/// The standard virtio 1.x driver bring-up dance.
fn driver_init(mmio: &VirtioMmio) {
    reg_write(mmio, 0x70, STATUS_ACKNOWLEDGE);
    reg_write(mmio, 0x70, STATUS_DRIVER);

    // Accept everything the device offers, both feature windows.
    reg_write(mmio, 0x14, 0);
    let low = reg_read(mmio, 0x10);
    reg_write(mmio, 0x14, 1);
    let high = reg_read(mmio, 0x10);
    reg_write(mmio, 0x24, 0);
    reg_write(mmio, 0x20, low);
    reg_write(mmio, 0x24, 1);
    reg_write(mmio, 0x20, high);
    reg_write(mmio, 0x70, STATUS_FEATURES_OK);

    reg_write(mmio, 0x30, 0); // QueueSel
    reg_write(mmio, 0x38, 4); // QueueNum
    reg_write(mmio, 0x80, DESC as u32);
    reg_write(mmio, 0x84, 0);
    reg_write(mmio, 0x90, AVAIL as u32);
    reg_write(mmio, 0x94, 0);
    reg_write(mmio, 0xA0, USED as u32);
    reg_write(mmio, 0xA4, 0);
    reg_write(mmio, 0x44, 1); // QueueReady

    reg_write(mmio, 0x70, STATUS_DRIVER_OK);
}

fn write_desc(mem: &GuestRam, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
    let base = DESC + u64::from(index) * 16;
    mem.write_u64_le(base, addr).unwrap();
    mem.write_u32_le(base + 8, len).unwrap();
    mem.write_u16_le(base + 12, flags).unwrap();
    mem.write_u16_le(base + 14, next).unwrap();
}

/// Builds the canonical 3-descriptor request chain and kicks the queue.
fn submit_request(h: &Harness, request_type: u32, sector: u64, data_len: u32, avail_idx: u16) {
    let mem = &h.mem;
    mem.write_u32_le(HDR, request_type).unwrap();
    mem.write_u32_le(HDR + 4, 0).unwrap();
    mem.write_u64_le(HDR + 8, sector).unwrap();

    let data_flags = if request_type == VIRTIO_BLK_T_IN {
        VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
    } else {
        VIRTQ_DESC_F_NEXT
    };
    write_desc(mem, 0, HDR, 16, VIRTQ_DESC_F_NEXT, 1);
    if data_len > 0 {
        write_desc(mem, 1, DATA, data_len, data_flags, 2);
        write_desc(mem, 2, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
    } else {
        write_desc(mem, 1, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
    }

    let slot = (avail_idx.wrapping_sub(1)) % 4;
    mem.write_u16_le(AVAIL + 4 + u64::from(slot) * 2, 0).unwrap();
    mem.write_u16_le(AVAIL + 2, avail_idx).unwrap();

    reg_write(&h.mmio, 0x50, 0); // QueueNotify
}

#[test]
fn transport_identity_registers() {
    let h = harness(MemDisk::new(4096));
    assert_eq!(reg_read(&h.mmio, 0x00), VIRTIO_MMIO_MAGIC);
    assert_eq!(reg_read(&h.mmio, 0x04), VIRTIO_MMIO_VERSION);
    assert_eq!(reg_read(&h.mmio, 0x08), 2);
    assert_eq!(reg_read(&h.mmio, 0x34), 256);
}

#[test]
fn config_space_reports_capacity_in_sectors() {
    let h = harness(MemDisk::new(8 * 512));
    assert_eq!(reg_read(&h.mmio, 0x100), 8);
    assert_eq!(reg_read(&h.mmio, 0x104), 0);
}

#[test]
fn read_request_fills_guest_buffer_and_raises_irq() {
    let h = harness(MemDisk::from_bytes(vec![0xAB; 4096]));
    submit_request(&h, VIRTIO_BLK_T_IN, 0, 512, 1);

    let data = h.mem.get_slice(DATA, 512).unwrap();
    assert!(data.iter().all(|&b| b == 0xAB));
    assert_eq!(h.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_OK);

    // One used entry: id = head 0, len = 512 data bytes + status byte.
    assert_eq!(h.mem.read_u16_le(USED + 2).unwrap(), 1);
    assert_eq!(h.mem.read_u32_le(USED + 4).unwrap(), 0);
    assert_eq!(h.mem.read_u32_le(USED + 8).unwrap(), 513);

    assert_eq!(h.irq.0.load(Ordering::SeqCst), 1);
    assert_eq!(reg_read(&h.mmio, 0x60) & INT_STATUS_USED_RING, INT_STATUS_USED_RING);
    reg_write(&h.mmio, 0x64, INT_STATUS_USED_RING);
    assert_eq!(reg_read(&h.mmio, 0x60), 0);
}

#[test]
fn write_request_persists_to_the_backend() {
    let h = harness(MemDisk::new(4096));
    h.mem.get_slice_mut(DATA, 512).unwrap().fill(0x5C);
    submit_request(&h, VIRTIO_BLK_T_OUT, 2, 512, 1);

    assert_eq!(h.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_OK);
    assert_eq!(h.mem.read_u16_le(USED + 2).unwrap(), 1);

    // Reading sector 2 back returns the pattern.
    submit_request(&h, VIRTIO_BLK_T_IN, 2, 512, 2);
    assert!(h.mem.get_slice(DATA, 512).unwrap().iter().all(|&b| b == 0x5C));
}

#[test]
fn unaligned_and_out_of_range_requests_fail_with_ioerr() {
    let h = harness(MemDisk::new(4096));

    // Non-sector-multiple length.
    submit_request(&h, VIRTIO_BLK_T_IN, 0, 100, 1);
    assert_eq!(h.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_IOERR);

    // Past the end of a 8-sector disk.
    submit_request(&h, VIRTIO_BLK_T_IN, 8, 512, 2);
    assert_eq!(h.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_IOERR);

    // The used ring still advanced for every request.
    assert_eq!(h.mem.read_u16_le(USED + 2).unwrap(), 2);
}

#[test]
fn flush_and_unknown_requests() {
    let h = harness(MemDisk::new(4096));
    submit_request(&h, VIRTIO_BLK_T_FLUSH, 0, 0, 1);
    assert_eq!(h.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_OK);

    submit_request(&h, 0x99, 0, 0, 2);
    assert_eq!(h.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_UNSUPP);
}

#[test]
fn notify_before_driver_ok_is_ignored() {
    let mem = Arc::new(GuestRam::new(0x20000).unwrap());
    let irq = Arc::new(CountingIrq::default());
    let mmio = VirtioMmio::new(
        Box::new(VirtioBlk::new(MemDisk::new(4096))),
        mem.clone() as Arc<dyn GuestMemory>,
        irq.clone(),
    );
    reg_write(&mmio, 0x50, 0);
    assert_eq!(irq.0.load(Ordering::SeqCst), 0);
    assert_eq!(mem.read_u16_le(USED + 2).unwrap(), 0);
}

#[test]
fn status_zero_resets_queues_and_interrupt_state() {
    let h = harness(MemDisk::from_bytes(vec![0xAB; 4096]));
    submit_request(&h, VIRTIO_BLK_T_IN, 0, 512, 1);
    assert_ne!(reg_read(&h.mmio, 0x60), 0);

    reg_write(&h.mmio, 0x70, 0);
    assert_eq!(reg_read(&h.mmio, 0x70), 0);
    assert_eq!(reg_read(&h.mmio, 0x60), 0);
    assert_eq!(reg_read(&h.mmio, 0x44), 0);

    // Kicks after reset do nothing until the driver re-initialises.
    reg_write(&h.mmio, 0x50, 0);
    assert_eq!(h.irq.0.load(Ordering::SeqCst), 1);
}

#[test]
fn file_disk_round_trips_through_the_device() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&[0xABu8; 4096]).unwrap();
    tmp.flush().unwrap();

    let disk = FileDisk::open(tmp.path()).unwrap();
    let mem = Arc::new(GuestRam::new(0x20000).unwrap());
    let irq = Arc::new(CountingIrq::default());
    let mmio = VirtioMmio::new(
        Box::new(VirtioBlk::new(disk)),
        mem.clone() as Arc<dyn GuestMemory>,
        irq.clone(),
    );
    driver_init(&mmio);
    let h = Harness { mem, mmio, irq };

    submit_request(&h, VIRTIO_BLK_T_IN, 4, 512, 1);
    assert_eq!(h.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_OK);
    assert!(h.mem.get_slice(DATA, 512).unwrap().iter().all(|&b| b == 0xAB));

    h.mem.get_slice_mut(DATA, 512).unwrap().fill(0x11);
    submit_request(&h, VIRTIO_BLK_T_OUT, 0, 512, 2);
    assert_eq!(h.mem.read_u8(STATUS).unwrap(), VIRTIO_BLK_S_OK);
    submit_request(&h, VIRTIO_BLK_T_FLUSH, 0, 0, 3);

    let contents = std::fs::read(tmp.path()).unwrap();
    assert!(contents[..512].iter().all(|&b| b == 0x11));
    assert!(contents[512..].iter().all(|&b| b == 0xAB));
}
