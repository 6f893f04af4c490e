use vela_memory::{GuestMemory, GuestRam};
use vela_virtio::queue::{
    VirtQueue, VirtQueueConfig, VirtQueueError, VIRTQ_AVAIL_F_NO_INTERRUPT, VIRTQ_DESC_F_INDIRECT,
    VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
};

const DESC: u64 = 0x1000;
const AVAIL: u64 = 0x2000;
const USED: u64 = 0x3000;

fn write_desc(mem: &GuestRam, table: u64, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
    let base = table + u64::from(index) * 16;
    mem.write_u64_le(base, addr).unwrap();
    mem.write_u32_le(base + 8, len).unwrap();
    mem.write_u16_le(base + 12, flags).unwrap();
    mem.write_u16_le(base + 14, next).unwrap();
}

fn publish_avail(mem: &GuestRam, ring_slot: u16, head: u16, idx: u16) {
    mem.write_u16_le(AVAIL + 4 + u64::from(ring_slot) * 2, head).unwrap();
    mem.write_u16_le(AVAIL + 2, idx).unwrap();
}

fn queue(size: u16) -> VirtQueue {
    VirtQueue::new(VirtQueueConfig {
        size,
        desc_addr: DESC,
        avail_addr: AVAIL,
        used_addr: USED,
    })
    .unwrap()
}

#[test]
fn descriptor_chaining_is_parsed() {
    let mem = GuestRam::new(0x10000).unwrap();
    write_desc(&mem, DESC, 0, 0x4000, 16, VIRTQ_DESC_F_NEXT, 1);
    write_desc(&mem, DESC, 1, 0x5000, 8, VIRTQ_DESC_F_WRITE, 0);
    publish_avail(&mem, 0, 0, 1);

    let mut q = queue(4);
    let chain = q.pop_descriptor_chain(&mem).unwrap().unwrap();
    assert_eq!(chain.head_index(), 0);
    assert_eq!(chain.descriptors().len(), 2);
    assert_eq!(chain.descriptors()[0].addr, 0x4000);
    assert_eq!(chain.descriptors()[1].addr, 0x5000);
    assert!(chain.descriptors()[1].is_write_only());

    // Nothing further pending.
    assert!(q.pop_descriptor_chain(&mem).unwrap().is_none());
}

#[test]
fn queue_size_must_be_a_power_of_two() {
    for size in [0u16, 3, 6, 257] {
        let err = VirtQueue::new(VirtQueueConfig {
            size,
            desc_addr: DESC,
            avail_addr: AVAIL,
            used_addr: USED,
        })
        .unwrap_err();
        assert_eq!(err, VirtQueueError::InvalidSize(size));
    }
}

#[test]
fn indirect_descriptors_are_expanded() {
    let mem = GuestRam::new(0x10000).unwrap();
    let indirect = 0x8000;
    write_desc(&mem, DESC, 0, indirect, 32, VIRTQ_DESC_F_INDIRECT, 0);
    write_desc(&mem, indirect, 0, 0x4000, 4, VIRTQ_DESC_F_NEXT, 1);
    write_desc(&mem, indirect, 1, 0x5000, 4, VIRTQ_DESC_F_WRITE, 0);
    publish_avail(&mem, 0, 0, 1);

    let mut q = queue(4);
    let chain = q.pop_descriptor_chain(&mem).unwrap().unwrap();
    assert_eq!(chain.head_index(), 0);
    assert_eq!(chain.descriptors().len(), 2);
    assert_eq!(chain.descriptors()[0].addr, 0x4000);
    assert_eq!(chain.descriptors()[1].addr, 0x5000);
}

#[test]
fn nested_indirect_descriptors_are_rejected() {
    let mem = GuestRam::new(0x10000).unwrap();
    let indirect = 0x8000;
    write_desc(&mem, DESC, 0, indirect, 16, VIRTQ_DESC_F_INDIRECT, 0);
    write_desc(&mem, indirect, 0, 0x9000, 16, VIRTQ_DESC_F_INDIRECT, 0);
    publish_avail(&mem, 0, 0, 1);

    let mut q = queue(4);
    let err = q.pop_descriptor_chain(&mem).unwrap_err();
    assert_eq!(err, VirtQueueError::NestedIndirect);
}

#[test]
fn looping_chains_are_refused() {
    let mem = GuestRam::new(0x10000).unwrap();
    // 0 -> 1 -> 0 -> ...
    write_desc(&mem, DESC, 0, 0x4000, 4, VIRTQ_DESC_F_NEXT, 1);
    write_desc(&mem, DESC, 1, 0x5000, 4, VIRTQ_DESC_F_NEXT, 0);
    publish_avail(&mem, 0, 0, 1);

    let mut q = queue(4);
    let err = q.pop_descriptor_chain(&mem).unwrap_err();
    assert_eq!(err, VirtQueueError::ChainTooLong { head: 0 });
}

#[test]
fn ring_index_wraparound_uses_modulo_queue_size() {
    let mem = GuestRam::new(0x20000).unwrap();
    for i in 0..4u16 {
        write_desc(&mem, DESC, i, 0x4000 + u64::from(i) * 0x10, 1, 0, 0);
    }

    let mut q = queue(4);
    // Post 4 buffers (ring indices 0..3).
    for i in 0..4u16 {
        mem.write_u16_le(AVAIL + 4 + u64::from(i) * 2, i).unwrap();
    }
    mem.write_u16_le(AVAIL + 2, 4).unwrap();
    for _ in 0..4 {
        q.pop_descriptor_chain(&mem).unwrap().unwrap();
    }

    // Reuse descriptor 0; the head must be read from ring slot 0 after wrap.
    publish_avail(&mem, 0, 0, 5);
    let chain = q.pop_descriptor_chain(&mem).unwrap().unwrap();
    assert_eq!(chain.head_index(), 0);
    assert_eq!(q.last_avail_idx(), 5);
}

#[test]
fn add_used_publishes_entries_in_order() {
    let mem = GuestRam::new(0x10000).unwrap();
    let mut q = queue(4);

    assert!(q.add_used(&mem, 2, 100).unwrap());
    assert!(q.add_used(&mem, 3, 0).unwrap());

    assert_eq!(mem.read_u16_le(USED + 2).unwrap(), 2);
    assert_eq!(mem.read_u32_le(USED + 4).unwrap(), 2);
    assert_eq!(mem.read_u32_le(USED + 8).unwrap(), 100);
    assert_eq!(mem.read_u32_le(USED + 12).unwrap(), 3);
    assert_eq!(mem.read_u32_le(USED + 16).unwrap(), 0);
}

#[test]
fn no_interrupt_flag_suppresses_interrupts() {
    let mem = GuestRam::new(0x10000).unwrap();
    let mut q = queue(4);

    mem.write_u16_le(AVAIL, VIRTQ_AVAIL_F_NO_INTERRUPT).unwrap();
    assert!(!q.add_used(&mem, 0, 0).unwrap());
    mem.write_u16_le(AVAIL, 0).unwrap();
    assert!(q.add_used(&mem, 0, 0).unwrap());
}

#[test]
fn descriptor_parsing_never_panics_on_garbage_guest_memory() {
    struct XorShift64(u64);

    impl XorShift64 {
        fn next_u64(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    let mut rng = XorShift64(0x1234_5678_9abc_def0);
    for _ in 0..1_000 {
        let mem = GuestRam::new(0x20000).unwrap();
        let mut offset = 0;
        while offset < 0x20000 {
            mem.write_u64_le(offset, rng.next_u64()).unwrap();
            offset += 8;
        }

        let mut q = queue(8);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = q.pop_descriptor_chain(&mem);
        }));
        assert!(result.is_ok());
    }
}
