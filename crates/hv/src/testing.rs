//! Deterministic in-process hypervisor double.
//!
//! [`FakeHypervisor`] plays back per-vCPU exit scripts and records everything
//! the VMM asks of it (mappings, register loads, interrupt requests, exit
//! completions). Machine-level tests drive the whole vCPU loop against it
//! without any platform virtualization service.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::{
    Direction, HostRegion, HvError, Hypervisor, InterruptRequest, MapFlags, MmioAccess, PioAccess,
    Register, Vcpu, VcpuExit, VmPartition,
};

/// Script-driven [`Hypervisor`] implementation.
#[derive(Default)]
pub struct FakeHypervisor {
    unavailable: bool,
    scripts: Mutex<HashMap<u32, VecDeque<VcpuExit>>>,
    partition: Mutex<Option<Arc<FakePartition>>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hypervisor that reports the platform service as missing.
    pub fn unavailable() -> Self {
        Self { unavailable: true, ..Self::default() }
    }

    /// Queues an exit for `vp_index`, delivered in FIFO order by `run`.
    /// Once the script is exhausted, `run` returns [`VcpuExit::Halt`].
    pub fn queue_exit(&self, vp_index: u32, exit: VcpuExit) {
        self.scripts.lock().unwrap().entry(vp_index).or_default().push_back(exit);
    }

    /// The partition created by the last `create_vm` call, for assertions.
    pub fn partition(&self) -> Option<Arc<FakePartition>> {
        self.partition.lock().unwrap().clone()
    }
}

impl Hypervisor for FakeHypervisor {
    fn name(&self) -> &str {
        "fake"
    }

    fn create_vm(&self, cpu_count: u32) -> Result<Arc<dyn VmPartition>, HvError> {
        if self.unavailable {
            return Err(HvError::Unavailable);
        }
        let scripts = std::mem::take(&mut *self.scripts.lock().unwrap());
        let partition = Arc::new(FakePartition {
            cpu_count,
            scripts: Mutex::new(scripts),
            mappings: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            canceled: Mutex::new(HashMap::new()),
            recorder: Arc::new(Recorder::default()),
        });
        *self.partition.lock().unwrap() = Some(partition.clone());
        Ok(partition)
    }
}

/// Recorded `map_memory` call.
#[derive(Debug, Clone, Copy)]
pub struct RecordedMapping {
    pub gpa: u64,
    pub len: u64,
    pub flags: MapFlags,
}

#[derive(Default)]
struct Recorder {
    registers: Mutex<HashMap<u32, Vec<(Register, u64)>>>,
    completed_mmio: Mutex<Vec<MmioAccess>>,
    completed_pio: Mutex<Vec<PioAccess>>,
}

pub struct FakePartition {
    cpu_count: u32,
    scripts: Mutex<HashMap<u32, VecDeque<VcpuExit>>>,
    mappings: Mutex<Vec<RecordedMapping>>,
    interrupts: Mutex<Vec<InterruptRequest>>,
    cancels: Mutex<Vec<u32>>,
    canceled: Mutex<HashMap<u32, Arc<AtomicBool>>>,
    recorder: Arc<Recorder>,
}

impl FakePartition {
    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn mappings(&self) -> Vec<RecordedMapping> {
        self.mappings.lock().unwrap().clone()
    }

    pub fn interrupts(&self) -> Vec<InterruptRequest> {
        self.interrupts.lock().unwrap().clone()
    }

    /// vp indexes passed to `cancel_run`, in call order.
    pub fn cancels(&self) -> Vec<u32> {
        self.cancels.lock().unwrap().clone()
    }

    pub fn registers(&self, vp_index: u32) -> Vec<(Register, u64)> {
        self.recorder.registers.lock().unwrap().get(&vp_index).cloned().unwrap_or_default()
    }

    /// MMIO read accesses the vCPU loop completed, with their final values.
    pub fn completed_mmio(&self) -> Vec<MmioAccess> {
        self.recorder.completed_mmio.lock().unwrap().clone()
    }

    /// PIO `IN` accesses the vCPU loop completed, with their final values.
    pub fn completed_pio(&self) -> Vec<PioAccess> {
        self.recorder.completed_pio.lock().unwrap().clone()
    }

    fn cancel_flag(&self, vp_index: u32) -> Arc<AtomicBool> {
        self.canceled
            .lock()
            .unwrap()
            .entry(vp_index)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }
}

impl VmPartition for FakePartition {
    fn map_memory(&self, gpa: u64, region: HostRegion, flags: MapFlags) -> Result<(), HvError> {
        self.mappings.lock().unwrap().push(RecordedMapping { gpa, len: region.len, flags });
        Ok(())
    }

    fn create_vcpu(&self, vp_index: u32) -> Result<Box<dyn Vcpu>, HvError> {
        if vp_index >= self.cpu_count {
            return Err(HvError::Internal(format!("vp_index {vp_index} out of range")));
        }
        let script = self.scripts.lock().unwrap().remove(&vp_index).unwrap_or_default();
        Ok(Box::new(FakeVcpu {
            vp_index,
            script,
            canceled: self.cancel_flag(vp_index),
            recorder: self.recorder.clone(),
        }))
    }

    fn request_interrupt(&self, request: &InterruptRequest) -> Result<(), HvError> {
        self.interrupts.lock().unwrap().push(*request);
        Ok(())
    }

    fn cancel_run(&self, vp_index: u32) {
        self.cancels.lock().unwrap().push(vp_index);
        self.cancel_flag(vp_index).store(true, Ordering::SeqCst);
    }
}

struct FakeVcpu {
    vp_index: u32,
    script: VecDeque<VcpuExit>,
    canceled: Arc<AtomicBool>,
    recorder: Arc<Recorder>,
}

impl Vcpu for FakeVcpu {
    fn vp_index(&self) -> u32 {
        self.vp_index
    }

    fn set_registers(&mut self, regs: &[(Register, u64)]) -> Result<(), HvError> {
        self.recorder
            .registers
            .lock()
            .unwrap()
            .entry(self.vp_index)
            .or_default()
            .extend_from_slice(regs);
        Ok(())
    }

    fn run(&mut self) -> Result<VcpuExit, HvError> {
        if self.canceled.load(Ordering::SeqCst) {
            return Ok(VcpuExit::Canceled);
        }
        Ok(self.script.pop_front().unwrap_or(VcpuExit::Halt))
    }

    fn complete_mmio(&mut self, access: &MmioAccess) -> Result<(), HvError> {
        if access.direction == Direction::Read {
            self.recorder.completed_mmio.lock().unwrap().push(*access);
        }
        Ok(())
    }

    fn complete_pio(&mut self, access: &PioAccess) -> Result<(), HvError> {
        if access.direction == Direction::Read {
            self.recorder.completed_pio.lock().unwrap().push(*access);
        }
        Ok(())
    }
}
