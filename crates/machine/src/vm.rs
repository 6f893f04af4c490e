use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info};

use vela_devices::{
    AcpiPm, AddressSpace, ConsoleSink, IoApic, IoApicInjector, IrqSink, PortSink, PowerHooks,
    Serial16550, ACPI_PM_REG_COUNT, SERIAL_REG_COUNT,
};
use vela_hv::{Hypervisor, MapFlags, Vcpu, VcpuExit, VmPartition};
use vela_ipc::{ConsolePort, RuntimeControl};
use vela_memory::{GuestMemory, GuestMemoryError, GuestRam, HostSpan};
use vela_virtio::devices::blk::{FileDisk, VirtioBlk};
use vela_virtio::devices::VirtioDeviceOps;
use vela_virtio::mmio::{IrqTrigger, VirtioMmio, VIRTIO_MMIO_SIZE};

use crate::error::VmError;
use crate::layout;
use crate::loader::{BootContext, GuestLoader, VirtioMmioWindow};
use crate::spec::{PortForward, VmSpec};

/// Construction-time VM parameters, derived from a [`VmSpec`].
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub vm_id: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub kernel_path: PathBuf,
    pub initrd_path: Option<PathBuf>,
    pub disk_path: Option<PathBuf>,
    pub cmdline: String,
    pub net_enabled: bool,
    pub port_forwards: Vec<PortForward>,
    /// Upgrade unmapped-address accesses to vCPU error exits.
    pub strict_io: bool,
}

impl From<&VmSpec> for VmConfig {
    fn from(spec: &VmSpec) -> Self {
        Self {
            vm_id: spec.vm_id.clone(),
            cpu_count: spec.cpu_count,
            memory_mb: spec.memory_mb,
            kernel_path: spec.kernel_path.clone(),
            initrd_path: spec.initrd_path.clone(),
            disk_path: spec.disk_path.clone(),
            cmdline: spec.cmdline.clone(),
            net_enabled: spec.nat_enabled,
            port_forwards: spec.port_forwards.clone(),
            strict_io: false,
        }
    }
}

impl VmConfig {
    fn validate(&self) -> Result<(), VmError> {
        if self.cpu_count == 0 {
            return Err(VmError::InvalidSpec("cpu_count must be at least 1".into()));
        }
        if self.memory_mb == 0 || self.memory_mb.checked_mul(1024 * 1024).is_none() {
            return Err(VmError::InvalidSpec(format!(
                "memory_mb {} is not a sensible RAM size",
                self.memory_mb
            )));
        }
        Ok(())
    }
}

/// Stop fan-out shared by every component that can end the VM.
///
/// `request_stop` is idempotent and callable from any thread: it clears the
/// running flag and cancels every outstanding hypervisor run so in-flight
/// `run()` calls return promptly.
struct StopSignal {
    running: AtomicBool,
    partition: Arc<dyn VmPartition>,
    cpu_count: u32,
    exit_code: AtomicI32,
}

impl StopSignal {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("stopping VM");
        }
        for vp_index in 0..self.cpu_count {
            self.partition.cancel_run(vp_index);
        }
    }

    /// Records a fatal vCPU failure and stops the VM.
    fn fail(&self) {
        self.exit_code.fetch_max(1, Ordering::SeqCst);
        self.request_stop();
    }
}

struct VmPowerHooks {
    stop: Arc<StopSignal>,
}

impl PowerHooks for VmPowerHooks {
    fn shutdown(&self) {
        self.stop.request_stop();
    }

    fn reset(&self) {
        // Reboot is handled by the controller relaunching the runtime, so a
        // guest-initiated reset stops the VM cleanly.
        info!("guest requested reset; stopping");
        self.stop.request_stop();
    }
}

/// Routes a virtio device's interrupt line to a fixed IOAPIC pin.
struct PinIrq {
    injector: Arc<IoApicInjector>,
    pin: u32,
}

impl IrqTrigger for PinIrq {
    fn raise(&self) {
        self.injector.inject(self.pin);
    }
}

/// UART transmit path into the console port.
struct ConsoleTx {
    console: Arc<ConsolePort>,
}

impl ConsoleSink for ConsoleTx {
    fn write(&self, bytes: &[u8]) {
        self.console.push_output(bytes);
    }
}

struct VmShared {
    stop: Arc<StopSignal>,
    address_space: AddressSpace,
    injector: Arc<IoApicInjector>,
    acpi: Arc<AcpiPm>,
    uart: Arc<Serial16550>,
    console: Arc<ConsolePort>,
    net_link_up: AtomicBool,
    port_forwards: Mutex<Vec<(u16, u16)>>,
}

/// A constructed virtual machine.
///
/// Owns guest memory, the address space, all devices, and the vCPU worker
/// threads. The IPC service holds only the [`RuntimeControl`] handle from
/// [`Vm::control`]; stopping the VM first and the service second is always
/// safe.
pub struct Vm {
    shared: Arc<VmShared>,
    ram: Arc<GuestRam>,
    vcpus: Mutex<Vec<Box<dyn Vcpu>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm").finish_non_exhaustive()
    }
}

impl Vm {
    /// Builds the VM: partition, RAM mapping, devices, loader, vCPUs.
    ///
    /// `console` carries serial traffic in both directions (typically the
    /// port owned by the IPC service). `net_device` supplies the virtio-net
    /// device body when networking is requested; the core provides only the
    /// transport bridge for it.
    pub fn create(
        config: &VmConfig,
        hypervisor: &dyn Hypervisor,
        loader: &dyn GuestLoader,
        console: Arc<ConsolePort>,
        net_device: Option<Box<dyn VirtioDeviceOps>>,
    ) -> Result<Vm, VmError> {
        config.validate()?;

        let partition = hypervisor.create_vm(config.cpu_count)?;
        info!(
            hypervisor = hypervisor.name(),
            cpus = config.cpu_count,
            memory_mb = config.memory_mb,
            "creating VM"
        );

        let ram = Arc::new(GuestRam::new(config.memory_mb * 1024 * 1024).map_err(
            |err| match err {
                GuestMemoryError::AllocationFailed { size } => {
                    VmError::ResourceExhausted(format!("guest RAM allocation of {size} bytes"))
                }
                other => VmError::ResourceExhausted(other.to_string()),
            },
        )?);
        map_ram(&*partition, &ram)?;

        let stop = Arc::new(StopSignal {
            running: AtomicBool::new(true),
            partition: partition.clone(),
            cpu_count: config.cpu_count,
            exit_code: AtomicI32::new(0),
        });

        let ioapic = Arc::new(IoApic::new());
        let injector = Arc::new(IoApicInjector::new(ioapic.clone(), partition.clone()));
        let acpi = Arc::new(AcpiPm::new(Arc::new(VmPowerHooks { stop: stop.clone() })));
        let uart = Arc::new(Serial16550::new(Arc::new(ConsoleTx { console: console.clone() })));

        let mut address_space =
            if config.strict_io { AddressSpace::strict() } else { AddressSpace::new() };
        address_space.register_pio(layout::COM1_BASE, SERIAL_REG_COUNT, uart.clone())?;
        address_space.register_pio(layout::ACPI_PM_BASE_PORT, ACPI_PM_REG_COUNT, acpi.clone())?;
        address_space.register_mmio(
            layout::IOAPIC_MMIO_BASE,
            layout::IOAPIC_MMIO_SIZE,
            ioapic.clone(),
        )?;
        let sink = Arc::new(PortSink);
        for &(base, len) in layout::SILENT_PIO_RANGES {
            address_space.register_pio(base, len, sink.clone())?;
        }

        let mut virtio_windows = Vec::new();
        if let Some(disk_path) = &config.disk_path {
            let disk = FileDisk::open(disk_path).map_err(VmError::Disk)?;
            let bridge = VirtioMmio::new(
                Box::new(VirtioBlk::new(disk)),
                ram.clone() as Arc<dyn GuestMemory>,
                Arc::new(PinIrq { injector: injector.clone(), pin: layout::VIRTIO_BLK_IRQ }),
            );
            address_space.register_mmio(
                layout::VIRTIO_BLK_MMIO_BASE,
                VIRTIO_MMIO_SIZE,
                Arc::new(bridge),
            )?;
            virtio_windows.push(VirtioMmioWindow {
                base: layout::VIRTIO_BLK_MMIO_BASE,
                size: VIRTIO_MMIO_SIZE,
                irq: layout::VIRTIO_BLK_IRQ,
            });
            debug!(path = %disk_path.display(), "virtio-blk attached");
        }

        match (config.net_enabled, net_device) {
            (_, Some(device)) => {
                let bridge = VirtioMmio::new(
                    device,
                    ram.clone() as Arc<dyn GuestMemory>,
                    Arc::new(PinIrq { injector: injector.clone(), pin: layout::VIRTIO_NET_IRQ }),
                );
                address_space.register_mmio(
                    layout::VIRTIO_NET_MMIO_BASE,
                    VIRTIO_MMIO_SIZE,
                    Arc::new(bridge),
                )?;
                virtio_windows.push(VirtioMmioWindow {
                    base: layout::VIRTIO_NET_MMIO_BASE,
                    size: VIRTIO_MMIO_SIZE,
                    irq: layout::VIRTIO_NET_IRQ,
                });
            }
            (true, None) => {
                return Err(VmError::InvalidSpec(
                    "networking requested but no net device supplied".into(),
                ));
            }
            (false, None) => {}
        }

        let boot_registers = loader.load(&BootContext {
            ram: &ram,
            cpu_count: config.cpu_count,
            kernel_path: &config.kernel_path,
            initrd_path: config.initrd_path.as_deref(),
            cmdline: &config.cmdline,
            virtio_windows: &virtio_windows,
        })?;

        // Only the boot processor gets initial registers; application
        // processors stay in wait-for-SIPI.
        let mut vcpus = Vec::with_capacity(config.cpu_count as usize);
        for vp_index in 0..config.cpu_count {
            vcpus.push(partition.create_vcpu(vp_index)?);
        }
        vcpus[0].set_registers(&boot_registers)?;

        info!(cpus = config.cpu_count, "VM created");
        Ok(Vm {
            shared: Arc::new(VmShared {
                stop,
                address_space,
                injector,
                acpi,
                uart,
                console,
                net_link_up: AtomicBool::new(false),
                port_forwards: Mutex::new(
                    config
                        .port_forwards
                        .iter()
                        .map(|f| (f.host_port, f.guest_port))
                        .collect(),
                ),
            }),
            ram,
            vcpus: Mutex::new(vcpus),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the vCPU worker threads and the console pump.
    pub fn start(&self) -> Result<(), VmError> {
        let vcpus = std::mem::take(&mut *self.vcpus.lock().unwrap());
        if vcpus.is_empty() {
            return Err(VmError::AlreadyStarted);
        }
        let mut threads = self.threads.lock().unwrap();
        for vcpu in vcpus {
            let shared = self.shared.clone();
            threads.push(std::thread::spawn(move || vcpu_thread(shared, vcpu)));
        }
        let shared = self.shared.clone();
        threads.push(std::thread::spawn(move || console_pump(shared)));
        Ok(())
    }

    /// Waits for every worker thread to finish and returns the VM exit code
    /// (the max of per-vCPU exit codes).
    pub fn wait(&self) -> i32 {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for thread in threads {
            let _ = thread.join();
        }
        self.exit_code()
    }

    /// Runs the VM to completion; the blocking equivalent of
    /// `start` + `wait`.
    pub fn run(&self) -> Result<i32, VmError> {
        self.start()?;
        Ok(self.wait())
    }

    pub fn request_stop(&self) {
        self.shared.stop.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.shared.stop.running()
    }

    pub fn exit_code(&self) -> i32 {
        self.shared.stop.exit_code.load(Ordering::SeqCst)
    }

    /// Injects an IOAPIC pin; the entry point used by device IRQ callbacks.
    pub fn inject(&self, pin: u32) {
        self.shared.injector.inject(pin);
    }

    /// Guest RAM handle, for loaders and diagnostic tooling.
    pub fn ram(&self) -> &Arc<GuestRam> {
        &self.ram
    }

    /// Control-plane handle for [`vela_ipc::RuntimeService::start`].
    pub fn control(&self) -> Arc<dyn RuntimeControl> {
        self.shared.clone()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.shared.stop.request_stop();
        self.wait();
    }
}

fn map_ram(partition: &dyn VmPartition, ram: &GuestRam) -> Result<(), VmError> {
    let span_region = |span: HostSpan| vela_hv::HostRegion { ptr: span.ptr, len: span.len };
    partition.map_memory(0, span_region(ram.low_span()), MapFlags::rwx())?;
    if let Some(high) = ram.high_span() {
        partition.map_memory(ram.high_gpa_base(), span_region(high), MapFlags::rwx())?;
        info!(
            low_mb = ram.low_size() / (1024 * 1024),
            high_mb = ram.high_size() / (1024 * 1024),
            "guest RAM split around the MMIO gap"
        );
    } else {
        info!(mb = ram.low_size() / (1024 * 1024), "guest RAM mapped");
    }
    Ok(())
}

fn vcpu_thread(shared: Arc<VmShared>, mut vcpu: Box<dyn Vcpu>) {
    let vp_index = vcpu.vp_index();
    let mut exits: u64 = 0;

    while shared.stop.running() {
        let exit = match vcpu.run() {
            Ok(exit) => exit,
            Err(err) => {
                error!(vp_index, %err, "vcpu run failed");
                shared.stop.fail();
                break;
            }
        };
        exits += 1;

        match exit {
            VcpuExit::Continue | VcpuExit::Canceled => {}
            VcpuExit::Halt => {
                // Interrupts wake the vCPU; just give up the scheduler slice.
                std::thread::yield_now();
            }
            VcpuExit::Shutdown => {
                info!(vp_index, exits, "vcpu shutdown");
                shared.stop.request_stop();
                break;
            }
            VcpuExit::Mmio(mut access) => {
                match shared.address_space.dispatch_mmio(&mut access) {
                    Ok(_) => {
                        if let Err(err) = vcpu.complete_mmio(&access) {
                            error!(vp_index, %err, "mmio completion failed");
                            shared.stop.fail();
                            break;
                        }
                    }
                    Err(bus) => {
                        error!(vp_index, %bus, "guest bus error");
                        shared.stop.fail();
                        break;
                    }
                }
            }
            VcpuExit::Pio(mut access) => match shared.address_space.dispatch_pio(&mut access) {
                Ok(_) => {
                    if let Err(err) = vcpu.complete_pio(&access) {
                        error!(vp_index, %err, "pio completion failed");
                        shared.stop.fail();
                        break;
                    }
                }
                Err(bus) => {
                    error!(vp_index, %bus, "guest bus error");
                    shared.stop.fail();
                    break;
                }
            },
        }
    }

    debug!(vp_index, exits, "vcpu stopped");
}

/// Moves controller console input into the UART and raises COM1's interrupt
/// when the UART is requesting one.
fn console_pump(shared: Arc<VmShared>) {
    let mut buf = [0u8; 256];
    while shared.stop.running() {
        let n = shared.console.read_input(&mut buf, Duration::from_millis(16));
        if n == 0 {
            continue;
        }
        for &byte in &buf[..n] {
            shared.uart.push_rx(byte);
        }
        if shared.uart.interrupt_pending() {
            shared.injector.inject(layout::COM1_IRQ);
        }
    }
}

impl RuntimeControl for VmShared {
    fn request_stop(&self) {
        self.stop.request_stop();
    }

    fn power_button(&self) {
        self.acpi.power_button();
    }

    fn inject_console_bytes(&self, bytes: &[u8]) {
        self.console.push_input(bytes);
    }

    fn set_net_link_up(&self, link_up: bool) {
        self.net_link_up.store(link_up, Ordering::SeqCst);
        info!(link_up, "network link state updated");
    }

    fn update_port_forwards(&self, forwards: &[(u16, u16)]) {
        info!(count = forwards.len(), "port forwards updated");
        *self.port_forwards.lock().unwrap() = forwards.to_vec();
    }
}
