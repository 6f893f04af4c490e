//! Full control-plane path: controller socket -> RuntimeService -> Vm.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use vela_hv::testing::FakeHypervisor;
use vela_hv::Register;
use vela_ipc::{Channel, FrameReader, Message, RuntimeService};
use vela_machine::{BootContext, GuestLoader, Vm, VmConfig, VmError};

struct NullLoader;

impl GuestLoader for NullLoader {
    fn load(&self, _ctx: &BootContext<'_>) -> Result<Vec<(Register, u64)>, VmError> {
        Ok(vec![(Register::Rip, 0x0010_0000)])
    }
}

fn config() -> VmConfig {
    VmConfig {
        vm_id: "vm-ipc".into(),
        cpu_count: 1,
        memory_mb: 32,
        kernel_path: "/nonexistent/vmlinuz".into(),
        initrd_path: None,
        disk_path: None,
        cmdline: String::new(),
        net_enabled: false,
        port_forwards: Vec::new(),
        strict_io: false,
    }
}

#[test]
fn controller_stop_command_halts_the_vm() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

    let service = RuntimeService::new("vm-ipc");
    let hypervisor = FakeHypervisor::new();
    let vm =
        Vm::create(&config(), &hypervisor, &NullLoader, service.console(), None).unwrap();
    vm.start().unwrap();
    service.start(Box::new(accepted), vm.control()).unwrap();
    service.publish_state("running", 0);

    let mut command = Message::request(Channel::Control, "runtime.command");
    command.request_id = 5;
    command.set_field("command", "stop");
    peer.write_all(&command.encode().unwrap()).unwrap();

    // Collect the state event and the command ack.
    let mut reader = FrameReader::new();
    let mut got_ack = false;
    let mut got_state = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 4096];
    while !(got_ack && got_state) {
        assert!(Instant::now() < deadline, "timed out talking to the service");
        match peer.read(&mut buf) {
            Ok(0) => panic!("service disconnected"),
            Ok(n) => {
                for message in reader.push(&buf[..n]).unwrap() {
                    match message.message_type.as_str() {
                        "runtime.state" => {
                            assert_eq!(message.field("state"), Some("running"));
                            got_state = true;
                        }
                        "runtime.command.result" => {
                            assert_eq!(message.request_id, 5);
                            assert_eq!(message.field("ok"), Some("true"));
                            got_ack = true;
                        }
                        other => panic!("unexpected message {other}"),
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) => panic!("read failed: {err}"),
        }
    }

    // The stop request reached the VM; it winds down without further help.
    assert_eq!(vm.wait(), 0);
    assert!(!vm.is_running());
    service.publish_state("stopped", vm.exit_code());
    service.stop();
}
