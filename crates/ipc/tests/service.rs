//! Runtime service session tests over a loopback TCP connection.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vela_ipc::{Channel, FrameReader, Kind, Message, RuntimeControl, RuntimeService};

#[derive(Default)]
struct FakeControl {
    stops: AtomicU32,
    power_buttons: AtomicU32,
    console_bytes: Mutex<Vec<u8>>,
    link_up: AtomicBool,
    forwards: Mutex<Vec<(u16, u16)>>,
}

impl RuntimeControl for FakeControl {
    fn request_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn power_button(&self) {
        self.power_buttons.fetch_add(1, Ordering::SeqCst);
    }

    fn inject_console_bytes(&self, bytes: &[u8]) {
        self.console_bytes.lock().unwrap().extend_from_slice(bytes);
    }

    fn set_net_link_up(&self, link_up: bool) {
        self.link_up.store(link_up, Ordering::SeqCst);
    }

    fn update_port_forwards(&self, forwards: &[(u16, u16)]) {
        *self.forwards.lock().unwrap() = forwards.to_vec();
    }
}

struct Session {
    service: RuntimeService,
    control: Arc<FakeControl>,
    peer: TcpStream,
    reader: FrameReader,
    pending: Vec<Message>,
}

impl Session {
    fn connect() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

        let service = RuntimeService::new("vm-under-test");
        let control = Arc::new(FakeControl::default());
        service.start(Box::new(accepted), control.clone()).unwrap();
        Session { service, control, peer, reader: FrameReader::new(), pending: Vec::new() }
    }

    fn send(&mut self, message: &Message) {
        self.peer.write_all(&message.encode().unwrap()).unwrap();
    }

    /// Reads messages until `pred` matches one or the deadline passes.
    fn wait_for(&mut self, pred: impl Fn(&Message) -> bool) -> Message {
        if let Some(index) = self.pending.iter().position(|m| pred(m)) {
            return self.pending.remove(index);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 4096];
        loop {
            assert!(Instant::now() < deadline, "timed out waiting for message");
            match self.peer.read(&mut buf) {
                Ok(0) => panic!("service closed the connection"),
                Ok(n) => {
                    for message in self.reader.push(&buf[..n]).unwrap() {
                        if pred(&message) {
                            return message;
                        }
                        self.pending.push(message);
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
    }
}

fn wait_until(deadline: Duration, pred: impl Fn() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    pred()
}

#[test]
fn ping_gets_a_pong_with_the_same_request_id() {
    let mut session = Session::connect();
    let mut ping = Message::request(Channel::Control, "runtime.ping");
    ping.request_id = 42;
    session.send(&ping);

    let pong = session.wait_for(|m| m.message_type == "runtime.pong");
    assert_eq!(pong.kind, Kind::Response);
    assert_eq!(pong.request_id, 42);
    assert_eq!(pong.vm_id, "vm-under-test");
}

#[test]
fn stop_command_reaches_the_vm_and_acks() {
    let mut session = Session::connect();
    let mut command = Message::request(Channel::Control, "runtime.command");
    command.request_id = 1;
    command.set_field("command", "stop");
    session.send(&command);

    let result = session.wait_for(|m| m.message_type == "runtime.command.result");
    assert_eq!(result.field("ok"), Some("true"));
    assert_eq!(session.control.stops.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_command_presses_the_power_button_and_types_poweroff() {
    let mut session = Session::connect();
    let mut command = Message::request(Channel::Control, "runtime.command");
    command.set_field("command", "shutdown");
    session.send(&command);

    session.wait_for(|m| m.message_type == "runtime.command.result");
    assert_eq!(session.control.power_buttons.load(Ordering::SeqCst), 1);
    assert_eq!(
        session.control.console_bytes.lock().unwrap().as_slice(),
        b"\npoweroff\n"
    );
}

#[test]
fn unknown_command_is_rejected() {
    let mut session = Session::connect();
    let mut command = Message::request(Channel::Control, "runtime.command");
    command.set_field("command", "defenestrate");
    session.send(&command);

    let result = session.wait_for(|m| m.message_type == "runtime.command.result");
    assert_eq!(result.field("ok"), Some("false"));
    assert_eq!(result.field("error"), Some("unknown-command"));
}

#[test]
fn update_network_parses_link_and_forwards() {
    let mut session = Session::connect();
    let mut update = Message::request(Channel::Control, "runtime.update_network");
    update
        .set_field("link_up", "true")
        .set_field("forward_count", 3)
        .set_field("forward_0", "8080:80")
        .set_field("forward_1", "not-a-forward")
        .set_field("forward_2", "2222:22");
    session.send(&update);

    let result = session.wait_for(|m| m.message_type == "runtime.update_network.result");
    assert_eq!(result.field("ok"), Some("true"));
    assert!(session.control.link_up.load(Ordering::SeqCst));
    assert_eq!(
        session.control.forwards.lock().unwrap().as_slice(),
        &[(8080, 80), (2222, 22)]
    );
}

#[test]
fn console_input_is_hex_decoded_into_the_vm() {
    let mut session = Session::connect();
    let mut input = Message::request(Channel::Console, "console.input");
    input.set_field("data_hex", "6c730a"); // "ls\n"
    session.send(&input);

    assert!(wait_until(Duration::from_secs(5), || {
        session.control.console_bytes.lock().unwrap().as_slice() == b"ls\n"
    }));
}

#[test]
fn input_events_land_in_the_input_port() {
    let mut session = Session::connect();
    let input_port = session.service.input();

    let mut key = Message::request(Channel::Input, "input.key_event");
    key.set_field("key_code", 57).set_field("pressed", "1");
    session.send(&key);
    let mut pointer = Message::request(Channel::Input, "input.pointer_event");
    pointer.set_field("x", 120).set_field("y", 80).set_field("buttons", 1);
    session.send(&pointer);

    assert!(wait_until(Duration::from_secs(5), || input_port.poll_pointer().is_some()));
    let key_event = input_port.poll_keyboard().unwrap();
    assert_eq!(key_event.key_code, 57);
    assert!(key_event.pressed);
}

#[test]
fn console_output_is_flushed_as_hex_events() {
    let mut session = Session::connect();
    session.service.console().push_output(b"Linux version 6.1\n");

    let event = session.wait_for(|m| m.message_type == "console.data");
    assert_eq!(event.kind, Kind::Event);
    assert_eq!(event.channel, Channel::Console);
    let hex = event.field("data_hex").unwrap();
    assert_eq!(vela_ipc::decode_hex(hex), b"Linux version 6.1\n");
}

#[test]
fn display_frames_are_flushed_with_pixel_payloads() {
    let mut session = Session::connect();
    session.service.display().submit_frame(vela_ipc::DisplayFrame {
        width: 4,
        height: 1,
        stride: 16,
        format: 1,
        resource_width: 4,
        resource_height: 1,
        dirty_x: 0,
        dirty_y: 0,
        pixels: vec![9u8; 16],
    });

    let event = session.wait_for(|m| m.message_type == "display.frame");
    assert_eq!(event.field("width"), Some("4"));
    assert_eq!(event.field("stride"), Some("16"));
    assert_eq!(event.payload, vec![9u8; 16]);
}

#[test]
fn state_events_carry_monotonic_event_ids() {
    let mut session = Session::connect();
    session.service.publish_state("running", 0);
    session.service.publish_state("stopped", 0);

    let first = session.wait_for(|m| m.message_type == "runtime.state");
    let second = session.wait_for(|m| m.message_type == "runtime.state");
    assert_eq!(first.field("state"), Some("running"));
    assert_eq!(second.field("state"), Some("stopped"));
    assert!(second.request_id > first.request_id);
}

#[test]
fn malformed_traffic_disconnects_but_leaves_the_service_stoppable() {
    let mut session = Session::connect();
    session.peer.write_all(b"kind=request channel=control\n").unwrap();

    // The service drops the session; our next reads see EOF.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 256];
    loop {
        assert!(Instant::now() < deadline, "peer was never disconnected");
        match session.peer.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(_) => break,
        }
    }
    session.service.stop();
}
