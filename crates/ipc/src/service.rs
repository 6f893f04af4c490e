use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::frame::FrameReader;
use crate::hex::{decode_hex, encode_hex};
use crate::message::{Channel, Kind, Message};
use crate::ports::{ConsolePort, DisplayPort, InputPort, KeyboardEvent, PointerEvent};

/// Console bytes and display frames are flushed at most this often.
const FLUSH_INTERVAL: Duration = Duration::from_millis(16);
/// Read timeout; bounds how late a flush tick can fire.
const READ_TIMEOUT: Duration = Duration::from_millis(4);

/// VM-side operations the control plane may invoke.
///
/// Implemented by the machine layer; the service holds it only for the
/// session's lifetime and never assumes ownership of the VM.
pub trait RuntimeControl: Send + Sync {
    fn request_stop(&self);
    fn power_button(&self);
    fn inject_console_bytes(&self, bytes: &[u8]);
    fn set_net_link_up(&self, link_up: bool);
    /// `(host_port, guest_port)` pairs.
    fn update_port_forwards(&self, forwards: &[(u16, u16)]);
}

/// Duplex byte stream the session runs over.
pub trait IpcStream: Read + Write + Send {
    fn try_clone_stream(&self) -> io::Result<Box<dyn IpcStream>>;
    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl IpcStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Box<dyn IpcStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

#[cfg(unix)]
impl IpcStream for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Box<dyn IpcStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_stream_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

struct Shared {
    vm_id: String,
    running: AtomicBool,
    next_event_id: AtomicU64,
    console: Arc<ConsolePort>,
    input: Arc<InputPort>,
    display: Arc<DisplayPort>,
    writer: Mutex<Option<Box<dyn IpcStream>>>,
}

impl Shared {
    fn next_event_id(&self) -> u64 {
        self.next_event_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Serialises and writes one message behind the send mutex so that
    /// header and payload land on the wire atomically. A failed or partial
    /// write is fatal to the session.
    fn send(&self, message: &Message) -> bool {
        let encoded = match message.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(%err, message_type = %message.message_type, "unencodable IPC message");
                return false;
            }
        };
        let mut writer = self.writer.lock().unwrap();
        let Some(stream) = writer.as_mut() else {
            return false;
        };
        let outcome = stream.write_all(&encoded);
        let outcome = outcome.and_then(|()| stream.flush());
        if let Err(err) = outcome {
            warn!(%err, "IPC write failed; terminating session");
            *writer = None;
            self.running.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn publish_state(&self, state: &str, exit_code: i32) {
        let mut event = Message::event(Channel::Control, "runtime.state");
        event.vm_id = self.vm_id.clone();
        event.request_id = self.next_event_id();
        event.set_field("state", state).set_field("exit_code", exit_code);
        self.send(&event);
    }

    fn flush_console(&self) {
        let data = self.console.take_output();
        if data.is_empty() {
            return;
        }
        let mut event = Message::event(Channel::Console, "console.data");
        event.vm_id = self.vm_id.clone();
        event.request_id = self.next_event_id();
        event.set_field("data_hex", encode_hex(&data));
        self.send(&event);
    }

    fn flush_display(&self) {
        for frame in self.display.take_frames() {
            let mut event = Message::event(Channel::Display, "display.frame");
            event.vm_id = self.vm_id.clone();
            event.request_id = self.next_event_id();
            event
                .set_field("width", frame.width)
                .set_field("height", frame.height)
                .set_field("stride", frame.stride)
                .set_field("format", frame.format)
                .set_field("resource_width", frame.resource_width)
                .set_field("resource_height", frame.resource_height)
                .set_field("dirty_x", frame.dirty_x)
                .set_field("dirty_y", frame.dirty_y);
            event.payload = frame.pixels;
            self.send(&event);
        }
    }
}

/// Control-plane session service.
///
/// One duplex connection to a single controller peer: a dedicated thread
/// reads and dispatches inbound messages and flushes console/display events
/// on a 16 ms cadence. Outbound sends from any thread are serialised by the
/// send mutex.
pub struct RuntimeService {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeService {
    pub fn new(vm_id: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                vm_id: vm_id.to_string(),
                running: AtomicBool::new(false),
                next_event_id: AtomicU64::new(1),
                console: Arc::new(ConsolePort::new()),
                input: Arc::new(InputPort::new()),
                display: Arc::new(DisplayPort::new()),
                writer: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn vm_id(&self) -> &str {
        &self.shared.vm_id
    }

    pub fn console(&self) -> Arc<ConsolePort> {
        self.shared.console.clone()
    }

    pub fn input(&self) -> Arc<InputPort> {
        self.shared.input.clone()
    }

    pub fn display(&self) -> Arc<DisplayPort> {
        self.shared.display.clone()
    }

    /// Emits a `runtime.state` event to the controller.
    pub fn publish_state(&self, state: &str, exit_code: i32) {
        self.shared.publish_state(state, exit_code);
    }

    /// Starts the session over an accepted connection. The service handles
    /// one peer; a second `start` without `stop` is an error.
    pub fn start(
        &self,
        stream: Box<dyn IpcStream>,
        control: Arc<dyn RuntimeControl>,
    ) -> io::Result<()> {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "session already started"));
        }
        stream.set_stream_read_timeout(Some(READ_TIMEOUT))?;
        *self.shared.writer.lock().unwrap() = Some(stream.try_clone_stream()?);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        *thread = Some(std::thread::spawn(move || session_loop(shared, stream, control)));
        Ok(())
    }

    /// Stops the session thread and drops the connection. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        *self.shared.writer.lock().unwrap() = None;
    }
}

impl Drop for RuntimeService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn session_loop(shared: Arc<Shared>, mut stream: Box<dyn IpcStream>, control: Arc<dyn RuntimeControl>) {
    info!(vm_id = %shared.vm_id, "IPC session started");
    let mut reader = FrameReader::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut last_flush = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        if last_flush.elapsed() >= FLUSH_INTERVAL {
            shared.flush_console();
            shared.flush_display();
            last_flush = Instant::now();
        }

        match stream.read(&mut buf) {
            Ok(0) => {
                debug!("IPC peer disconnected");
                break;
            }
            Ok(n) => match reader.push(&buf[..n]) {
                Ok(messages) => {
                    for message in messages {
                        dispatch(&shared, &*control, message);
                    }
                }
                Err(err) => {
                    warn!(%err, "IPC framing error; disconnecting peer");
                    break;
                }
            },
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                warn!(%err, "IPC read failed");
                break;
            }
        }
    }

    if let Err(err) = reader.finish() {
        warn!(%err, "IPC stream ended mid-message");
    }
    shared.flush_console();
    shared.flush_display();
    *shared.writer.lock().unwrap() = None;
    info!(vm_id = %shared.vm_id, "IPC session ended");
}

fn response_for(shared: &Shared, request: &Message, message_type: &str) -> Message {
    let mut resp = Message::response(request.channel, message_type);
    resp.vm_id = shared.vm_id.clone();
    resp.request_id = request.request_id;
    resp
}

fn dispatch(shared: &Shared, control: &dyn RuntimeControl, message: Message) {
    match (message.channel, message.kind, message.message_type.as_str()) {
        (Channel::Control, Kind::Request, "runtime.command") => {
            let mut resp = response_for(shared, &message, "runtime.command.result");
            resp.set_field("ok", "true");
            match message.field("command") {
                None => {
                    resp.set_field("ok", "false").set_field("error", "missing-command");
                }
                Some("stop") => control.request_stop(),
                Some("shutdown") => {
                    // Ask the guest to power itself off; S5 detection does the
                    // actual stop.
                    control.power_button();
                    control.inject_console_bytes(b"\npoweroff\n");
                }
                Some("reboot") => {
                    control.request_stop();
                    resp.set_field("note", "reboot-performed-stop");
                }
                Some("start") => {
                    resp.set_field("note", "already-running");
                }
                Some(other) => {
                    debug!(command = other, "unknown runtime command");
                    resp.set_field("ok", "false").set_field("error", "unknown-command");
                }
            }
            shared.send(&resp);
        }
        (Channel::Control, Kind::Request, "runtime.update_network") => {
            let mut resp = response_for(shared, &message, "runtime.update_network.result");
            if let Some(link_up) = message.field("link_up") {
                control.set_net_link_up(link_up == "true" || link_up == "1");
            }
            if let Some(count) = message.field("forward_count").and_then(|v| v.parse::<usize>().ok())
            {
                let mut forwards = Vec::with_capacity(count);
                for i in 0..count {
                    let Some(value) = message.field(&format!("forward_{i}")) else {
                        continue;
                    };
                    let Some((host, guest)) = value.split_once(':') else {
                        continue;
                    };
                    if let (Ok(host), Ok(guest)) = (host.parse::<u16>(), guest.parse::<u16>()) {
                        if host != 0 && guest != 0 {
                            forwards.push((host, guest));
                        }
                    }
                }
                control.update_port_forwards(&forwards);
            }
            resp.set_field("ok", "true");
            shared.send(&resp);
        }
        (Channel::Control, Kind::Request, "runtime.ping") => {
            let resp = response_for(shared, &message, "runtime.pong");
            shared.send(&resp);
        }
        (Channel::Console, Kind::Request, "console.input") => {
            if let Some(data_hex) = message.field("data_hex") {
                let bytes = decode_hex(data_hex);
                control.inject_console_bytes(&bytes);
            }
        }
        (Channel::Input, Kind::Request, "input.key_event") => {
            let key_code = message.field("key_code").and_then(|v| v.parse::<u32>().ok());
            let pressed = message.field("pressed").map(|v| v == "1" || v == "true");
            if let (Some(key_code), Some(pressed)) = (key_code, pressed) {
                shared.input.push_key_event(KeyboardEvent { key_code, pressed });
            }
        }
        (Channel::Input, Kind::Request, "input.pointer_event") => {
            let mut event = PointerEvent { x: 0, y: 0, buttons: 0 };
            if let Some(x) = message.field("x").and_then(|v| v.parse().ok()) {
                event.x = x;
            }
            if let Some(y) = message.field("y").and_then(|v| v.parse().ok()) {
                event.y = y;
            }
            if let Some(buttons) = message.field("buttons").and_then(|v| v.parse().ok()) {
                event.buttons = buttons;
            }
            shared.input.push_pointer_event(event);
        }
        (channel, kind, message_type) => {
            debug!(?channel, ?kind, message_type, "unhandled IPC message");
        }
    }
}
