use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Thread-safe byte queues decoupling the emulated UART from IPC delivery.
///
/// Input flows controller → guest: the service pushes decoded `console.input`
/// bytes and the VM's console pump thread pops them with a deadline. Output
/// flows guest → controller: the UART pushes transmitted bytes and the
/// service drains them on its flush cadence.
pub struct ConsolePort {
    input: Mutex<VecDeque<u8>>,
    input_ready: Condvar,
    output: Mutex<Vec<u8>>,
}

impl ConsolePort {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(VecDeque::new()),
            input_ready: Condvar::new(),
            output: Mutex::new(Vec::new()),
        }
    }

    pub fn push_input(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.input.lock().unwrap().extend(bytes.iter().copied());
        self.input_ready.notify_all();
    }

    /// Pops up to `out.len()` input bytes, waiting at most `timeout` when the
    /// queue is empty. Returns the number of bytes copied.
    pub fn read_input(&self, out: &mut [u8], timeout: Duration) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut queue = self.input.lock().unwrap();
        if queue.is_empty() {
            let (guard, _) = self.input_ready.wait_timeout(queue, timeout).unwrap();
            queue = guard;
        }
        let mut copied = 0;
        while copied < out.len() {
            match queue.pop_front() {
                Some(byte) => {
                    out[copied] = byte;
                    copied += 1;
                }
                None => break,
            }
        }
        copied
    }

    /// Appends guest console output for the service to flush.
    pub fn push_output(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.output.lock().unwrap().extend_from_slice(bytes);
    }

    /// Takes all buffered output; empty when there is nothing to flush.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.output.lock().unwrap())
    }
}

impl Default for ConsolePort {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyboardEvent {
    /// evdev key code.
    pub key_code: u32,
    pub pressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerEvent {
    pub x: i32,
    pub y: i32,
    pub buttons: u32,
}

/// Keyboard/pointer event queues feeding the input device models.
#[derive(Default)]
pub struct InputPort {
    keys: Mutex<VecDeque<KeyboardEvent>>,
    pointers: Mutex<VecDeque<PointerEvent>>,
}

impl InputPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_key_event(&self, event: KeyboardEvent) {
        self.keys.lock().unwrap().push_back(event);
    }

    pub fn push_pointer_event(&self, event: PointerEvent) {
        self.pointers.lock().unwrap().push_back(event);
    }

    pub fn poll_keyboard(&self) -> Option<KeyboardEvent> {
        self.keys.lock().unwrap().pop_front()
    }

    pub fn poll_pointer(&self) -> Option<PointerEvent> {
        self.pointers.lock().unwrap().pop_front()
    }
}

/// One framebuffer update from the display device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: u32,
    pub resource_width: u32,
    pub resource_height: u32,
    pub dirty_x: u32,
    pub dirty_y: u32,
    pub pixels: Vec<u8>,
}

/// Frame queue between the display device and IPC delivery.
#[derive(Default)]
pub struct DisplayPort {
    frames: Mutex<VecDeque<DisplayFrame>>,
}

impl DisplayPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_frame(&self, frame: DisplayFrame) {
        self.frames.lock().unwrap().push_back(frame);
    }

    pub fn take_frames(&self) -> Vec<DisplayFrame> {
        self.frames.lock().unwrap().drain(..).collect()
    }
}
