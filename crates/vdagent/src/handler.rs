use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::protocol::*;

/// Outbound byte path towards the guest agent (the virtio-serial port).
pub trait AgentTransport: Send + Sync {
    fn send(&self, bytes: &[u8]);
}

/// Clipboard traffic decoded from the guest agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardEvent {
    Grab { selection: u8, types: Vec<u32> },
    Data { selection: u8, data_type: u32, data: Vec<u8> },
    Request { selection: u8, data_type: u32 },
    Release { selection: u8 },
}

/// Consumer of guest clipboard events (the controller's clipboard bridge).
pub trait ClipboardEvents: Send + Sync {
    fn clipboard_event(&self, event: ClipboardEvent);
}

struct Reassembly {
    header: MessageHeader,
    data: Vec<u8>,
}

#[derive(Default)]
struct HandlerState {
    recv: Vec<u8>,
    pending: Option<Reassembly>,
    /// Body bytes of a dropped oversized message still owed by the peer;
    /// continuation chunks are swallowed against this until the stream is
    /// back on a message boundary.
    discard: usize,
    guest_caps: Vec<u32>,
    guest_caps_received: bool,
}

/// Chunk reassembler and sender for the vdagent protocol.
pub struct VdAgentHandler {
    state: Mutex<HandlerState>,
    host_caps: Vec<u32>,
    transport: Arc<dyn AgentTransport>,
    clipboard: Arc<dyn ClipboardEvents>,
}

impl VdAgentHandler {
    pub fn new(transport: Arc<dyn AgentTransport>, clipboard: Arc<dyn ClipboardEvents>) -> Self {
        let mut host_caps = Vec::new();
        set_capability(&mut host_caps, VD_AGENT_CAP_CLIPBOARD);
        set_capability(&mut host_caps, VD_AGENT_CAP_CLIPBOARD_BY_DEMAND);
        set_capability(&mut host_caps, VD_AGENT_CAP_CLIPBOARD_SELECTION);
        set_capability(&mut host_caps, VD_AGENT_CAP_GUEST_LINEEND_CRLF);
        Self { state: Mutex::new(HandlerState::default()), host_caps, transport, clipboard }
    }

    /// Whether the guest announced `cap`.
    pub fn guest_has_capability(&self, cap: u32) -> bool {
        has_capability(&self.state.lock().unwrap().guest_caps, cap)
    }

    /// Feeds bytes received from the virtio-serial port into the
    /// reassembler. Complete messages are dispatched synchronously.
    pub fn on_data_received(&self, data: &[u8]) {
        let mut completed = Vec::new();
        let mut reply_caps = false;
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            state.recv.extend_from_slice(data);

            loop {
                if state.recv.len() < CHUNK_HEADER_SIZE {
                    break;
                }
                let chunk_size =
                    u32::from_le_bytes(state.recv[4..8].try_into().unwrap()) as usize;
                if chunk_size > (VD_AGENT_MAX_DATA_SIZE as usize) + MESSAGE_HEADER_SIZE {
                    warn!(chunk_size, "vdagent: absurd chunk size, resetting stream");
                    state.recv.clear();
                    state.pending = None;
                    state.discard = 0;
                    break;
                }
                let total = CHUNK_HEADER_SIZE + chunk_size;
                if state.recv.len() < total {
                    break;
                }

                // Continuation chunks of a dropped oversized message carry
                // raw body bytes, not a header; swallow them until the peer
                // is back on a message boundary.
                if state.discard > 0 {
                    state.discard = state.discard.saturating_sub(chunk_size);
                    state.recv.drain(..total);
                    continue;
                }

                let payload = &state.recv[CHUNK_HEADER_SIZE..total];

                match state.pending.as_mut() {
                    None => {
                        // First chunk of a message must carry the header.
                        if let Some(header) = MessageHeader::parse(payload) {
                            if header.size > VD_AGENT_MAX_DATA_SIZE {
                                warn!(size = header.size, "vdagent: oversized message dropped");
                                let carried = payload.len() - MESSAGE_HEADER_SIZE;
                                state.discard = (header.size as usize).saturating_sub(carried);
                            } else {
                                state.pending = Some(Reassembly {
                                    header,
                                    data: payload[MESSAGE_HEADER_SIZE..].to_vec(),
                                });
                            }
                        }
                    }
                    Some(pending) => {
                        pending.data.extend_from_slice(payload);
                    }
                }
                state.recv.drain(..total);

                let done = state
                    .pending
                    .as_ref()
                    .map(|p| p.data.len() >= p.header.size as usize)
                    .unwrap_or(false);
                if done {
                    let mut finished = state.pending.take().unwrap();
                    finished.data.truncate(finished.header.size as usize);
                    if finished.header.message_type == VD_AGENT_ANNOUNCE_CAPABILITIES {
                        reply_caps |= Self::handle_announce_locked(state, &finished.data);
                    } else {
                        completed.push(finished);
                    }
                }
            }
        }

        for message in completed {
            self.dispatch(message.header, &message.data);
        }
        if reply_caps {
            self.send_announce_capabilities();
        }
    }

    /// Returns whether the guest asked for our capabilities back.
    fn handle_announce_locked(state: &mut HandlerState, data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }
        let request = u32::from_le_bytes(data[0..4].try_into().unwrap());
        state.guest_caps = data[4..]
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
            .collect();
        state.guest_caps_received = true;
        info!(words = state.guest_caps.len(), "vdagent: guest capabilities received");
        request != 0
    }

    fn selection_aware(&self) -> bool {
        self.guest_has_capability(VD_AGENT_CAP_CLIPBOARD_SELECTION)
    }

    fn dispatch(&self, header: MessageHeader, data: &[u8]) {
        debug!(
            message_type = header.message_type,
            size = header.size,
            "vdagent: message received"
        );
        let event = match header.message_type {
            VD_AGENT_CLIPBOARD_GRAB => self.parse_grab(data),
            VD_AGENT_CLIPBOARD => self.parse_data(data),
            VD_AGENT_CLIPBOARD_REQUEST => self.parse_request(data),
            VD_AGENT_CLIPBOARD_RELEASE => Some(self.parse_release(data)),
            other => {
                debug!(message_type = other, "vdagent: unhandled message type");
                None
            }
        };
        if let Some(event) = event {
            self.clipboard.clipboard_event(event);
        }
    }

    fn parse_grab(&self, data: &[u8]) -> Option<ClipboardEvent> {
        let (selection, types_bytes) = if self.selection_aware() && data.len() >= 4 {
            (data[0], &data[4..])
        } else {
            (VD_AGENT_CLIPBOARD_SELECTION_CLIPBOARD, data)
        };
        let types = types_bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
            .collect();
        Some(ClipboardEvent::Grab { selection, types })
    }

    fn parse_data(&self, data: &[u8]) -> Option<ClipboardEvent> {
        if self.selection_aware() && data.len() >= 8 {
            Some(ClipboardEvent::Data {
                selection: data[0],
                data_type: u32::from_le_bytes(data[4..8].try_into().unwrap()),
                data: data[8..].to_vec(),
            })
        } else if data.len() >= 4 {
            Some(ClipboardEvent::Data {
                selection: VD_AGENT_CLIPBOARD_SELECTION_CLIPBOARD,
                data_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
                data: data[4..].to_vec(),
            })
        } else {
            None
        }
    }

    fn parse_request(&self, data: &[u8]) -> Option<ClipboardEvent> {
        if self.selection_aware() && data.len() >= 8 {
            Some(ClipboardEvent::Request {
                selection: data[0],
                data_type: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            })
        } else if data.len() >= 4 {
            Some(ClipboardEvent::Request {
                selection: VD_AGENT_CLIPBOARD_SELECTION_CLIPBOARD,
                data_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            })
        } else {
            None
        }
    }

    fn parse_release(&self, data: &[u8]) -> ClipboardEvent {
        let selection = if self.selection_aware() && !data.is_empty() {
            data[0]
        } else {
            VD_AGENT_CLIPBOARD_SELECTION_CLIPBOARD
        };
        ClipboardEvent::Release { selection }
    }

    /// Sends a message, chunked at [`VD_AGENT_MAX_CHUNK_SIZE`]. The first
    /// chunk carries the message header plus as much payload as fits;
    /// continuation chunks carry raw payload only.
    fn send_message(&self, message_type: u32, data: &[u8]) {
        let header = MessageHeader {
            protocol: VD_AGENT_PROTOCOL,
            message_type,
            opaque: 0,
            size: data.len() as u32,
        };

        let first_len =
            data.len().min(VD_AGENT_MAX_CHUNK_SIZE as usize - MESSAGE_HEADER_SIZE);
        let mut buf =
            Vec::with_capacity(CHUNK_HEADER_SIZE + MESSAGE_HEADER_SIZE + first_len);
        buf.extend_from_slice(&VD_AGENT_CHUNK_PORT.to_le_bytes());
        buf.extend_from_slice(&((MESSAGE_HEADER_SIZE + first_len) as u32).to_le_bytes());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&data[..first_len]);
        self.transport.send(&buf);

        let mut offset = first_len;
        while offset < data.len() {
            let chunk_len = (data.len() - offset).min(VD_AGENT_MAX_CHUNK_SIZE as usize);
            let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE + chunk_len);
            buf.extend_from_slice(&VD_AGENT_CHUNK_PORT.to_le_bytes());
            buf.extend_from_slice(&(chunk_len as u32).to_le_bytes());
            buf.extend_from_slice(&data[offset..offset + chunk_len]);
            self.transport.send(&buf);
            offset += chunk_len;
        }
    }

    pub fn send_announce_capabilities(&self) {
        let mut data = Vec::with_capacity(4 + self.host_caps.len() * 4);
        data.extend_from_slice(&0u32.to_le_bytes()); // request = 0
        for word in &self.host_caps {
            data.extend_from_slice(&word.to_le_bytes());
        }
        self.send_message(VD_AGENT_ANNOUNCE_CAPABILITIES, &data);
        info!("vdagent: sent announce capabilities");
    }

    fn guest_ready(&self) -> bool {
        let ready = self.state.lock().unwrap().guest_caps_received;
        if !ready {
            debug!("vdagent: guest caps not received yet, dropping send");
        }
        ready
    }

    pub fn send_clipboard_grab(&self, selection: u8, types: &[u32]) {
        if !self.guest_ready() {
            return;
        }
        let mut data = Vec::new();
        if self.selection_aware() {
            data.extend_from_slice(&[selection, 0, 0, 0]);
        }
        for t in types {
            data.extend_from_slice(&t.to_le_bytes());
        }
        self.send_message(VD_AGENT_CLIPBOARD_GRAB, &data);
    }

    pub fn send_clipboard_data(&self, selection: u8, data_type: u32, payload: &[u8]) {
        if !self.guest_ready() {
            return;
        }
        let mut data = Vec::with_capacity(8 + payload.len());
        if self.selection_aware() {
            data.extend_from_slice(&[selection, 0, 0, 0]);
        }
        data.extend_from_slice(&data_type.to_le_bytes());
        data.extend_from_slice(payload);
        self.send_message(VD_AGENT_CLIPBOARD, &data);
    }

    pub fn send_clipboard_request(&self, selection: u8, data_type: u32) {
        if !self.guest_ready() {
            return;
        }
        let mut data = Vec::with_capacity(8);
        if self.selection_aware() {
            data.extend_from_slice(&[selection, 0, 0, 0]);
        }
        data.extend_from_slice(&data_type.to_le_bytes());
        self.send_message(VD_AGENT_CLIPBOARD_REQUEST, &data);
    }

    pub fn send_clipboard_release(&self, selection: u8) {
        if !self.guest_ready() {
            return;
        }
        let mut data = Vec::new();
        if self.selection_aware() {
            data.extend_from_slice(&[selection, 0, 0, 0]);
        }
        self.send_message(VD_AGENT_CLIPBOARD_RELEASE, &data);
    }
}
