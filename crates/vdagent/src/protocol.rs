//! SPICE vdagent wire protocol definitions.
//!
//! Transported over a virtio-serial port as a stream of chunks:
//! `{port: u32, size: u32}` followed by `size` payload bytes. The first chunk
//! of a logical message starts with a [`MessageHeader`]; continuation chunks
//! carry raw payload until `MessageHeader::size` bytes have accumulated.

pub const VD_AGENT_PROTOCOL: u32 = 1;

/// Upper bound on a reassembled message payload (clipboard data cap).
pub const VD_AGENT_MAX_DATA_SIZE: u32 = 1024 * 1024;
/// Maximum bytes per chunk over virtio-serial.
pub const VD_AGENT_MAX_CHUNK_SIZE: u32 = 2048;

/// The virtio-serial port id vdagent traffic travels on.
pub const VD_AGENT_CHUNK_PORT: u32 = 1;

pub const CHUNK_HEADER_SIZE: usize = 8;
pub const MESSAGE_HEADER_SIZE: usize = 20;

// Message types.
pub const VD_AGENT_MOUSE_STATE: u32 = 1;
pub const VD_AGENT_MONITORS_CONFIG: u32 = 2;
pub const VD_AGENT_REPLY: u32 = 3;
pub const VD_AGENT_CLIPBOARD: u32 = 4;
pub const VD_AGENT_DISPLAY_CONFIG: u32 = 5;
pub const VD_AGENT_ANNOUNCE_CAPABILITIES: u32 = 6;
pub const VD_AGENT_CLIPBOARD_GRAB: u32 = 7;
pub const VD_AGENT_CLIPBOARD_REQUEST: u32 = 8;
pub const VD_AGENT_CLIPBOARD_RELEASE: u32 = 9;

// Clipboard data types.
pub const VD_AGENT_CLIPBOARD_NONE: u32 = 0;
pub const VD_AGENT_CLIPBOARD_UTF8_TEXT: u32 = 1;
pub const VD_AGENT_CLIPBOARD_IMAGE_PNG: u32 = 2;

// Clipboard selections (X11 compatibility).
pub const VD_AGENT_CLIPBOARD_SELECTION_CLIPBOARD: u8 = 0;
pub const VD_AGENT_CLIPBOARD_SELECTION_PRIMARY: u8 = 1;
pub const VD_AGENT_CLIPBOARD_SELECTION_SECONDARY: u8 = 2;

// Capability bit indices.
pub const VD_AGENT_CAP_MOUSE_STATE: u32 = 0;
pub const VD_AGENT_CAP_REPLY: u32 = 2;
pub const VD_AGENT_CAP_CLIPBOARD: u32 = 3;
pub const VD_AGENT_CAP_CLIPBOARD_BY_DEMAND: u32 = 5;
pub const VD_AGENT_CAP_CLIPBOARD_SELECTION: u32 = 6;
pub const VD_AGENT_CAP_GUEST_LINEEND_LF: u32 = 8;
pub const VD_AGENT_CAP_GUEST_LINEEND_CRLF: u32 = 9;
pub const VD_AGENT_CAP_MAX_CLIPBOARD: u32 = 10;

/// `VDAgentMessage`: header at the start of every logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub protocol: u32,
    pub message_type: u32,
    pub opaque: u64,
    pub size: u32,
}

impl MessageHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return None;
        }
        Some(Self {
            protocol: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            message_type: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            opaque: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        })
    }

    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; MESSAGE_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.protocol.to_le_bytes());
        out[4..8].copy_from_slice(&self.message_type.to_le_bytes());
        out[8..16].copy_from_slice(&self.opaque.to_le_bytes());
        out[16..20].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Tests whether capability bit `cap` is set in a caps word array.
pub fn has_capability(caps: &[u32], cap: u32) -> bool {
    let word = (cap / 32) as usize;
    let bit = cap % 32;
    caps.get(word).map(|w| w & (1 << bit) != 0).unwrap_or(false)
}

/// Sets capability bit `cap`, growing `caps` as needed.
pub fn set_capability(caps: &mut Vec<u32>, cap: u32) {
    let word = (cap / 32) as usize;
    if caps.len() <= word {
        caps.resize(word + 1, 0);
    }
    caps[word] |= 1 << (cap % 32);
}
