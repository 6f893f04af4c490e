//! Control-plane IPC.
//!
//! The VMM talks to its controller process over a single duplex byte stream.
//! Messages are a line of UTF-8 `key=value` fields terminated by `\n`,
//! optionally followed by an opaque binary payload whose length the header
//! declares via `payload_size`. [`FrameReader`] implements the reader state
//! machine; [`RuntimeService`] owns the session thread and dispatches decoded
//! messages to a [`RuntimeControl`] implementation.

mod frame;
mod hex;
mod message;
mod ports;
mod service;

pub use frame::{FrameReader, FramingError, MAX_HEADER_LEN};
pub use hex::{decode_hex, encode_hex};
pub use message::{Channel, Kind, Message};
pub use ports::{
    ConsolePort, DisplayFrame, DisplayPort, InputPort, KeyboardEvent, PointerEvent,
};
pub use service::{IpcStream, RuntimeControl, RuntimeService};
