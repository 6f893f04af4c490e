use thiserror::Error;

use crate::message::Message;

/// Upper bound on a header line; anything longer is a protocol violation.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("malformed header: {reason}")]
    MalformedHeader { reason: String },
    #[error("header line exceeds {MAX_HEADER_LEN} bytes")]
    HeaderTooLong,
    #[error("field {key}={value} contains whitespace")]
    InvalidField { key: String, value: String },
    #[error("stream ended inside a {missing}-byte payload")]
    TruncatedPayload { missing: usize },
}

enum ReaderState {
    Header,
    Payload { message: Message, needed: usize },
}

/// Incremental reader for the newline+binary wire format.
///
/// The state machine alternates strictly between reading a header line up to
/// `\n` and reading exactly the declared number of payload bytes; the two are
/// never mixed.
pub struct FrameReader {
    buffer: Vec<u8>,
    state: ReaderState,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { buffer: Vec::new(), state: ReaderState::Header }
    }

    /// Feeds received bytes, returning every message completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Message>, FramingError> {
        self.buffer.extend_from_slice(bytes);
        let mut completed = Vec::new();

        loop {
            match &mut self.state {
                ReaderState::Header => {
                    let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
                        if self.buffer.len() > MAX_HEADER_LEN {
                            return Err(FramingError::HeaderTooLong);
                        }
                        break;
                    };
                    let line: Vec<u8> = self.buffer.drain(..=newline).collect();
                    let line = String::from_utf8(line).map_err(|_| {
                        FramingError::MalformedHeader { reason: "header is not UTF-8".into() }
                    })?;
                    let (message, payload_size) = Message::decode_header(line.trim_end())?;
                    match payload_size {
                        Some(needed) if needed > 0 => {
                            self.state = ReaderState::Payload { message, needed };
                        }
                        _ => completed.push(message),
                    }
                }
                ReaderState::Payload { message, needed } => {
                    let needed = *needed;
                    if self.buffer.len() < needed {
                        break;
                    }
                    let mut finished = Message::new(message.kind, message.channel, "");
                    std::mem::swap(&mut finished, message);
                    finished.payload = self.buffer.drain(..needed).collect();
                    completed.push(finished);
                    self.state = ReaderState::Header;
                }
            }
        }
        Ok(completed)
    }

    /// Validates that the stream ended on a message boundary; called when the
    /// peer disconnects.
    pub fn finish(&self) -> Result<(), FramingError> {
        if let ReaderState::Payload { needed, .. } = &self.state {
            return Err(FramingError::TruncatedPayload {
                missing: needed - self.buffer.len(),
            });
        }
        Ok(())
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
