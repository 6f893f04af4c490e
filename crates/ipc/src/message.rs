use std::fmt;

use crate::frame::FramingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
    Event,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Request => "request",
            Kind::Response => "response",
            Kind::Event => "event",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Kind::Request),
            "response" => Some(Kind::Response),
            "event" => Some(Kind::Event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Control,
    Console,
    Input,
    Display,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Control => "control",
            Channel::Console => "console",
            Channel::Input => "input",
            Channel::Display => "display",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "control" => Some(Channel::Control),
            "console" => Some(Channel::Console),
            "input" => Some(Channel::Input),
            "display" => Some(Channel::Display),
            _ => None,
        }
    }
}

/// One control-plane message.
///
/// `fields` preserves insertion order so encode/decode round-trips exactly.
/// Field values must not contain whitespace; binary data travels in `payload`
/// (or hex-encoded fields like `data_hex`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: Kind,
    pub channel: Channel,
    pub message_type: String,
    pub vm_id: String,
    pub request_id: u64,
    pub fields: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: Kind, channel: Channel, message_type: &str) -> Self {
        Self {
            kind,
            channel,
            message_type: message_type.to_string(),
            vm_id: String::new(),
            request_id: 0,
            fields: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn request(channel: Channel, message_type: &str) -> Self {
        Self::new(Kind::Request, channel, message_type)
    }

    pub fn response(channel: Channel, message_type: &str) -> Self {
        Self::new(Kind::Response, channel, message_type)
    }

    pub fn event(channel: Channel, message_type: &str) -> Self {
        Self::new(Kind::Event, channel, message_type)
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_field(&mut self, key: &str, value: impl fmt::Display) -> &mut Self {
        let value = value.to_string();
        if let Some(entry) = self.fields.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.fields.push((key.to_string(), value));
        }
        self
    }

    /// Encodes the header line plus payload bytes.
    ///
    /// Fails when a key or value contains whitespace (which would corrupt the
    /// wire framing).
    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        let mut line = String::new();
        let mut push = |key: &str, value: &str| -> Result<(), FramingError> {
            if key.is_empty()
                || key.chars().any(|c| c.is_whitespace() || c == '=')
                || value.chars().any(char::is_whitespace)
            {
                return Err(FramingError::InvalidField {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(key);
            line.push('=');
            line.push_str(value);
            Ok(())
        };

        push("kind", self.kind.as_str())?;
        push("channel", self.channel.as_str())?;
        push("type", &self.message_type)?;
        if !self.vm_id.is_empty() {
            push("vm_id", &self.vm_id)?;
        }
        push("request_id", &self.request_id.to_string())?;
        for (key, value) in &self.fields {
            push(key, value)?;
        }
        if !self.payload.is_empty() {
            push("payload_size", &self.payload.len().to_string())?;
        }

        let mut out = line.into_bytes();
        out.push(b'\n');
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decodes one header line (without payload).
    ///
    /// Returns the message and the declared payload size, if any. Unknown
    /// keys are preserved as ordinary fields.
    pub fn decode_header(line: &str) -> Result<(Self, Option<usize>), FramingError> {
        let mut kind = None;
        let mut channel = None;
        let mut message_type = None;
        let mut vm_id = String::new();
        let mut request_id = 0u64;
        let mut payload_size = None;
        let mut fields = Vec::new();

        for token in line.split_ascii_whitespace() {
            let (key, value) = token.split_once('=').ok_or_else(|| {
                FramingError::MalformedHeader { reason: format!("token without '=': {token}") }
            })?;
            match key {
                "kind" => {
                    kind = Some(Kind::parse(value).ok_or_else(|| {
                        FramingError::MalformedHeader { reason: format!("unknown kind {value}") }
                    })?);
                }
                "channel" => {
                    channel = Some(Channel::parse(value).ok_or_else(|| {
                        FramingError::MalformedHeader {
                            reason: format!("unknown channel {value}"),
                        }
                    })?);
                }
                "type" => message_type = Some(value.to_string()),
                "vm_id" => vm_id = value.to_string(),
                "request_id" => {
                    request_id = value.parse().map_err(|_| FramingError::MalformedHeader {
                        reason: format!("bad request_id {value}"),
                    })?;
                }
                "payload_size" => {
                    payload_size =
                        Some(value.parse().map_err(|_| FramingError::MalformedHeader {
                            reason: format!("bad payload_size {value}"),
                        })?);
                }
                _ => fields.push((key.to_string(), value.to_string())),
            }
        }

        let message = Message {
            kind: kind.ok_or_else(|| FramingError::MalformedHeader {
                reason: "missing kind".to_string(),
            })?,
            channel: channel.ok_or_else(|| FramingError::MalformedHeader {
                reason: "missing channel".to_string(),
            })?,
            message_type: message_type.ok_or_else(|| FramingError::MalformedHeader {
                reason: "missing type".to_string(),
            })?,
            vm_id,
            request_id,
            fields,
            payload: Vec::new(),
        };
        Ok((message, payload_size))
    }
}
