//! SPICE-vdagent-compatible clipboard protocol handling.
//!
//! [`VdAgentHandler`] reassembles the chunked vdagent stream arriving from a
//! virtio-serial port, negotiates capabilities with the guest agent, and
//! surfaces clipboard traffic as [`ClipboardEvent`]s. Outbound messages are
//! chunked back onto the same port through an [`AgentTransport`].

pub mod protocol;

mod handler;

pub use handler::{AgentTransport, ClipboardEvent, ClipboardEvents, VdAgentHandler};
