//! The inter-node wire protocol: a newline-framed JSON envelope exchanged
//! over per-message TCP connections.
//!
//! Every request-shaped message type has a matching `*_ACK`; delivery status
//! (`OK` / `error` / `partial`) travels in the envelope metadata together
//! with a human-readable note on failure.

pub mod codec;
pub mod message;

pub use codec::EnvelopeCodec;
pub use message::{Message, MessageType, ProtoError, Status};
