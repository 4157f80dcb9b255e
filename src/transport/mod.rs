//! Message transport between nodes: a per-node TCP server on the control
//! port and a connection-per-message client half.
//!
//! Connections carry one newline-framed envelope per message. On receipt the
//! server looks up a handler keyed by message type, invokes it, and writes
//! the returned response (if any) back on the same connection before
//! closing.

mod client;
mod server;

pub(crate) use server::{MessageHandler, Router};

use crate::options::NodeConfig;
use crate::proto::ProtoError;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the transport layer. Callers generally treat any of
/// these as "peer unavailable" and fail over or retry.
#[derive(Debug, Error)]
pub(crate) enum TransportError {
    #[error("i/o error talking to {peer}")]
    Io {
        peer: IpAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out waiting for {peer}")]
    Timeout { peer: IpAddr },
    #[error("peer {peer} closed the connection without responding")]
    NoResponse { peer: IpAddr },
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// The communication endpoint shared by every component of a node.
///
/// Owns the node identity (name, advertised address, control port) and
/// provides the request/response and fire-and-forget send modes.
pub(crate) struct Comm {
    pub(crate) name: String,
    pub(crate) ip: IpAddr,
    pub(crate) control_port: u16,
    pub(crate) logger: slog::Logger,
}

impl Comm {
    pub(crate) fn new(config: &NodeConfig) -> Arc<Self> {
        Arc::new(Comm {
            name: config.name.clone(),
            ip: config.ip,
            control_port: config.control_port,
            logger: config.logger.new(slog::o!("node" => config.name.clone())),
        })
    }
}
