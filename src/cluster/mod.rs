//! The distributed coordination fabric: node roles, subnet discovery,
//! the registry membership table and the gossip replication engine.

pub(crate) mod gossip;
pub(crate) mod locator;
pub(crate) mod probe;
pub mod registry;
mod role;

pub use registry::RegistryNode;
pub use role::NodeRole;

use serde::{Deserialize, Serialize};

/// A `(name, address)` reference to a node, as returned by discovery
/// queries and carried in heartbeat acks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    /// Node name.
    pub name: String,
    /// Node address.
    pub ip: String,
}

impl NodeRef {
    pub(crate) fn addr(&self) -> Option<std::net::IpAddr> {
        self.ip.parse().ok()
    }
}
