//! Node roles.

use serde::{Deserialize, Serialize};

/// The role a node plays in the cluster. Routing, processing, storage and
/// auth nodes advertise their role in every heartbeat; registries answer
/// role-scoped discovery queries with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    /// Holds the membership table and answers discovery queries.
    #[display("REGISTRY")]
    Registry,
    /// Terminates FTP control connections.
    #[display("ROUTING")]
    Routing,
    /// Executes FTP verbs statelessly.
    #[display("PROCESSING")]
    Processing,
    /// Owns a namespaced filesystem and the PASV data plane.
    #[display("DATA")]
    Data,
    /// Validates credentials.
    #[display("AUTH")]
    Auth,
}
