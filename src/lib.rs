#![deny(clippy::all)]
#![forbid(unsafe_code)]

//! libdftp is a distributed, role-partitioned FTP server library.
//!
//! A cluster built with libdftp exposes an RFC 959 compatible control
//! interface while spreading responsibilities over specialised nodes:
//!
//! * [`RegistryNode`](cluster::RegistryNode): membership table, discovery queries
//! * [`AuthNode`](auth::AuthNode): bcrypt credential checks over a replicated user table
//! * [`RoutingNode`](routing::RoutingNode): terminates FTP control connections
//! * [`ProcessingNode`](processing::ProcessingNode): stateless FTP verb execution
//! * [`StorageNode`](storage::StorageNode): namespaced filesystem, PASV data channels,
//!   quorum-acknowledged replication
//!
//! Nodes find each other by probing a shared subnet (`DFTP_SUBNET`) for
//! registries and converge replicated state through a gossip engine:
//! leader-coordinated pairwise merges plus per-write update broadcasts.
//!
//! It runs on top of the Tokio asynchronous run-time and tries to make use of
//! Async IO as much as possible.
//!
//! # Quick start
//!
//! ```no_run
//! use libdftp::options::NodeConfig;
//! use libdftp::storage::StorageNode;
//!
//! #[tokio::main]
//! pub async fn main() {
//!     // DFTP_SUBNET must name the subnet the cluster lives on.
//!     let config = NodeConfig::new("data-1", "10.0.0.7".parse().unwrap()).unwrap();
//!     let node = StorageNode::new(config, "/srv/dftp").await.unwrap();
//!     node.serve().await.unwrap();
//! }
//! ```

pub mod auth;
pub mod cluster;
pub mod error;
pub mod options;
pub mod processing;
pub mod proto;
pub mod routing;
pub mod storage;
pub(crate) mod transport;

pub use error::ServerError;
pub use options::NodeConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
