//! Storage for the cluster: the per-user namespaced filesystem, the file
//! metadata table, and the storage node that serves them over the wire.

pub mod error;
pub(crate) mod fs;
pub mod meta;
mod node;

pub use error::{FsError, FsErrorKind};
pub use fs::EntryStat;
pub use meta::FileMetadata;
pub use node::StorageNode;

#[cfg(test)]
mod tests;
