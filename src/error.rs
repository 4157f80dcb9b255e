//! Errors surfaced when constructing and running nodes.

use thiserror::Error;

/// The error returned by a node's `serve` entry point.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A listener could not be bound or failed during setup.
    #[error("i/o error while starting node: {0}")]
    Io(#[from] std::io::Error),
    /// The node configuration is unusable.
    #[error(transparent)]
    Config(#[from] crate::options::ConfigError),
    /// The control-port transport failed during setup.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The background server task ended unexpectedly.
    #[error("node server task terminated")]
    Terminated,
    /// The storage backend failed to initialize.
    #[error("storage setup failed: {0}")]
    StorageSetup(String),
}

impl From<crate::transport::TransportError> for ServerError {
    fn from(err: crate::transport::TransportError) -> Self {
        match err {
            crate::transport::TransportError::Io { source, .. } => ServerError::Io(source),
            other => ServerError::Transport(other.to_string()),
        }
    }
}
