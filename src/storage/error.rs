//! The error type produced by the filesystem manager. Kinds map one-to-one
//! onto the FTP failure replies the processing node emits.

use crate::BoxError;
use derive_more::Display;
use thiserror::Error;

/// A failed filesystem operation.
#[derive(Debug, Error)]
#[error("filesystem error: {kind}")]
pub struct FsError {
    kind: FsErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl FsError {
    /// Creates an error of `kind` wrapping an underlying cause.
    pub fn new<E>(kind: FsErrorKind, source: E) -> FsError
    where
        E: Into<BoxError>,
    {
        FsError {
            kind,
            source: Some(source.into()),
        }
    }

    /// What went wrong, for mapping onto an FTP reply.
    pub fn kind(&self) -> FsErrorKind {
        self.kind
    }

    /// The message shown to FTP clients.
    pub fn user_message(&self) -> &'static str {
        match self.kind {
            FsErrorKind::NotFound => "Path not found",
            FsErrorKind::NotAFile => "Not a file",
            FsErrorKind::NotADirectory => "Not a directory",
            FsErrorKind::AlreadyExists => "Already exists",
            FsErrorKind::NotEmpty => "Directory not empty",
            FsErrorKind::SecurityViolation => "Invalid path",
            FsErrorKind::Io => "Local filesystem error",
        }
    }
}

impl From<FsErrorKind> for FsError {
    fn from(kind: FsErrorKind) -> FsError {
        FsError { kind, source: None }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> FsError {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => FsErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => FsErrorKind::AlreadyExists,
            _ => FsErrorKind::Io,
        };
        FsError {
            kind,
            source: Some(Box::new(err)),
        }
    }
}

/// Failure categories for filesystem operations.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum FsErrorKind {
    /// The path does not exist.
    #[display("path not found")]
    NotFound,
    /// A file operation hit a directory.
    #[display("not a file")]
    NotAFile,
    /// A directory operation hit a file.
    #[display("not a directory")]
    NotADirectory,
    /// Create refused because the target exists.
    #[display("already exists")]
    AlreadyExists,
    /// Directory removal refused because it has entries.
    #[display("directory not empty")]
    NotEmpty,
    /// The resolved path escapes the user's namespace.
    #[display("path escapes the namespace")]
    SecurityViolation,
    /// Any other I/O failure.
    #[display("i/o failure")]
    Io,
}
