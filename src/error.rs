use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Errors surfaced by the toolkit.
///
/// I/O errors on an already-flowing connection or process stream are not
/// retried; the owning object reports the error once and expects the caller
/// to tear it down.
#[derive(Debug, Error)]
pub enum Error {
    #[error("file descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("socket is not connected")]
    NotConnected,

    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("command not found")]
    CommandNotFound,

    #[error("fork failed: {0}")]
    ForkFailed(#[source] io::Error),

    #[error("multiplexer failure: {0}")]
    MuxFailure(#[source] io::Error),

    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}
