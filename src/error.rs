use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Failures are split along the recovery boundary: the first three variants
/// are scoped to a single connection and handled by disconnecting it, the
/// last two are infrastructure failures that bring the server down.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("connection closed")]
    Closed,

    #[error("broken pipe: peer went away mid-write")]
    BrokenPipe,

    #[error("message too long: {len} bytes")]
    TooLong { len: usize },

    #[error("reactor failure: {0}")]
    Reactor(#[source] io::Error),

    #[error("queue notification failure: {0}")]
    Queue(#[source] io::Error),
}

impl ChatError {
    /// Maps an I/O error raised by a client socket onto the per-connection
    /// taxonomy. Everything that is not a local broken pipe means the
    /// connection is unusable.
    pub(crate) fn from_socket_io(err: io::Error) -> ChatError {
        match err.kind() {
            io::ErrorKind::BrokenPipe => ChatError::BrokenPipe,
            _ => ChatError::Closed,
        }
    }
}
