//! Error types for the dispatch fabric

use core::fmt;
use std::io;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced through the queue API.
///
/// `WouldBlock` and `ConnAborted` are transient and recovered inside the
/// scheduler loop; the rest complete the owning token and reach the
/// worker's `work()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Operation not yet ready; retry via the scheduler.
    WouldBlock,

    /// Accept or I/O on a closed or reset connection.
    ConnAborted,

    /// Decoder saw a malformed frame (bad magic, oversized payload,
    /// truncated segment table).
    BadFrame,

    /// Underlying socket error other than would-block, by errno.
    Io(i32),

    /// Push/pop referenced a peer id that is not registered.
    NoPeer,

    /// The owning queue was closed while the operation was in flight.
    Aborted,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::WouldBlock => write!(f, "operation would block"),
            QueueError::ConnAborted => write!(f, "connection aborted"),
            QueueError::BadFrame => write!(f, "malformed frame"),
            QueueError::Io(errno) => {
                write!(f, "io error: {}", io::Error::from_raw_os_error(*errno))
            }
            QueueError::NoPeer => write!(f, "peer not registered"),
            QueueError::Aborted => write!(f, "queue closed with operation in flight"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<io::Error> for QueueError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::WouldBlock {
            return QueueError::WouldBlock;
        }
        match e.raw_os_error() {
            Some(libc::EPIPE) | Some(libc::ECONNRESET) | Some(libc::ECONNABORTED) => {
                QueueError::ConnAborted
            }
            Some(errno) => QueueError::Io(errno),
            None => QueueError::Io(libc::EIO),
        }
    }
}
