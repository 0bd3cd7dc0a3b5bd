//! Error types at the service boundaries.

use std::io;

use learnify_core::wire::WireError;

/// Coarse classification the caller branches on.
///
/// Unreachable failures are worth retrying; NotFound means the peer is fine
/// but no longer has the video; Cancelled is not a failure at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unreachable,
    NotFound,
    Cancelled,
    Other,
}

/// Failure of a single request or transfer against a peer or the desktop server.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("cannot reach {addr}: {source}")]
    Unreachable { addr: String, source: io::Error },
    #[error("request to {addr} timed out")]
    Timeout { addr: String },
    #[error("HTTP {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transfer truncated at {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("Not connected to server")]
    NotConnected,
    #[error("{0:?} is not a valid video id")]
    InvalidVideoId(String),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Unreachable { .. } | TransferError::Timeout { .. } => {
                ErrorKind::Unreachable
            }
            TransferError::Status(404) => ErrorKind::NotFound,
            TransferError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }

    /// Whether the download manager should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransferError::Status(404)
                | TransferError::Cancelled
                | TransferError::NotConnected
                | TransferError::InvalidVideoId(_)
        )
    }
}

impl From<WireError> for TransferError {
    fn from(e: WireError) -> Self {
        TransferError::Malformed(e.to_string())
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        let addr = e
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "desktop server".to_string());
        if e.is_timeout() {
            TransferError::Timeout { addr }
        } else if let Some(status) = e.status() {
            TransferError::Status(status.as_u16())
        } else if e.is_connect() {
            TransferError::Unreachable {
                addr,
                source: io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()),
            }
        } else if e.is_decode() {
            TransferError::Malformed(e.to_string())
        } else {
            TransferError::Io(io::Error::other(e.to_string()))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("transfer server already running on port {0}")]
    AlreadyRunning(u16),
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("{0} is already in the download queue")]
    AlreadyQueued(String),
    #[error("{0} is not in the download queue")]
    UnknownVideo(String),
    #[error("{0:?} is not a valid video id")]
    InvalidVideoId(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SharingError {
    #[error("no peer selected")]
    NoPeerSelected,
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("advertisement socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to send advertisement: {0}")]
    Send(#[source] io::Error),
    #[error("invalid advertisement: {0}")]
    Wire(#[from] WireError),
    #[error("nothing is published")]
    NotPublished,
}
