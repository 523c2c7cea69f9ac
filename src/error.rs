//! Error taxonomy shared by the signer, the dispatcher, the multipart
//! controller and the transfer scheduler.

use crate::transfer::ByteRange;
use thiserror::Error;

/// Service error codes that indicate a transient condition on the server side.
const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "InternalError",
    "ServiceUnavailable",
    "RequestTimeout",
];

/// s3xfer errors
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid signing or transfer parameters. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing or malformed key material. Never retried.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Network-layer failure (connect, TLS, timeout, broken body stream).
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response parsed into the service's error code and message.
    #[error("service error: {status} {code} - {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    /// Downloaded byte count does not match the declared object size.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// A transfer stopped before every range completed.
    #[error(
        "transfer failed: {} range(s) completed, {} range(s) failed: {cause}",
        .completed_ranges.len(),
        .failed_ranges.len()
    )]
    PartialTransferFailure {
        completed_ranges: Vec<ByteRange>,
        failed_ranges: Vec<ByteRange>,
        cause: Box<Error>,
    },

    /// A multipart upload was aborted after a failure.
    #[error("upload {upload_id} aborted: {reason}{}", orphan_note(.orphaned))]
    AbortedUpload {
        upload_id: String,
        reason: String,
        orphaned: bool,
    },

    /// Abort could not be delivered; the server-side upload still exists.
    #[error("abort of upload {upload_id} failed, clean up out of band: {cause}")]
    OrphanedUpload { upload_id: String, cause: Box<Error> },

    /// Completion failed at the transport level; the server may have completed
    /// the upload anyway. Check object existence before retrying.
    #[error("completion of upload {upload_id} is ambiguous: {cause}")]
    CompletionAmbiguous { upload_id: String, cause: Box<Error> },

    /// Completion attempted with zero parts or a gap in part numbers.
    #[error("cannot complete upload, missing parts: {missing:?}")]
    IncompleteUpload { missing: Vec<u32> },

    /// Multipart controller operation not valid in the current state.
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("XML parse error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn orphan_note(orphaned: &bool) -> &'static str {
    if *orphaned {
        " (abort failed, upload orphaned)"
    } else {
        ""
    }
}

impl Error {
    /// Whether the scheduler may retry the failed request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Service { status, code, .. } => {
                *status >= 500 || *status == 429 || TRANSIENT_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    /// HTTP status of a service error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Service { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err.to_string())
    }
}

impl From<hyper::http::Error> for Error {
    fn from(err: hyper::http::Error) -> Self {
        Error::Transport(format!("request build error: {}", err))
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Error::Transport(format!("client error: {}", err))
    }
}
