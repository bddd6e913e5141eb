mod channel;
mod chunk;
mod mem_channel;
mod path;

pub use channel::*;
pub use chunk::*;
pub use mem_channel::*;
pub use path::*;

use std::fmt;
use thiserror::Error;

#[macro_use]
extern crate log;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOp {
    Send,
    Fetch,
    Delete,
}

impl fmt::Display for TransferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOp::Send => write!(f, "send"),
            TransferOp::Fetch => write!(f, "fetch"),
            TransferOp::Delete => write!(f, "delete"),
        }
    }
}

/// One failed chunk operation inside a multi-chunk transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub seq: u32,
    pub handle: Option<BlobHandle>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferFailureDetail {
    pub op: TransferOp,
    pub failures: Vec<ChunkFailure>,
}

impl TransferFailureDetail {
    pub fn new(op: TransferOp, mut failures: Vec<ChunkFailure>) -> Self {
        failures.sort_by_key(|f| f.seq);
        Self { op, failures }
    }

    pub fn failed_seqs(&self) -> Vec<u32> {
        self.failures.iter().map(|f| f.seq).collect()
    }
}

impl fmt::Display for TransferFailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed for {} chunk(s):", self.op, self.failures.len())?;
        for failure in self.failures.iter() {
            write!(f, " #{} ({})", failure.seq, failure.reason)?;
        }
        Ok(())
    }
}

fn join_handles(handles: &[BlobHandle]) -> String {
    handles
        .iter()
        .map(|h| h.as_str())
        .collect::<Vec<&str>>()
        .join(",")
}

#[derive(Error, Debug)]
pub enum DavError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("transfer failure: {0}")]
    TransferFailure(TransferFailureDetail),
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),
    #[error("partial content, missing chunks: {0:?}")]
    PartialContent(Vec<u32>),
    /// Rollback could not remove every remote blob. `cause` is the error the
    /// caller would have seen otherwise.
    #[error("{cause} (orphaned remote blobs: {})", join_handles(.handles))]
    Orphaned {
        handles: Vec<BlobHandle>,
        cause: Box<DavError>,
    },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DavError {
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), DavError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root_cause(), DavError::Conflict(_))
    }

    /// Strips the advisory `Orphaned` wrapper.
    pub fn root_cause(&self) -> &DavError {
        match self {
            DavError::Orphaned { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub fn orphaned_handles(&self) -> &[BlobHandle] {
        match self {
            DavError::Orphaned { handles, .. } => handles.as_slice(),
            _ => &[],
        }
    }

    /// Status code a protocol front end should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            DavError::InvalidInput(_) => 400,
            DavError::NotFound(_) => 404,
            DavError::Conflict(_) => 409,
            DavError::Orphaned { cause, .. } => cause.status_code(),
            DavError::TransferFailure(_)
            | DavError::PartialContent(_)
            | DavError::RemoteError(_) => 502,
            DavError::Timeout(_) => 504,
            DavError::CorruptMetadata(_)
            | DavError::DbError(_)
            | DavError::IoError(_)
            | DavError::Internal(_) => 500,
        }
    }
}

pub type DavResult<T> = std::result::Result<T, DavError>;

impl From<std::io::Error> for DavError {
    fn from(err: std::io::Error) -> Self {
        DavError::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(DavError::NotFound("/a".to_string()).status_code(), 404);
        assert_eq!(DavError::Conflict("/a".to_string()).status_code(), 409);
        assert_eq!(DavError::InvalidInput("size".to_string()).status_code(), 400);
        assert_eq!(DavError::PartialContent(vec![1]).status_code(), 502);
        let detail = TransferFailureDetail::new(TransferOp::Send, vec![]);
        assert_eq!(DavError::TransferFailure(detail).status_code(), 502);
    }

    #[test]
    fn test_orphaned_wraps_cause() {
        let detail = TransferFailureDetail::new(
            TransferOp::Send,
            vec![ChunkFailure {
                seq: 2,
                handle: None,
                reason: "boom".to_string(),
            }],
        );
        let err = DavError::Orphaned {
            handles: vec![BlobHandle::new("h0"), BlobHandle::new("h1")],
            cause: Box::new(DavError::TransferFailure(detail)),
        };
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.orphaned_handles().len(), 2);
        assert!(matches!(err.root_cause(), DavError::TransferFailure(_)));
        let text = err.to_string();
        assert!(text.contains("#2 (boom)"));
        assert!(text.contains("h0,h1"));
    }

    #[test]
    fn test_failure_detail_sorted() {
        let detail = TransferFailureDetail::new(
            TransferOp::Fetch,
            vec![
                ChunkFailure {
                    seq: 3,
                    handle: None,
                    reason: "x".to_string(),
                },
                ChunkFailure {
                    seq: 1,
                    handle: None,
                    reason: "y".to_string(),
                },
            ],
        );
        assert_eq!(detail.failed_seqs(), vec![1, 3]);
    }
}
