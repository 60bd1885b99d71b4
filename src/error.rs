use std::path::{Path, PathBuf};
use std::time::Duration;

/// Failures of a single transfer. These are raised through `anyhow` and can be recovered with
///  `downcast_ref::<TransferError>()`; anything else in an error chain is a local failure
///  reported verbatim.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer did not complete within {0:?}")]
    GlobalTimeout(Duration),
    #[error("no datagram from peer for {retries} x {timeout:?}")]
    PeerSilent { timeout: Duration, retries: u32 },
    #[error("no ACK progress after {0} consecutive timeouts")]
    AckTimeouts(u32),
    #[error("no response from peer after {0} attempts")]
    NoResponse(u32),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid offset {offset}: {reason}")]
    InvalidOffset { offset: u64, reason: String },
    #[error("invalid filename '{0}'")]
    InvalidFilename(String),
    #[error("rejected by peer: {0}")]
    Rejected(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("received {actual} bytes, but {expected} bytes were announced")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    pub fn io(path: &Path, source: std::io::Error) -> TransferError {
        TransferError::Io { path: path.to_path_buf(), source }
    }

    /// Timeouts and silence may go away on a later attempt, everything else needs a change on
    ///  one of the peers first
    pub fn is_transient(&self) -> bool {
        matches!(self,
            TransferError::GlobalTimeout(_) |
            TransferError::PeerSilent { .. } |
            TransferError::AckTimeouts(_) |
            TransferError::NoResponse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::global_timeout(TransferError::GlobalTimeout(Duration::from_secs(300)), "transfer did not complete within 300s", true)]
    #[case::silent(TransferError::PeerSilent { timeout: Duration::from_secs(1), retries: 3 }, "no datagram from peer for 3 x 1s", true)]
    #[case::offset(TransferError::InvalidOffset { offset: 5, reason: "not chunk aligned".to_string() }, "invalid offset 5: not chunk aligned", false)]
    #[case::rejected(TransferError::Rejected("File not found".to_string()), "rejected by peer: File not found", false)]
    #[case::size(TransferError::SizeMismatch { expected: 10, actual: 8 }, "received 8 bytes, but 10 bytes were announced", false)]
    #[case::ack_timeouts(TransferError::AckTimeouts(50), "no ACK progress after 50 consecutive timeouts", true)]
    fn test_display(#[case] error: TransferError, #[case] expected: &str, #[case] transient: bool) {
        assert_eq!(error.to_string(), expected);
        assert_eq!(error.is_transient(), transient);
    }

    #[test]
    fn test_downcast_through_anyhow() {
        fn fail() -> anyhow::Result<()> {
            Err(TransferError::NotFound("a.txt".to_string()).into())
        }

        let err = fail().unwrap_err();
        assert!(matches!(err.downcast_ref::<TransferError>(), Some(TransferError::NotFound(name)) if name == "a.txt"));
    }
}
