use pageserver_api::models::PagestreamDecodeError;
use pageserver_api::reltag::{RelTag, SlruKind};
use postgres_ffi_types::constants::BLCKSZ;

/// Failures of a page server round trip.
///
/// `Remote` is an application-level answer from the page server and leaves the
/// connection usable. All other variants mean the connection can no longer be
/// trusted to deliver responses in order, and the client refuses further use.
#[derive(Debug, thiserror::Error)]
pub enum PageStoreError {
    #[error("could not decode page server response: {0}")]
    Decode(#[from] PagestreamDecodeError),

    #[error("page server protocol violation: {0}")]
    Protocol(String),

    #[error("page server returned error: {message}")]
    Remote { message: String },

    #[error("connection to page server is broken")]
    ConnectionBroken,

    #[error("page server connection failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors of the storage manager operations.
#[derive(Debug, thiserror::Error)]
pub enum SmgrError {
    #[error(transparent)]
    PageStore(#[from] PageStoreError),

    #[error("relation {0} is not open")]
    NotOpen(RelTag),

    #[error("invalid page buffer of {0} bytes, expected {}", BLCKSZ)]
    InvalidBufferSize(usize),

    #[error("cannot extend relation {0} beyond the maximum number of blocks")]
    TooManyBlocks(RelTag),

    #[error(
        "could not extend file because cluster size limit ({} MB) has been reached",
        limit_bytes / (1024 * 1024)
    )]
    ClusterSizeLimit { limit_bytes: u64 },

    #[error("in-memory storage overflow: cannot hold more than {0} pages")]
    InmemOverflow(usize),

    #[error("SLRU offset {0} is not the start of a page within a segment")]
    BadSlruOffset(u64),

    #[error("SLRU {0} is not served by the page server")]
    SlruNotRemote(SlruKind),

    #[error("WAL logging failed: {0:#}")]
    WalLog(#[source] anyhow::Error),
}

impl SmgrError {
    /// True if the page server explicitly refused the request.
    pub fn is_remote(&self) -> bool {
        matches!(self, SmgrError::PageStore(PageStoreError::Remote { .. }))
    }
}
