//! The storage manager interface the host database calls into.
//!
//! Operations address one relation fork ([`RelTag`]) and whole pages of
//! `BLCKSZ` bytes. Block-level operations require the fork to have been opened
//! in this session first.

use std::collections::HashSet;

use pageserver_api::reltag::RelTag;
use postgres_ffi_types::constants::BLCKSZ;
use postgres_ffi_types::{BlockNumber, Oid};
use utils::lsn::Lsn;

use crate::SmgrError;

pub trait Smgr {
    fn open(&mut self, rel: RelTag);
    fn close(&mut self, rel: RelTag);

    fn create(&mut self, rel: RelTag, is_redo: bool) -> Result<(), SmgrError>;
    fn exists(&mut self, rel: RelTag) -> Result<bool, SmgrError>;
    fn unlink(&mut self, rel: RelTag, is_redo: bool) -> Result<(), SmgrError>;

    /// Add a block at `blkno`, which is normally the current size of the fork.
    fn extend(
        &mut self,
        rel: RelTag,
        blkno: BlockNumber,
        page: &[u8],
        skip_fsync: bool,
    ) -> Result<(), SmgrError>;

    /// Start fetching a block that is likely to be read soon. Returns whether
    /// the request was queued; `false` is a hint, never an error.
    fn prefetch(&mut self, rel: RelTag, blkno: BlockNumber) -> Result<bool, SmgrError>;

    /// Ignore any outstanding or completed prefetches of the fork.
    fn reset_prefetch(&mut self, rel: RelTag);

    fn read(&mut self, rel: RelTag, blkno: BlockNumber, buf: &mut [u8]) -> Result<(), SmgrError>;

    /// Read a block as of `lsn`, or the latest version not older than `lsn`.
    fn read_at_lsn(
        &mut self,
        rel: RelTag,
        blkno: BlockNumber,
        lsn: Lsn,
        latest: bool,
        buf: &mut [u8],
    ) -> Result<(), SmgrError>;

    fn write(
        &mut self,
        rel: RelTag,
        blkno: BlockNumber,
        page: &[u8],
        skip_fsync: bool,
    ) -> Result<(), SmgrError>;

    fn writeback(
        &mut self,
        rel: RelTag,
        blkno: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<(), SmgrError>;

    fn nblocks(&mut self, rel: RelTag) -> Result<BlockNumber, SmgrError>;
    fn dbsize(&mut self, dbnode: Oid) -> Result<i64, SmgrError>;
    fn truncate(&mut self, rel: RelTag, nblocks: BlockNumber) -> Result<(), SmgrError>;
    fn immedsync(&mut self, rel: RelTag) -> Result<(), SmgrError>;
}

/// Forks opened in this session.
#[derive(Debug, Default)]
pub(crate) struct OpenForks(HashSet<RelTag>);

impl OpenForks {
    pub fn open(&mut self, rel: RelTag) {
        self.0.insert(rel);
    }

    pub fn close(&mut self, rel: &RelTag) {
        self.0.remove(rel);
    }

    pub fn check(&self, rel: &RelTag) -> Result<(), SmgrError> {
        if self.0.contains(rel) {
            Ok(())
        } else {
            Err(SmgrError::NotOpen(*rel))
        }
    }
}

pub(crate) fn check_page_size(buf: &[u8]) -> Result<(), SmgrError> {
    if buf.len() == BLCKSZ as usize {
        Ok(())
    } else {
        Err(SmgrError::InvalidBufferSize(buf.len()))
    }
}
