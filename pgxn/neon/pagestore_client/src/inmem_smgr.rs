//! Storage manager that keeps pages in process memory.
//!
//! Used by the WAL redo process, which reconstructs one page at a time from a
//! base image and WAL records. It must not call back into the page server, so
//! all blocks it touches live here, and there is no versioning: a read returns
//! the last bytes written.

use std::collections::{BTreeMap, HashMap};

use pageserver_api::reltag::RelTag;
use postgres_ffi_types::constants::{BLCKSZ, MAX_BLOCK_NUMBER};
use postgres_ffi_types::{BlockNumber, Oid};
use tracing::{debug, trace};
use utils::lsn::Lsn;

use crate::smgr::{check_page_size, OpenForks, Smgr};
use crate::SmgrError;

pub struct InmemSmgr {
    forks: OpenForks,
    /// Size of every fork that exists, in blocks.
    sizes: HashMap<RelTag, BlockNumber>,
    pages: BTreeMap<(RelTag, BlockNumber), Vec<u8>>,
    max_pages: usize,
}

impl InmemSmgr {
    pub fn new(max_pages: usize) -> Self {
        InmemSmgr {
            forks: OpenForks::default(),
            sizes: HashMap::new(),
            pages: BTreeMap::new(),
            max_pages,
        }
    }

    fn store(&mut self, rel: RelTag, blkno: BlockNumber, page: &[u8]) -> Result<(), SmgrError> {
        if let Some(stored) = self.pages.get_mut(&(rel, blkno)) {
            stored.copy_from_slice(page);
        } else {
            if self.pages.len() >= self.max_pages {
                return Err(SmgrError::InmemOverflow(self.max_pages));
            }
            self.pages.insert((rel, blkno), page.to_vec());
        }
        let size = self.sizes.entry(rel).or_insert(0);
        *size = (*size).max(blkno + 1);
        Ok(())
    }

    fn read_page(&self, rel: RelTag, blkno: BlockNumber, buf: &mut [u8]) {
        match self.pages.get(&(rel, blkno)) {
            Some(page) => buf.copy_from_slice(page),
            None => {
                // Redo may read a block before any record initialized it.
                trace!("block {blkno} of {rel} not in memory, returning zeros");
                buf.fill(0);
            }
        }
    }
}

impl Smgr for InmemSmgr {
    fn open(&mut self, rel: RelTag) {
        self.forks.open(rel);
    }

    fn close(&mut self, rel: RelTag) {
        self.forks.close(&rel);
    }

    fn create(&mut self, rel: RelTag, _is_redo: bool) -> Result<(), SmgrError> {
        self.forks.check(&rel)?;
        self.sizes.entry(rel).or_insert(0);
        Ok(())
    }

    fn exists(&mut self, rel: RelTag) -> Result<bool, SmgrError> {
        self.forks.check(&rel)?;
        Ok(self.sizes.contains_key(&rel))
    }

    fn unlink(&mut self, rel: RelTag, _is_redo: bool) -> Result<(), SmgrError> {
        self.sizes.remove(&rel);
        self.pages.retain(|(r, _), _| *r != rel);
        Ok(())
    }

    fn extend(
        &mut self,
        rel: RelTag,
        blkno: BlockNumber,
        page: &[u8],
        _skip_fsync: bool,
    ) -> Result<(), SmgrError> {
        self.forks.check(&rel)?;
        check_page_size(page)?;
        if blkno >= MAX_BLOCK_NUMBER {
            return Err(SmgrError::TooManyBlocks(rel));
        }
        self.store(rel, blkno, page)
    }

    fn prefetch(&mut self, rel: RelTag, _blkno: BlockNumber) -> Result<bool, SmgrError> {
        self.forks.check(&rel)?;
        Ok(false)
    }

    fn reset_prefetch(&mut self, _rel: RelTag) {}

    fn read(&mut self, rel: RelTag, blkno: BlockNumber, buf: &mut [u8]) -> Result<(), SmgrError> {
        self.forks.check(&rel)?;
        check_page_size(buf)?;
        self.read_page(rel, blkno, buf);
        Ok(())
    }

    fn read_at_lsn(
        &mut self,
        rel: RelTag,
        blkno: BlockNumber,
        _lsn: Lsn,
        _latest: bool,
        buf: &mut [u8],
    ) -> Result<(), SmgrError> {
        check_page_size(buf)?;
        self.read_page(rel, blkno, buf);
        Ok(())
    }

    fn write(
        &mut self,
        rel: RelTag,
        blkno: BlockNumber,
        page: &[u8],
        _skip_fsync: bool,
    ) -> Result<(), SmgrError> {
        self.forks.check(&rel)?;
        check_page_size(page)?;
        self.store(rel, blkno, page)
    }

    fn writeback(
        &mut self,
        rel: RelTag,
        _blkno: BlockNumber,
        _nblocks: BlockNumber,
    ) -> Result<(), SmgrError> {
        self.forks.check(&rel)
    }

    fn nblocks(&mut self, rel: RelTag) -> Result<BlockNumber, SmgrError> {
        self.forks.check(&rel)?;
        Ok(self.sizes.get(&rel).copied().unwrap_or(0))
    }

    fn dbsize(&mut self, dbnode: Oid) -> Result<i64, SmgrError> {
        let blocks: i64 = self
            .sizes
            .iter()
            .filter(|(rel, _)| rel.dbnode == dbnode)
            .map(|(_, nblocks)| i64::from(*nblocks))
            .sum();
        Ok(blocks * BLCKSZ as i64)
    }

    fn truncate(&mut self, rel: RelTag, nblocks: BlockNumber) -> Result<(), SmgrError> {
        self.forks.check(&rel)?;
        debug!("truncate in-memory {rel} to {nblocks} blocks");
        self.pages
            .retain(|(r, blkno), _| *r != rel || *blkno < nblocks);
        self.sizes.insert(rel, nblocks);
        Ok(())
    }

    fn immedsync(&mut self, rel: RelTag) -> Result<(), SmgrError> {
        self.forks.check(&rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{test_page, test_rel};

    fn setup(max_pages: usize) -> InmemSmgr {
        let mut smgr = InmemSmgr::new(max_pages);
        smgr.open(test_rel(1));
        smgr.open(test_rel(2));
        smgr
    }

    #[test]
    fn last_write_wins() {
        let mut smgr = setup(10);
        let rel = test_rel(1);
        let mut buf = vec![0u8; BLCKSZ as usize];

        smgr.extend(rel, 0, &test_page(1), false).unwrap();
        smgr.write(rel, 0, &test_page(2), false).unwrap();
        smgr.read(rel, 0, &mut buf).unwrap();
        assert_eq!(buf, test_page(2));

        // no versions, the LSN is ignored
        smgr.read_at_lsn(rel, 0, Lsn(1), false, &mut buf).unwrap();
        assert_eq!(buf, test_page(2));
    }

    #[test]
    fn unwritten_blocks_read_as_zeros() {
        let mut smgr = setup(10);
        let mut buf = vec![7u8; BLCKSZ as usize];
        smgr.read(test_rel(1), 5, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn size_and_existence_are_local() {
        let mut smgr = setup(10);
        let rel = test_rel(1);
        let other = test_rel(2);

        assert!(!smgr.exists(rel).unwrap());
        smgr.create(other, true).unwrap();
        assert!(smgr.exists(other).unwrap());
        assert_eq!(smgr.nblocks(other).unwrap(), 0);

        smgr.extend(rel, 0, &test_page(1), false).unwrap();
        smgr.write(rel, 4, &test_page(1), false).unwrap();
        assert!(smgr.exists(rel).unwrap());
        assert_eq!(smgr.nblocks(rel).unwrap(), 5);
        assert_eq!(smgr.dbsize(5).unwrap(), 5 * BLCKSZ as i64);

        smgr.truncate(rel, 3).unwrap();
        assert_eq!(smgr.nblocks(rel).unwrap(), 3);
        assert_eq!(smgr.dbsize(5).unwrap(), 3 * BLCKSZ as i64);
        // the truncated block is gone, the ones below the new size read as zeros
        let mut buf = vec![7u8; BLCKSZ as usize];
        smgr.read(rel, 2, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        smgr.write(rel, 1, &test_page(2), false).unwrap();
        assert_eq!(smgr.nblocks(rel).unwrap(), 3);

        smgr.unlink(rel, true).unwrap();
        assert!(!smgr.exists(rel).unwrap());
        assert_eq!(smgr.nblocks(rel).unwrap(), 0);
        assert_eq!(smgr.dbsize(5).unwrap(), 0);
    }

    #[test]
    fn capacity_is_bounded() {
        let mut smgr = setup(2);
        let rel = test_rel(1);
        smgr.write(rel, 0, &test_page(1), false).unwrap();
        smgr.write(rel, 1, &test_page(1), false).unwrap();
        assert!(matches!(
            smgr.write(rel, 2, &test_page(1), false),
            Err(SmgrError::InmemOverflow(2))
        ));
        // rewriting a stored block needs no room
        smgr.write(rel, 1, &test_page(3), false).unwrap();
    }

    #[test]
    fn no_prefetching() {
        let mut smgr = setup(10);
        assert!(!smgr.prefetch(test_rel(1), 0).unwrap());
        smgr.reset_prefetch(test_rel(1));
        assert!(matches!(
            smgr.prefetch(test_rel(3), 0),
            Err(SmgrError::NotOpen(_))
        ));
    }
}
