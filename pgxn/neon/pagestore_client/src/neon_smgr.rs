//! Storage manager that keeps no relation data locally.
//!
//! Reads, existence checks and sizes are served by the page server. Writes never
//! go to the page server directly: a modified page reaches it through the WAL,
//! so writing a page means making sure it is WAL-logged, and later reads ask for
//! a version at least as new as the last WAL written by this session.
//!
//! Prefetch requests are pipelined on the same connection as synchronous ones.
//! Since responses come back in request order, all outstanding prefetch
//! responses are received and stashed before any synchronous request is sent.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use pageserver_api::models::{
    PagestreamBeMessage, PagestreamDbSizeRequest, PagestreamExistsRequest, PagestreamFeMessage,
    PagestreamGetPageRequest, PagestreamNblocksRequest, PagestreamRequestHeader,
};
use pageserver_api::reltag::RelTag;
use postgres_ffi_types::constants::MAX_BLOCK_NUMBER;
use postgres_ffi_types::page::{page_get_lsn, page_is_all_zeros};
use postgres_ffi_types::{BlockNumber, Oid};
use tracing::{debug, trace, warn};
use utils::lsn::Lsn;

use crate::client::PageServerApi;
use crate::config::PageStoreConf;
use crate::relsize_cache::RelSizeCache;
use crate::slru::RemoteSlruKinds;
use crate::smgr::{check_page_size, OpenForks, Smgr};
use crate::{PageStoreError, SmgrError};

/// The host's WAL, as far as the storage manager needs it.
pub trait WalLog {
    /// Write a full-page image record for the page, returning its end LSN.
    fn log_page(&mut self, rel: RelTag, blkno: BlockNumber, page: &[u8]) -> anyhow::Result<Lsn>;

    /// Make WAL up to `upto` durable, so that the page server can receive it.
    fn flush(&mut self, upto: Lsn) -> anyhow::Result<()>;
}

/// Which page versions requests ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLsnPolicy {
    /// The newest version, which must include everything this session wrote.
    Latest,
    /// The version as of a fixed LSN, e.g. on a read-only replica.
    Pinned(Lsn),
}

struct PrefetchRequest {
    rel: RelTag,
    blkno: BlockNumber,
    hdr: PagestreamRequestHeader,
    discarded: bool,
}

impl PrefetchRequest {
    fn is_for(&self, rel: &RelTag, blkno: BlockNumber) -> bool {
        !self.discarded && self.rel == *rel && self.blkno == blkno
    }
}

struct PrefetchedPage {
    hdr: PagestreamRequestHeader,
    page: Bytes,
    /// Arrival order, the oldest unread page is evicted first.
    seq: u64,
}

/// A prefetched page can stand in for a read only if it was requested at a
/// version the read would accept.
fn prefetch_satisfies(prefetched: &PagestreamRequestHeader, wanted: &PagestreamRequestHeader) -> bool {
    if wanted.latest {
        prefetched.latest && prefetched.lsn >= wanted.lsn
    } else {
        !prefetched.latest && prefetched.lsn == wanted.lsn
    }
}

fn unexpected(response: PagestreamBeMessage) -> SmgrError {
    PageStoreError::Protocol(format!("unexpected {} response", response.kind())).into()
}

pub struct NeonSmgr<C, W> {
    client: C,
    wal: W,
    relsize_cache: RelSizeCache,
    forks: OpenForks,

    policy: RequestLsnPolicy,
    last_written_lsn: Lsn,
    flushed_lsn: Lsn,

    inflight_prefetches: VecDeque<PrefetchRequest>,
    ready_prefetches: HashMap<(RelTag, BlockNumber), PrefetchedPage>,
    prefetch_seq: u64,
    /// Bound on outstanding and ready prefetches together.
    max_prefetch_requests: usize,

    max_cluster_size: Option<u64>,
    current_cluster_size: u64,

    pub(crate) remote_slru: RemoteSlruKinds,
}

impl<C: PageServerApi, W: WalLog> NeonSmgr<C, W> {
    pub fn new(client: C, wal: W, conf: &PageStoreConf) -> Self {
        NeonSmgr {
            client,
            wal,
            relsize_cache: RelSizeCache::new(conf.relsize_cache_entries),
            forks: OpenForks::default(),
            policy: RequestLsnPolicy::Latest,
            last_written_lsn: Lsn::INVALID,
            flushed_lsn: Lsn::INVALID,
            inflight_prefetches: VecDeque::new(),
            ready_prefetches: HashMap::new(),
            prefetch_seq: 0,
            max_prefetch_requests: conf.max_prefetch_requests,
            max_cluster_size: conf.max_cluster_size_bytes(),
            current_cluster_size: 0,
            remote_slru: RemoteSlruKinds::from_conf(conf),
        }
    }

    pub fn set_request_lsn_policy(&mut self, policy: RequestLsnPolicy) {
        self.policy = policy;
    }

    pub fn last_written_lsn(&self) -> Lsn {
        self.last_written_lsn
    }

    /// Let the session know about WAL it wrote outside of the storage manager,
    /// e.g. a truncation record.
    pub fn set_last_written_lsn(&mut self, lsn: Lsn) {
        self.last_written_lsn = self.last_written_lsn.max(lsn);
    }

    /// Size of the whole cluster in bytes, as last reported by the host.
    pub fn set_current_cluster_size(&mut self, size: u64) {
        self.current_cluster_size = size;
    }

    pub fn relsize_cache(&self) -> &RelSizeCache {
        &self.relsize_cache
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn wal(&self) -> &W {
        &self.wal
    }

    pub(crate) fn request_hdr(&mut self) -> Result<PagestreamRequestHeader, SmgrError> {
        match self.policy {
            RequestLsnPolicy::Pinned(lsn) => Ok(PagestreamRequestHeader::at_lsn(lsn)),
            RequestLsnPolicy::Latest => {
                let lsn = self.last_written_lsn;
                // The page server waits for WAL up to the request LSN to arrive,
                // so it must be on its way before we ask.
                if lsn > self.flushed_lsn {
                    self.wal.flush(lsn).map_err(SmgrError::WalLog)?;
                    self.flushed_lsn = lsn;
                }
                Ok(PagestreamRequestHeader::latest(lsn))
            }
        }
    }

    /// Send a synchronous request and wait for its response.
    pub(crate) fn round_trip(
        &mut self,
        request: PagestreamFeMessage,
    ) -> Result<PagestreamBeMessage, SmgrError> {
        self.drain_prefetches()?;
        Ok(self.client.request(&request)?)
    }

    fn drain_prefetches(&mut self) -> Result<(), SmgrError> {
        while let Some(prefetch) = self.inflight_prefetches.pop_front() {
            self.complete_prefetch(prefetch)?;
        }
        Ok(())
    }

    /// Receive the response to a prefetch and stash the page unless the
    /// prefetch was discarded meanwhile.
    fn complete_prefetch(&mut self, prefetch: PrefetchRequest) -> Result<(), SmgrError> {
        match self.client.receive() {
            Ok(PagestreamBeMessage::GetPage(response)) => {
                if prefetch.discarded {
                    trace!("dropping discarded prefetch of block {} of {}", prefetch.blkno, prefetch.rel);
                } else {
                    self.prefetch_seq += 1;
                    self.ready_prefetches.insert(
                        (prefetch.rel, prefetch.blkno),
                        PrefetchedPage {
                            hdr: prefetch.hdr,
                            page: response.page,
                            seq: self.prefetch_seq,
                        },
                    );
                }
                Ok(())
            }
            Ok(other) => Err(unexpected(other)),
            // A failed prefetch does not fail the operation that happens to drain
            // it. A read of the block asks again and gets the error then.
            Err(PageStoreError::Remote { message }) => {
                debug!(
                    "prefetch of block {} of {} failed: {message}",
                    prefetch.blkno, prefetch.rel
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn evict_oldest_prefetched(&mut self) {
        let oldest = self
            .ready_prefetches
            .iter()
            .min_by_key(|(_, prefetched)| prefetched.seq)
            .map(|(key, _)| *key);
        if let Some((rel, blkno)) = oldest {
            trace!("evicting unread prefetched block {blkno} of {rel}");
            self.ready_prefetches.remove(&(rel, blkno));
        }
    }

    fn discard_prefetches(&mut self, rel: &RelTag, from_blkno: BlockNumber) {
        for prefetch in self.inflight_prefetches.iter_mut() {
            if prefetch.rel == *rel && prefetch.blkno >= from_blkno {
                prefetch.discarded = true;
            }
        }
        self.ready_prefetches
            .retain(|(r, blkno), _| !(r == rel && *blkno >= from_blkno));
    }

    fn discard_prefetched_block(&mut self, rel: &RelTag, blkno: BlockNumber) {
        for prefetch in self.inflight_prefetches.iter_mut() {
            if prefetch.is_for(rel, blkno) {
                prefetch.discarded = true;
            }
        }
        self.ready_prefetches.remove(&(*rel, blkno));
    }

    fn read_page(
        &mut self,
        rel: RelTag,
        blkno: BlockNumber,
        hdr: PagestreamRequestHeader,
        buf: &mut [u8],
    ) -> Result<(), SmgrError> {
        if let Some(prefetched) = self.ready_prefetches.remove(&(rel, blkno)) {
            if prefetch_satisfies(&prefetched.hdr, &hdr) {
                trace!("block {blkno} of {rel} was prefetched");
                buf.copy_from_slice(&prefetched.page);
                return Ok(());
            }
        }

        if self
            .inflight_prefetches
            .iter()
            .any(|prefetch| prefetch.is_for(&rel, blkno))
        {
            while let Some(prefetch) = self.inflight_prefetches.pop_front() {
                if !prefetch.is_for(&rel, blkno) {
                    self.complete_prefetch(prefetch)?;
                    continue;
                }
                let usable = prefetch_satisfies(&prefetch.hdr, &hdr);
                match self.client.receive() {
                    Ok(PagestreamBeMessage::GetPage(response)) if usable => {
                        trace!("block {blkno} of {rel} was prefetched");
                        buf.copy_from_slice(&response.page);
                        return Ok(());
                    }
                    Ok(PagestreamBeMessage::GetPage(_)) => break,
                    Ok(other) => return Err(unexpected(other)),
                    Err(e @ PageStoreError::Remote { .. }) if usable => return Err(e.into()),
                    Err(PageStoreError::Remote { .. }) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let request = PagestreamFeMessage::GetPage(PagestreamGetPageRequest { hdr, rel, blkno });
        match self.round_trip(request)? {
            PagestreamBeMessage::GetPage(response) => {
                buf.copy_from_slice(&response.page);
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Make sure the page server will see this version of the page, and
    /// remember how far this session has written.
    fn wal_log_page(
        &mut self,
        rel: RelTag,
        blkno: BlockNumber,
        page: &[u8],
    ) -> Result<(), SmgrError> {
        let mut lsn = Lsn(page_get_lsn(page));
        if !lsn.is_valid() {
            if page_is_all_zeros(page) {
                // All-zeros pages are what the page server returns for blocks it
                // has no WAL for, nothing to log.
                trace!("block {blkno} of {rel} is all-zeros, not WAL-logging");
                return Ok(());
            }
            lsn = self
                .wal
                .log_page(rel, blkno, page)
                .map_err(SmgrError::WalLog)?;
            debug!("WAL-logged block {blkno} of {rel} at {lsn}");
        }
        self.last_written_lsn = self.last_written_lsn.max(lsn);
        Ok(())
    }
}

impl<C: PageServerApi, W: WalLog> Smgr for NeonSmgr<C, W> {
    fn open(&mut self, rel: RelTag) {
        self.forks.open(rel);
    }

    fn close(&mut self, rel: RelTag) {
        self.forks.close(&rel);
    }

    fn create(&mut self, rel: RelTag, is_redo: bool) -> Result<(), SmgrError> {
        self.forks.check(&rel)?;
        // Nothing to create remotely: the fork appears on the page server with
        // its first WAL record. A size cached for a previous incarnation is stale.
        debug!("create {rel} (redo: {is_redo})");
        self.relsize_cache.forget(&rel);
        Ok(())
    }

    fn exists(&mut self, rel: RelTag) -> Result<bool, SmgrError> {
        self.forks.check(&rel)?;
        let hdr = self.request_hdr()?;
        match self.round_trip(PagestreamFeMessage::Exists(PagestreamExistsRequest { hdr, rel }))? {
            PagestreamBeMessage::Exists(response) => Ok(response.exists),
            other => Err(unexpected(other)),
        }
    }

    fn unlink(&mut self, rel: RelTag, is_redo: bool) -> Result<(), SmgrError> {
        debug!("unlink {rel} (redo: {is_redo})");
        self.relsize_cache.forget(&rel);
        self.discard_prefetches(&rel, 0);
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
        if let Some(limit_bytes) = self.max_cluster_size {
            if self.current_cluster_size >= limit_bytes {
                warn!(
                    "refusing to extend {rel}: cluster size {} reached limit of {limit_bytes} bytes",
                    self.current_cluster_size
                );
                return Err(SmgrError::ClusterSizeLimit { limit_bytes });
            }
        }

        self.wal_log_page(rel, blkno, page)?;
        self.relsize_cache.update(rel, blkno + 1);
        self.discard_prefetched_block(&rel, blkno);
        Ok(())
    }

    fn prefetch(&mut self, rel: RelTag, blkno: BlockNumber) -> Result<bool, SmgrError> {
        self.forks.check(&rel)?;
        if self.ready_prefetches.contains_key(&(rel, blkno))
            || self
                .inflight_prefetches
                .iter()
                .any(|prefetch| prefetch.is_for(&rel, blkno))
        {
            return Ok(true);
        }
        if self.inflight_prefetches.len() >= self.max_prefetch_requests {
            trace!("prefetch queue is full, not prefetching block {blkno} of {rel}");
            return Ok(false);
        }
        let slots_used = self.inflight_prefetches.len() + self.ready_prefetches.len();
        if slots_used >= self.max_prefetch_requests {
            self.evict_oldest_prefetched();
        }

        let hdr = self.request_hdr()?;
        let request = PagestreamFeMessage::GetPage(PagestreamGetPageRequest { hdr, rel, blkno });
        if let Err(e) = self.client.send(&request) {
            warn!("could not send prefetch request: {e}");
            return Ok(false);
        }
        self.inflight_prefetches.push_back(PrefetchRequest {
            rel,
            blkno,
            hdr,
            discarded: false,
        });
        if let Err(e) = self.client.flush() {
            warn!("could not flush prefetch request: {e}");
            return Ok(false);
        }
        Ok(true)
    }

    fn reset_prefetch(&mut self, rel: RelTag) {
        self.discard_prefetches(&rel, 0);
    }

    fn read(&mut self, rel: RelTag, blkno: BlockNumber, buf: &mut [u8]) -> Result<(), SmgrError> {
        self.forks.check(&rel)?;
        check_page_size(buf)?;
        let hdr = self.request_hdr()?;
        self.read_page(rel, blkno, hdr, buf)
    }

    fn read_at_lsn(
        &mut self,
        rel: RelTag,
        blkno: BlockNumber,
        lsn: Lsn,
        latest: bool,
        buf: &mut [u8],
    ) -> Result<(), SmgrError> {
        check_page_size(buf)?;
        let hdr = PagestreamRequestHeader {
            latest,
            lsn,
            region: 0,
        };
        self.read_page(rel, blkno, hdr, buf)
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
        self.wal_log_page(rel, blkno, page)?;
        self.discard_prefetched_block(&rel, blkno);
        Ok(())
    }

    fn writeback(
        &mut self,
        rel: RelTag,
        _blkno: BlockNumber,
        _nblocks: BlockNumber,
    ) -> Result<(), SmgrError> {
        // Pages are never written to the page server, so there is nothing to push.
        self.forks.check(&rel)
    }

    fn nblocks(&mut self, rel: RelTag) -> Result<BlockNumber, SmgrError> {
        self.forks.check(&rel)?;
        if let Some(nblocks) = self.relsize_cache.get(&rel) {
            return Ok(nblocks);
        }
        let hdr = self.request_hdr()?;
        match self.round_trip(PagestreamFeMessage::Nblocks(PagestreamNblocksRequest { hdr, rel }))? {
            PagestreamBeMessage::Nblocks(response) => {
                trace!("{rel} has {} blocks at {}", response.n_blocks, response.lsn);
                self.relsize_cache.set(rel, response.n_blocks);
                Ok(response.n_blocks)
            }
            other => Err(unexpected(other)),
        }
    }

    fn dbsize(&mut self, dbnode: Oid) -> Result<i64, SmgrError> {
        let hdr = self.request_hdr()?;
        match self.round_trip(PagestreamFeMessage::DbSize(PagestreamDbSizeRequest { hdr, dbnode }))? {
            PagestreamBeMessage::DbSize(response) => Ok(response.db_size),
            other => Err(unexpected(other)),
        }
    }

    fn truncate(&mut self, rel: RelTag, nblocks: BlockNumber) -> Result<(), SmgrError> {
        self.forks.check(&rel)?;
        debug!("truncate {rel} to {nblocks} blocks");
        self.relsize_cache.set(rel, nblocks);
        self.discard_prefetches(&rel, nblocks);
        Ok(())
    }

    fn immedsync(&mut self, rel: RelTag) -> Result<(), SmgrError> {
        self.forks.check(&rel)?;
        trace!("immedsync {rel} is a no-op");
        Ok(())
    }
}
